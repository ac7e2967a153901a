//! Build output for one task (`build_logs`)
//!
//! Log lines are append-only, so only inserts are subscribed.

use crate::RealtimeClient;
use crate::channel::EventKind;
use crate::resource::{Record, RealtimeResource, ResourceConfig, SnapshotFetcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TABLE: &str = "build_logs";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildLog {
    pub id: String,
    pub task_id: String,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    pub created_at: String,
}

impl Record for BuildLog {
    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> &str {
        &self.created_at
    }
}

pub fn config(
    task_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<BuildLog>>,
) -> ResourceConfig<BuildLog> {
    ResourceConfig::new(TABLE, fetcher)
        .scoped("task_id", task_id)
        .events([EventKind::Insert])
}

pub fn resource(
    client: RealtimeClient,
    task_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<BuildLog>>,
) -> RealtimeResource<BuildLog> {
    RealtimeResource::new(client, config(task_id, fetcher))
}

/// Lines at `min` or above.
pub fn at_least(logs: &[BuildLog], min: LogLevel) -> impl Iterator<Item = &BuildLog> {
    logs.iter().filter(move |l| l.level >= min)
}
