//! AI task status for one project (`ai_tasks`)

use crate::RealtimeClient;
use crate::resource::{Record, RealtimeResource, ResourceConfig, SnapshotFetcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TABLE: &str = "ai_tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiTask {
    pub id: String,
    pub project_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Record for AiTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> &str {
        &self.created_at
    }
}

pub fn config(
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<AiTask>>,
) -> ResourceConfig<AiTask> {
    ResourceConfig::new(TABLE, fetcher).scoped("project_id", project_id)
}

pub fn resource(
    client: RealtimeClient,
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<AiTask>>,
) -> RealtimeResource<AiTask> {
    RealtimeResource::new(client, config(project_id, fetcher))
}

/// Newest task that has not finished yet.
pub fn active_task(tasks: &[AiTask]) -> Option<&AiTask> {
    tasks.iter().rev().find(|t| !t.status.is_finished())
}
