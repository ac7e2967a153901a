//! Project file tree (`project_files`)

use super::short_path;
use crate::RealtimeClient;
use crate::resource::{Record, RealtimeResource, ResourceConfig, SnapshotFetcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TABLE: &str = "project_files";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub id: String,
    pub project_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ProjectFile {
    pub fn name(&self) -> &str {
        short_path(&self.path)
    }

    /// Parent directory, `""` for files at the root.
    pub fn dir(&self) -> &str {
        self.path.rsplit_once('/').map_or("", |(dir, _)| dir)
    }
}

impl Record for ProjectFile {
    fn id(&self) -> &str {
        &self.id
    }

    /// Files are listed by path, not by time.
    fn sort_key(&self) -> &str {
        &self.path
    }
}

pub fn config(
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<ProjectFile>>,
) -> ResourceConfig<ProjectFile> {
    ResourceConfig::new(TABLE, fetcher).scoped("project_id", project_id)
}

pub fn resource(
    client: RealtimeClient,
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<ProjectFile>>,
) -> RealtimeResource<ProjectFile> {
    RealtimeResource::new(client, config(project_id, fetcher))
}

/// Group files by directory.
pub fn by_directory(files: &[ProjectFile]) -> BTreeMap<&str, Vec<&ProjectFile>> {
    let mut tree: BTreeMap<&str, Vec<&ProjectFile>> = BTreeMap::new();
    for file in files {
        tree.entry(file.dir()).or_default().push(file);
    }
    tree
}
