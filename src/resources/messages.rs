//! Chat messages for one project (`chat_messages`)

use crate::RealtimeClient;
use crate::channel::EventKind;
use crate::resource::{Record, RealtimeResource, ResourceConfig, SnapshotFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const TABLE: &str = "chat_messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub project_id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Record for ChatMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> &str {
        &self.created_at
    }
}

/// Messages of `project_id`, listening to inserts, edits and deletes as
/// three subscriptions on the one project channel.
pub fn config(
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<ChatMessage>>,
) -> ResourceConfig<ChatMessage> {
    ResourceConfig::new(TABLE, fetcher)
        .scoped("project_id", project_id)
        .events([EventKind::Insert, EventKind::Update, EventKind::Delete])
}

pub fn resource(
    client: RealtimeClient,
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<ChatMessage>>,
) -> RealtimeResource<ChatMessage> {
    RealtimeResource::new(client, config(project_id, fetcher))
}

/// Most recent assistant reply, if any.
pub fn last_assistant(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
}
