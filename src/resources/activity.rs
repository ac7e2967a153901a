//! Agent activity feed (`agent_events`)
//!
//! The live resource keeps the raw rows; the feed observes its changes and
//! folds snapshots and live rows into a [`Timeline`] in the order they land.

use super::{short_path, truncate};
use crate::RealtimeClient;
use crate::channel::EventKind;
use crate::error::TransportError;
use crate::lock;
use crate::resource::{RealtimeResource, ResourceChange, ResourceConfig, SnapshotFetcher};
use crate::timeline::{EventBody, PhaseTransition, RawEvent, Timeline, TimelineEvent};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const TABLE: &str = "agent_events";

/// Rows of `agent_events` are the timeline's raw events.
pub type AgentEventRow = RawEvent;

const SUMMARY_WIDTH: usize = 80;

pub fn config(
    project_id: Option<String>,
    fetcher: Arc<dyn SnapshotFetcher<AgentEventRow>>,
) -> ResourceConfig<AgentEventRow> {
    ResourceConfig::new(TABLE, fetcher)
        .scoped("project_id", project_id)
        .events([EventKind::Insert])
}

/// Activity timeline for one project.
#[derive(Clone)]
pub struct ActivityFeed {
    resource: RealtimeResource<AgentEventRow>,
    timeline: Arc<Mutex<Timeline>>,
}

impl ActivityFeed {
    pub fn new(resource: RealtimeResource<AgentEventRow>) -> Self {
        let timeline = Arc::new(Mutex::new(Timeline::new()));
        let weak = Arc::downgrade(&timeline);
        resource.on_change(move |change| {
            let Some(timeline) = weak.upgrade() else {
                return;
            };
            let mut timeline = lock(&timeline);
            let added = match change {
                ResourceChange::Snapshot(rows) => timeline.replay(rows.iter().cloned()),
                ResourceChange::Upsert(row) => usize::from(timeline.push_live(row)),
                // Agent events are append-only.
                ResourceChange::Remove(_) => 0,
            };
            if added > 0 {
                debug!(added, total = timeline.len(), "activity feed updated");
            }
        });
        Self { resource, timeline }
    }

    pub fn for_project(
        client: RealtimeClient,
        project_id: Option<String>,
        fetcher: Arc<dyn SnapshotFetcher<AgentEventRow>>,
    ) -> Self {
        Self::new(RealtimeResource::new(client, config(project_id, fetcher)))
    }

    pub fn resource(&self) -> &RealtimeResource<AgentEventRow> {
        &self.resource
    }

    pub async fn mount(&self) -> Result<(), TransportError> {
        self.resource.mount().await
    }

    pub fn unmount(&self) {
        self.resource.unmount();
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        lock(&self.timeline).events().cloned().collect()
    }

    pub fn task_events(&self, task_id: &str) -> Vec<TimelineEvent> {
        lock(&self.timeline).for_task(task_id).cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.timeline).contains(id)
    }

    pub fn current_phase(&self) -> Option<String> {
        lock(&self.timeline)
            .current_phase()
            .map(ToString::to_string)
    }

    pub fn len(&self) -> usize {
        lock(&self.timeline).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.timeline).is_empty()
    }
}

/// One-line description of an event for terminal output.
pub fn summarize(event: &TimelineEvent) -> String {
    let text = match &event.body {
        EventBody::AgentPhase { phase, transition } => match transition {
            PhaseTransition::Enter => format!("entered {phase}"),
            PhaseTransition::Exit => format!("left {phase}"),
        },
        EventBody::ToolCall { tool, label, .. } => match label {
            Some(label) => format!("{tool} {}", short_path(label)),
            None => tool.clone(),
        },
        EventBody::FileUpdate { path, operation } => format!("{} {path}", operation.as_str()),
        EventBody::Error { message } => message.clone(),
        EventBody::Log {
            message,
            source_type,
            ..
        } => match source_type {
            Some(kind) => format!("[{kind}] {message}"),
            None => message.clone(),
        },
    };
    truncate(&text, SUMMARY_WIDTH).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChangeEvent, ChannelKey};
    use crate::retry::RetryPolicy;
    use crate::timeline::classify;
    use crate::transport::memory::MemoryBackend;
    use serde_json::json;

    fn row(id: &str, ts: &str, kind: &str, payload: serde_json::Value) -> AgentEventRow {
        RawEvent {
            id: id.into(),
            kind: kind.into(),
            timestamp: ts.into(),
            task_id: None,
            project_id: Some("P1".into()),
            payload,
        }
    }

    #[test]
    fn summaries() {
        let tool = classify(&row(
            "1",
            "t",
            "tool_call",
            json!({"tool": "edit", "input": {"path": "src/App.tsx"}}),
        ));
        assert_eq!(summarize(&tool), "edit App.tsx");

        let file = classify(&row(
            "2",
            "t",
            "file_update",
            json!({"path": "src/App.tsx", "operation": "delete"}),
        ));
        assert_eq!(summarize(&file), "delete src/App.tsx");

        let unknown = classify(&row("3", "t", "metrics", json!({"message": "x".repeat(200)})));
        assert_eq!(summarize(&unknown).chars().count(), SUMMARY_WIDTH);
    }

    #[tokio::test(start_paused = true)]
    async fn live_rows_land_in_arrival_order() {
        let backend = Arc::new(MemoryBackend::with_credential("tok"));
        let client = RealtimeClient::new(backend.clone(), RetryPolicy::default());
        let fetcher = crate::resource::fetch_fn(|_scope: Option<String>| async {
            Ok(vec![
                row(
                    "b",
                    "2026-01-01T00:00:02Z",
                    "agent_phase",
                    json!({"phase": "build", "transition": "enter"}),
                ),
                row("a", "2026-01-01T00:00:01Z", "log", json!({"message": "start"})),
            ])
        });
        let feed = ActivityFeed::for_project(client, Some("P1".into()), fetcher);
        feed.mount().await.unwrap();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.current_phase().as_deref(), Some("build"));

        let key = ChannelKey::eq(TABLE, "project_id", "P1");
        for (id, message) in [("z", "first"), ("y", "second")] {
            let mut live = row(id, "2026-01-01T00:00:03Z", "log", json!({"message": message}));
            live.task_id = Some("T1".into());
            let record = serde_json::to_value(&live).unwrap();
            backend.emit(&key, ChangeEvent::insert(TABLE, record));
        }
        assert_eq!(feed.len(), 4);
        let ids: Vec<String> = feed.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b", "z", "y"]);
        let task: Vec<String> = feed.task_events("T1").into_iter().map(|e| e.id).collect();
        assert_eq!(task, vec!["z", "y"]);
        assert!(feed.contains("y"));
        assert!(!feed.contains("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn local_updates_reach_the_timeline() {
        let client = RealtimeClient::new(
            Arc::new(MemoryBackend::with_credential("tok")),
            RetryPolicy::default(),
        );
        let fetcher =
            crate::resource::fetch_fn(|_scope: Option<String>| async { Ok(Vec::new()) });
        let feed = ActivityFeed::for_project(client, Some("P1".into()), fetcher);
        feed.mount().await.unwrap();

        feed.resource().append_item(row(
            "c",
            "2026-01-01T00:00:03Z",
            "agent_phase",
            json!({"phase": "build", "transition": "enter"}),
        ));
        assert_eq!(feed.current_phase().as_deref(), Some("build"));
        // Re-delivery of a known id is ignored by the timeline.
        assert!(feed.resource().update_item("c", |r| r.payload = json!({"phase": "test"})));
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.current_phase().as_deref(), Some("build"));
    }
}
