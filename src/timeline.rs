//! Event taxonomy and timeline replay
//!
//! Agent activity arrives as loosely typed rows (`agent_events`). They are
//! classified into a small set of typed events and merged into one ordered,
//! deduplicated feed: the historical snapshot first, then live events as they
//! arrive.

use crate::resource::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::trace;

/// One row of the `agent_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Record for RawEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn sort_key(&self) -> &str {
        &self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTransition {
    Enter,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Update,
    Delete,
}

impl FileOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Typed body of a [`TimelineEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    AgentPhase {
        phase: String,
        transition: PhaseTransition,
    },
    ToolCall {
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        input: Value,
    },
    FileUpdate {
        path: String,
        operation: FileOperation,
    },
    Error {
        message: String,
    },
    /// Plain log lines, plus anything that could not be classified
    Log {
        level: String,
        message: String,
        /// Original `type` when the event was not a log to begin with
        #[serde(skip_serializing_if = "Option::is_none")]
        source_type: Option<String>,
    },
}

impl EventBody {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentPhase { .. } => "agent_phase",
            Self::ToolCall { .. } => "tool_call",
            Self::FileUpdate { .. } => "file_update",
            Self::Error { .. } => "error",
            Self::Log { .. } => "log",
        }
    }
}

/// Classified activity event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(flatten)]
    pub body: EventBody,
}

fn json_string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn message_of(payload: &Value) -> String {
    match json_string_field(payload, &["message", "text", "msg"]) {
        Some(message) => message.to_string(),
        None => match payload {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

fn phase_body(payload: &Value) -> Option<EventBody> {
    let phase = json_string_field(payload, &["phase", "name"])?;
    let transition = match json_string_field(payload, &["transition", "action", "state"])? {
        "enter" | "start" | "started" => PhaseTransition::Enter,
        "exit" | "end" | "ended" | "complete" | "completed" => PhaseTransition::Exit,
        _ => return None,
    };
    Some(EventBody::AgentPhase {
        phase: phase.to_string(),
        transition,
    })
}

fn tool_body(payload: &Value) -> Option<EventBody> {
    let tool = json_string_field(payload, &["tool", "tool_name", "name"])?;
    let input = payload
        .get("input")
        .or_else(|| payload.get("args"))
        .cloned()
        .unwrap_or(Value::Null);
    let label = json_string_field(&input, &["path", "file_path", "command", "query"])
        .map(ToString::to_string);
    Some(EventBody::ToolCall {
        tool: tool.to_string(),
        label,
        input,
    })
}

fn file_body(payload: &Value) -> Option<EventBody> {
    let path = json_string_field(payload, &["path", "file_path"])?;
    let operation = match json_string_field(payload, &["operation", "op", "action"]) {
        Some("create" | "created" | "add") => FileOperation::Create,
        Some("delete" | "deleted" | "remove") => FileOperation::Delete,
        _ => FileOperation::Update,
    };
    Some(EventBody::FileUpdate {
        path: path.to_string(),
        operation,
    })
}

/// Classify one raw row. Never fails: unknown types and malformed payloads
/// become `log` events carrying the original type.
pub fn classify(raw: &RawEvent) -> TimelineEvent {
    let typed = match raw.kind.as_str() {
        "agent_phase" => phase_body(&raw.payload),
        "tool_call" => tool_body(&raw.payload),
        "file_update" => file_body(&raw.payload),
        "error" => Some(EventBody::Error {
            message: message_of(&raw.payload),
        }),
        "log" => Some(EventBody::Log {
            level: json_string_field(&raw.payload, &["level"])
                .unwrap_or("info")
                .to_string(),
            message: message_of(&raw.payload),
            source_type: None,
        }),
        _ => None,
    };
    let body = typed.unwrap_or_else(|| {
        trace!(id = %raw.id, kind = %raw.kind, "unclassified event kept as log");
        EventBody::Log {
            level: "info".to_string(),
            message: message_of(&raw.payload),
            source_type: Some(raw.kind.clone()),
        }
    });
    TimelineEvent {
        id: raw.id.clone(),
        timestamp: raw.timestamp.clone(),
        task_id: raw.task_id.clone(),
        project_id: raw.project_id.clone(),
        body,
    }
}

fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

struct Entry {
    at: Option<DateTime<Utc>>,
    seq: u64,
    event: TimelineEvent,
}

impl Entry {
    /// Parsed timestamps first in time order, unparseable ones after them in
    /// arrival order.
    fn key(&self) -> (bool, Option<DateTime<Utc>>, u64) {
        (self.at.is_none(), self.at, self.seq)
    }
}

/// Ordered, deduplicated activity feed.
#[derive(Default)]
pub struct Timeline {
    entries: Vec<Entry>,
    seen: HashSet<String>,
    next_seq: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a historical snapshot. Returns the number of new events.
    pub fn replay(&mut self, snapshot: impl IntoIterator<Item = RawEvent>) -> usize {
        let mut snapshot: Vec<RawEvent> = snapshot.into_iter().collect();
        snapshot.sort_by_cached_key(|raw| {
            let at = parse_timestamp(&raw.timestamp);
            (at.is_none(), at)
        });
        snapshot
            .into_iter()
            .filter(|raw| self.insert(raw))
            .count()
    }

    /// Append one live event. Returns `false` for an id already seen.
    pub fn push_live(&mut self, raw: &RawEvent) -> bool {
        self.insert(raw)
    }

    fn insert(&mut self, raw: &RawEvent) -> bool {
        if !self.seen.insert(raw.id.clone()) {
            trace!(id = %raw.id, "duplicate event skipped");
            return false;
        }
        self.next_seq += 1;
        let entry = Entry {
            at: parse_timestamp(&raw.timestamp),
            seq: self.next_seq,
            event: classify(raw),
        };
        let key = entry.key();
        let at = self.entries.partition_point(|e| e.key() <= key);
        self.entries.insert(at, entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn events(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.entries.iter().map(|e| &e.event)
    }

    pub fn for_task<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a TimelineEvent> {
        self.events()
            .filter(move |e| e.task_id.as_deref() == Some(task_id))
    }

    /// Phase entered most recently and not exited since.
    ///
    /// Rebuilt from the whole phase history on every call, so a missed exit
    /// only affects the phase it belongs to.
    pub fn current_phase(&self) -> Option<&str> {
        let mut open: Vec<&str> = Vec::new();
        for event in self.events() {
            let EventBody::AgentPhase { phase, transition } = &event.body else {
                continue;
            };
            open.retain(|p| *p != phase.as_str());
            if *transition == PhaseTransition::Enter {
                open.push(phase.as_str());
            }
        }
        open.last().copied()
    }
}
