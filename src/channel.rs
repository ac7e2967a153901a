//! Channel-level types: keys, statuses, close reasons and change payloads
//!
//! These are the values that flow between the transport, the multiplexer and
//! every live resource. The transport backend is agnostic of resources; it only
//! knows tables, filters and raw JSON records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifies one logical subscription target at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub table: String,
    pub filter: Option<String>,
}

impl ChannelKey {
    pub fn new(table: impl Into<String>, filter: Option<String>) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    /// Key for `table` filtered by `column=eq.value`.
    pub fn eq(table: impl Into<String>, column: &str, value: &str) -> Self {
        Self::new(table, Some(format!("{column}=eq.{value}")))
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "realtime:{}:{}",
            self.table,
            self.filter.as_deref().unwrap_or("*")
        )
    }
}

/// Kind of row change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// Every kind (`*` on the wire)
    #[default]
    #[serde(rename = "*")]
    All,
}

impl EventKind {
    /// Whether a subscription registered for `self` wants an event of `kind`.
    pub fn accepts(self, kind: EventKind) -> bool {
        self == EventKind::All || self == kind
    }
}

/// Lifecycle status of a channel as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    Retrying,
    Closed,
    ChannelError,
    TimedOut,
}

impl ChannelStatus {
    /// `CLOSED`, `CHANNEL_ERROR` and `TIMED_OUT` end a channel's lifetime.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::ChannelError | Self::TimedOut)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Subscribed => "SUBSCRIBED",
            Self::Retrying => "RETRYING",
            Self::Closed => "CLOSED",
            Self::ChannelError => "CHANNEL_ERROR",
            Self::TimedOut => "TIMED_OUT",
        };
        f.write_str(s)
    }
}

/// Why a channel went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Cleanup,
    /// For backends and callers reporting a close they caused by
    /// unsubscribing. The registry never emits it: a leaving subscriber gets
    /// no further callbacks and a retired channel's final `CLOSED` is dropped.
    Unsubscribe,
    AuthChange,
    Unexpected,
}

impl CloseReason {
    /// Closes initiated by the application itself.
    pub fn is_expected(self) -> bool {
        !matches!(self, Self::Unexpected)
    }
}

/// Metadata attached to every status callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChangeMeta {
    pub generation: u64,
    pub close_reason: Option<CloseReason>,
    pub is_expected_close: bool,
    /// Retry attempt this status belongs to (`0` outside of retries)
    pub attempt: u32,
    /// Set on the terminal status reported once retries are used up
    pub retries_exhausted: bool,
}

impl StatusChangeMeta {
    pub fn live(generation: u64) -> Self {
        Self {
            generation,
            close_reason: None,
            is_expected_close: false,
            attempt: 0,
            retries_exhausted: false,
        }
    }

    pub fn closed(generation: u64, reason: CloseReason) -> Self {
        Self {
            generation,
            close_reason: Some(reason),
            is_expected_close: reason.is_expected(),
            attempt: 0,
            retries_exhausted: false,
        }
    }

    /// Whether the close was initiated by the application.
    pub fn expected(&self) -> bool {
        self.is_expected_close || self.close_reason.is_some_and(CloseReason::is_expected)
    }
}

/// One status notification delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ChannelStatus,
    pub error: Option<String>,
    pub meta: StatusChangeMeta,
}

/// Row change pushed by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    #[serde(rename = "eventType")]
    pub kind: EventKind,
    /// Row after the change (inserts and updates)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    /// Row before the change (deletes, and updates when the table replicates it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Insert,
            new: Some(record),
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn update(table: impl Into<String>, record: Value) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Update,
            new: Some(record),
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Delete,
            new: None,
            old: Some(old),
            commit_timestamp: None,
        }
    }
}
