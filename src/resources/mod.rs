//! Per-resource adapters
//!
//! Each submodule binds one backend table to the reconciliation engine: the
//! row type, the scope column and the event kinds it listens to.

pub mod activity;
pub mod files;
pub mod logs;
pub mod messages;
pub mod tasks;

pub use activity::{ActivityFeed, AgentEventRow};
pub use files::ProjectFile;
pub use logs::{BuildLog, LogLevel};
pub use messages::{ChatMessage, MessageRole};
pub use tasks::{AiTask, TaskStatus};

/// Truncate a string to at most `max` characters (by Unicode char boundary).
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Extract the final path component (filename) from a slash-separated path.
pub(crate) fn short_path(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
