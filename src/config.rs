//! Persistence for realtime tuning (config.json).
//!
//! Saved to the platform config directory, e.g.
//! `~/Library/Application Support/livesync/config.json` on macOS or
//! `~/.config/livesync/config.json` on Linux. Missing or invalid files fall
//! back to defaults.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Realtime tuning knobs (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// First reconnect delay; doubles per attempt
    pub retry_base_delay_ms: u64,
    /// Upper bound for the reconnect delay
    pub retry_max_delay_ms: u64,
    /// Reconnect attempts before a channel is reported as failed
    pub max_retries: u32,
    /// Minimum spacing between non-forced snapshot fetches
    pub throttle_ms: u64,
    /// Delay between `SUBSCRIBED` and the catch-up refresh
    pub catch_up_delay_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            max_retries: 5,
            throttle_ms: 1000,
            catch_up_delay_ms: 300,
        }
    }
}

impl RealtimeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn catch_up_delay(&self) -> Duration {
        Duration::from_millis(self.catch_up_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("livesync"))
}

/// Location of config.json, if the platform has a config directory.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from disk, returning defaults if the file is missing or invalid.
pub fn load_config() -> RealtimeConfig {
    let Some(path) = config_path() else {
        return RealtimeConfig::default();
    };
    load_config_from(&path)
}

/// Save config to disk.
pub fn save_config(config: &RealtimeConfig) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_config_to(config, &path)
}

// ---------------------------------------------------------------------------
// Path-parameterised helpers (used by public API and tests)
// ---------------------------------------------------------------------------

pub fn load_config_from(path: &Path) -> RealtimeConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => RealtimeConfig::default(),
    }
}

pub fn save_config_to(config: &RealtimeConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    atomic_write(path, json.as_bytes())
}

/// Write to a temp file in the same directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
