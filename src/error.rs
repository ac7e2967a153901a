//! Error types shared across the realtime layer

use thiserror::Error;

/// Failures reported by the transport backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("credential unavailable: {0}")]
    Auth(String),
    #[error("channel error: {0}")]
    Channel(String),
}

/// Failures while fetching an authoritative snapshot.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("snapshot query failed: {0}")]
    Backend(String),
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures while loading or saving the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config dir not found")]
    NoConfigDir,
}
