//! Error taxonomy for a benchmark run.
//!
//! Lifecycle failures (`RunError`) abort a run before any traffic is recorded.
//! Per-message failures are `DriverError`s returned from `send` and folded into
//! the metrics error log by the orchestrator.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid or unreadable run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors raised by a protocol driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver failed to start: {0}")]
    Start(String),
    #[error("operation `{0}` is not supported by this driver")]
    Unsupported(&'static str),
    #[error("send failed: {0}")]
    Send(String),
    #[error("driver is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure to harvest passive-mode results from a driver side channel.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("result log {0} not found")]
    Missing(PathBuf),
    #[error("failed to read result log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no parseable records in {0}")]
    Empty(PathBuf),
}

/// Failure to persist or reload a run summary.
#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid summary JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Fatal errors that prevent a run from producing a summary.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown protocol `{protocol}` (available: {})", available.join(", "))]
    DriverLoad {
        protocol: String,
        available: Vec<String>,
    },
    #[error("failed to construct `{protocol}` driver: {source}")]
    DriverInit {
        protocol: String,
        #[source]
        source: DriverError,
    },
    #[error("{0}")]
    DriverStart(#[source] DriverError),
}
