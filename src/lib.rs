//! Harvest Engine: a resumable, fault-tolerant scrape work queue
//!
//! This crate drives long-running scrapers against hostile targets. It keeps a
//! durable per-item checkpoint, runs a bounded pool of workers that each own one
//! browser/HTTP session, rotates identities when the target starts blocking, and
//! resumes a killed run without reprocessing finished work.

pub mod config;
pub mod engine;
pub mod identity;
pub mod lifecycle;
pub mod output;
pub mod session;
pub mod state;
pub mod storage;

use std::time::Duration;
use thiserror::Error;

/// Main error type for run-level failures
///
/// Per-item failures never surface here; they are classified at the worker
/// boundary and folded into the item's checkpoint row.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("Invalid state transition for {key}: {from:?} -> {to:?}")]
    InvalidTransition {
        key: String,
        from: state::ItemStatus,
        to: state::ItemStatus,
    },

    #[error("Output error: {0}")]
    Output(#[from] output::OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
///
/// These are fatal at startup; nothing downstream retries them.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid value for environment variable {name}: '{value}'")]
    Env { name: String, value: String },

    #[error("No identities available and identities.required is set")]
    MissingIdentities,
}

/// Errors raised while acquiring one work item
///
/// This is the failure taxonomy consumed by the classifier. Extractors and
/// drivers return it; the worker never lets it escape.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Session unusable: {0}")]
    FatalSession(String),

    #[error("Blocked by target: {0}")]
    BlockSignal(String),

    #[error("Expected content missing: {0}")]
    DataInvalid(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            FetchError::TransientNetwork(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            FetchError::Other(err.to_string())
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for a single fetch
pub type FetchResult<T> = std::result::Result<T, FetchError>;

// Re-export commonly used types
pub use config::Config;
pub use engine::{Outcome, RunController, RunOutcome};
pub use state::{ItemStatus, RunStatus, WorkItem};
