//! Output module for extracted records and run reports
//!
//! This module handles:
//! - Writing extracted records as JSON Lines
//! - Loading and printing checkpoint statistics

mod sink;
pub mod stats;

pub use sink::{JsonlSink, NullSink, RecordSink};
pub use stats::{load_statistics, print_statistics, RunStatistics};

use thiserror::Error;

/// Errors that can occur during output operations
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to format record: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;
