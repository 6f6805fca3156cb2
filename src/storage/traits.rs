//! Checkpoint store trait and error types
//!
//! This module defines the interface the engine uses to persist run metadata and
//! per-item state. The store is the only thing that survives process death.

use crate::state::{RunCounters, RunRecord, WorkItem};
use thiserror::Error;

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No checkpoint exists for run '{0}'")]
    RunNotFound(String),

    #[error("Run '{0}' already exists")]
    RunExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable record of work-item state and run metadata
///
/// Implementations are driven through a single lock, so every method sees the
/// store exclusively. Writes of in-progress churn may be buffered; terminal
/// transitions (`Done`, `FailedTerminal`) must be durable when `upsert_item`
/// returns.
pub trait CheckpointStore: Send {
    // ===== Run Management =====

    /// Creates a new run row
    fn create_run(&mut self, run: &RunRecord) -> StorageResult<()>;

    /// Gets a run by id without loading its items
    fn find_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>>;

    /// Gets the most recently started run
    fn latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Persists status, round, counters and finish time of a run
    fn update_run(&mut self, run: &RunRecord) -> StorageResult<()>;

    /// Deletes a run and all of its items
    fn delete_run(&mut self, run_id: &str) -> StorageResult<()>;

    // ===== Item Management =====

    /// Loads a run and its items
    ///
    /// Items left `InProgress` by a dead process come back as `Pending`.
    /// Fails with [`StorageError::RunNotFound`] when no checkpoint exists.
    fn load(&mut self, run_id: &str) -> StorageResult<(RunRecord, Vec<WorkItem>)>;

    /// Inserts items that do not exist yet; returns how many were added
    fn seed_items(&mut self, run_id: &str, items: &[WorkItem]) -> StorageResult<usize>;

    /// Persists one item's state
    fn upsert_item(&mut self, run_id: &str, item: &WorkItem) -> StorageResult<()>;

    /// Forces every buffered write to durable storage
    fn flush(&mut self) -> StorageResult<()>;

    /// Number of buffered writes not yet flushed
    fn pending_writes(&self) -> usize;

    /// Returns terminal items to `Pending` for a refresh pass
    ///
    /// Retry counters are cleared so the refreshed item gets a full budget.
    fn reset_terminal(&mut self, run_id: &str, include_failed: bool) -> StorageResult<usize>;

    // ===== Statistics =====

    /// Counts a run's items by status
    fn count_items(&self, run_id: &str) -> StorageResult<RunCounters>;

    /// Items that failed terminally, with their last error
    fn failed_items(&self, run_id: &str) -> StorageResult<Vec<(String, Option<String>)>>;
}
