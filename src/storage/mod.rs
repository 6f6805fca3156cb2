//! Storage module for persisting run checkpoints
//!
//! This module handles all durable state for the engine, including:
//! - SQLite database initialization and schema migration
//! - Run records and per-item retry state
//! - Buffered in-progress writes with synchronous terminal writes
//! - Run id resolution for resumption

mod run_pointer;
mod schema;
mod sqlite;
mod traits;

pub use run_pointer::{
    clear_run_pointer, generate_run_id, resolve_run_id, run_pointer_path, write_run_pointer,
    RunIdSource, RUN_POINTER_FILE,
};
pub use schema::{get_schema_version, initialize_schema, SCHEMA_VERSION};
pub use sqlite::SqliteCheckpoint;
pub use traits::{CheckpointStore, StorageError, StorageResult};

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Checkpoint store shared between the queue, the workers and the lifecycle
/// controller
///
/// When both are needed, take the queue lock before this one.
pub type SharedStore = Arc<Mutex<dyn CheckpointStore>>;

/// Opens the checkpoint database and wraps it for sharing
pub fn open_store(path: &Path, batch_size: usize) -> StorageResult<SharedStore> {
    let store = SqliteCheckpoint::open(path, batch_size)?;
    Ok(Arc::new(Mutex::new(store)))
}

/// Wraps any store for sharing
pub fn share<S: CheckpointStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}
