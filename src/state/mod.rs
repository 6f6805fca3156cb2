//! State module for tracking work items and runs
//!
//! # Components
//!
//! - `ItemStatus`: lifecycle of a single work item (pending, in progress, done, failed)
//! - `WorkItem`: one unit of scrape work with its persisted retry state
//! - `RunStatus` / `RunRecord`: one execution of the engine and its counters

mod item_state;
mod run_state;

// Re-export main types
pub use item_state::{ItemStatus, WorkItem};
pub use run_state::{RunCounters, RunRecord, RunStatus};
