//! Engine module - queue, retry accounting and run orchestration
//!
//! This module contains the moving parts of a run:
//! - Classifying failures and deciding what happens to an item next
//! - The shared work queue with round and backoff bookkeeping
//! - The worker loop
//! - The run controller tying store, queue, workers and lifecycle together

mod classifier;
mod controller;
mod queue;
mod retry;
mod worker;

pub use classifier::{default_rules, Classifier, ClassifierRule, Outcome};
pub use controller::{RunController, RunOptions, RunOutcome};
pub use queue::{QueueEvent, TakeResult, WorkQueue};
pub use retry::{Decision, RetryPolicy};
pub use worker::{Pacing, Worker, WorkerContext, WorkerExit, WorkerReport};
