//! Stop requests, signal handling and the shutdown sequence
//!
//! Stopping happens in two steps. The shutdown token stops intake: workers
//! finish the item they hold and exit. If they have not settled within the
//! grace period the abort token fires, and workers drop their in-flight call
//! and hand the item back untouched.

use crate::engine::WorkQueue;
use crate::storage::SharedStore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// How long aborted workers get to hand their items back
const ABORT_WAIT: Duration = Duration::from_secs(5);

/// Why a run stopped before its queue drained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Operator signal (Ctrl-C, SIGTERM)
    Interrupted(String),

    /// A hard resource limit was crossed
    ResourceExhausted(String),

    /// Every worker gave up on its sessions
    WorkersExhausted,

    /// Unrecoverable error such as checkpoint I/O
    Fatal(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted(signal) => write!(f, "interrupted by {}", signal),
            Self::ResourceExhausted(reason) => write!(f, "resource limit: {}", reason),
            Self::WorkersExhausted => write!(f, "all workers exhausted their session restarts"),
            Self::Fatal(reason) => write!(f, "fatal error: {}", reason),
        }
    }
}

/// Result of the shutdown sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// In-flight items handed back to PENDING
    pub released: usize,

    /// Workers that had to be aborted after the grace period
    pub aborted_workers: usize,

    /// Whether the final checkpoint flush succeeded
    pub flushed: bool,
}

/// Owns the stop tokens and the store reference used for final flushes
pub struct LifecycleController {
    shutdown: CancellationToken,
    abort: CancellationToken,
    reason: Mutex<Option<StopReason>>,
    store: SharedStore,
    grace: Duration,
}

impl LifecycleController {
    pub fn new(store: SharedStore, grace: Duration) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            reason: Mutex::new(None),
            store,
            grace,
        }
    }

    /// Fires when intake should stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Fires when in-flight work should be dropped
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Asks the run to stop; the first reason given is kept
    pub fn request_stop(&self, reason: StopReason) {
        {
            let mut current = self.reason.lock();
            if current.is_none() {
                tracing::info!("Stop requested: {}", reason);
                *current = Some(reason);
            }
        }
        self.shutdown.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.reason.lock().clone()
    }

    /// Flushes the checkpoint; returns false (and logs) on failure
    pub fn flush(&self) -> bool {
        match self.store.lock().flush() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Checkpoint flush failed: {}", e);
                false
            }
        }
    }

    /// Listens for Ctrl-C and SIGTERM
    ///
    /// The first signal requests a graceful stop; a second one skips the
    /// grace period.
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let signal = tokio::select! {
                _ = this.shutdown.cancelled() => None,
                signal = wait_for_signal() => Some(signal),
            };

            if let Some(signal) = signal {
                tracing::warn!(
                    "Received {}, stopping once in-flight items settle (send again to force)",
                    signal
                );
                this.request_stop(StopReason::Interrupted(signal.to_string()));
            }

            tokio::select! {
                _ = this.abort.cancelled() => {}
                signal = wait_for_signal() => {
                    tracing::warn!("Received {} again, aborting in-flight work", signal);
                    this.abort.cancel();
                }
            }
        })
    }

    /// Runs the shutdown sequence
    ///
    /// Closes the queue, waits up to the grace period for workers, aborts the
    /// stragglers, hands back whatever is still in flight and flushes. Results
    /// of workers that finished are returned alongside the report.
    pub async fn drain<T: 'static>(
        &self,
        queue: &WorkQueue,
        workers: &mut JoinSet<T>,
    ) -> (Vec<Result<T, JoinError>>, ShutdownReport) {
        queue.close();
        let mut results = Vec::new();
        let mut report = ShutdownReport::default();

        if !join_until(workers, self.grace, &mut results).await {
            tracing::warn!(
                "{} worker(s) still busy after {:?}, aborting in-flight work",
                workers.len(),
                self.grace
            );
            self.abort.cancel();

            if !join_until(workers, ABORT_WAIT, &mut results).await {
                report.aborted_workers = workers.len();
                workers.abort_all();
                while let Some(result) = workers.join_next().await {
                    results.push(result);
                }
            }
        }

        report.released = match queue.release_all_in_flight() {
            Ok(released) => released,
            Err(e) => {
                tracing::error!("Failed to release in-flight items: {}", e);
                0
            }
        };
        report.flushed = self.flush();

        (results, report)
    }
}

/// Joins workers until none are left or `limit` elapses; true if all finished
async fn join_until<T: 'static>(
    workers: &mut JoinSet<T>,
    limit: Duration,
    results: &mut Vec<Result<T, JoinError>>,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, workers.join_next()).await {
            Ok(Some(result)) => results.push(result),
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    Ok(()) = tokio::signal::ctrl_c() => "Ctrl-C",
                    Some(()) = terminate.recv() => "SIGTERM",
                    else => std::future::pending::<&'static str>().await,
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                wait_for_ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await
    }
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    "Ctrl-C"
}
