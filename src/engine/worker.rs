//! Worker loop
//!
//! Each worker owns one session for its whole life and pulls items from the
//! shared queue until the queue finishes or the run stops. Every per-item
//! error is classified here and folded into the item's state; only checkpoint
//! and sink failures escape as errors.

use crate::config::EngineConfig;
use crate::engine::{Classifier, Decision, Outcome, RetryPolicy, WorkQueue};
use crate::identity::IdentityError;
use crate::output::RecordSink;
use crate::session::{Extractor, SessionError, SessionManager};
use crate::{FetchError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-worker delay between operations: a fixed base plus uniform jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    base: Duration,
    jitter_min: f64,
    jitter_max: f64,
}

impl Pacing {
    pub fn new(base: Duration, jitter_min: f64, jitter_max: f64) -> Self {
        Self {
            base,
            jitter_min: jitter_min.max(0.0),
            jitter_max: jitter_max.max(0.0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let base = Duration::try_from_secs_f64(config.request_pause_base).unwrap_or_default();
        Self::new(base, config.jitter_min, config.jitter_max)
    }

    /// No pause at all
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 0.0, 0.0)
    }

    pub fn next_pause(&self) -> Duration {
        let jitter = if self.jitter_max > self.jitter_min {
            rand::rng().random_range(self.jitter_min..self.jitter_max)
        } else {
            self.jitter_min
        };
        self.base + Duration::try_from_secs_f64(jitter).unwrap_or_default()
    }
}

/// Everything the workers of one run share
pub struct WorkerContext {
    pub run_id: String,
    pub queue: Arc<WorkQueue>,
    pub classifier: Arc<Classifier>,
    pub policy: Arc<RetryPolicy>,
    pub extractor: Arc<dyn Extractor>,
    pub sink: Arc<dyn RecordSink>,
    pub pacing: Pacing,

    /// Upper bound on one extractor call
    pub call_timeout: Duration,

    /// Stops intake
    pub shutdown: CancellationToken,

    /// Drops the in-flight call
    pub abort: CancellationToken,
}

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Nothing left to take
    QueueFinished,

    /// The run asked it to stop
    Stopped,

    /// Its session restart budget or identity wait ran out
    SessionsExhausted(String),
}

/// What one worker did
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub exit: WorkerExit,
}

pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    session: SessionManager,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>, session: SessionManager) -> Self {
        Self { id, ctx, session }
    }

    /// Runs until the queue finishes or the run stops
    ///
    /// The session is torn down on every exit path that returns.
    pub async fn run(mut self) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            id: self.id,
            processed: 0,
            succeeded: 0,
            exit: WorkerExit::QueueFinished,
        };

        let result = self.work(&mut report).await;
        self.session.teardown().await;

        report.exit = result?;
        match &report.exit {
            WorkerExit::SessionsExhausted(reason) => tracing::warn!(
                "Worker {} exiting after {} item(s): {}",
                self.id,
                report.processed,
                reason
            ),
            exit => tracing::debug!(
                "Worker {} exiting after {} item(s): {:?}",
                self.id,
                report.processed,
                exit
            ),
        }
        Ok(report)
    }

    async fn work(&mut self, report: &mut WorkerReport) -> Result<WorkerExit> {
        let ctx = self.ctx.clone();

        loop {
            let Some(mut item) = ctx.queue.take(&ctx.shutdown).await? else {
                return Ok(if ctx.shutdown.is_cancelled() {
                    WorkerExit::Stopped
                } else {
                    WorkerExit::QueueFinished
                });
            };

            let pause = ctx.pacing.next_pause();
            if !pause.is_zero() {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => {
                        ctx.queue.release(item)?;
                        return Ok(WorkerExit::Stopped);
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            if let Err(e) = self.session.ensure_ready().await {
                ctx.queue.release(item)?;
                match e {
                    SessionError::Open(err) => {
                        // Unhealthy now; the next ensure_ready charges a restart
                        tracing::warn!("Worker {} could not open a session: {}", self.id, err);
                        continue;
                    }
                    SessionError::Identity(IdentityError::Cancelled) => {
                        return Ok(WorkerExit::Stopped)
                    }
                    other => return Ok(WorkerExit::SessionsExhausted(other.to_string())),
                }
            }

            let fetched = tokio::select! {
                _ = ctx.abort.cancelled() => None,
                result = tokio::time::timeout(
                    ctx.call_timeout,
                    ctx.extractor.fetch(&item, &mut self.session),
                ) => Some(result),
            };
            let Some(fetched) = fetched else {
                tracing::debug!("Worker {} dropping {} on abort", self.id, item.key);
                ctx.queue.release(item)?;
                return Ok(WorkerExit::Stopped);
            };

            let result = fetched.unwrap_or(Err(FetchError::Timeout(ctx.call_timeout)));
            let (outcome, records, error) = match result {
                Ok(records) => (Outcome::Success, records, None),
                Err(e) => (ctx.classifier.classify(&e), Vec::new(), Some(e.to_string())),
            };

            let decision = ctx.policy.decide(&mut item, outcome, error.as_deref());
            report.processed += 1;

            match &decision {
                Decision::Done => {
                    item.record_found(records.len() as u64);
                    if let Err(e) = ctx.sink.write(&ctx.run_id, &item, &records) {
                        ctx.queue.release(item)?;
                        return Err(e.into());
                    }
                    report.succeeded += 1;
                    tracing::debug!(
                        "Worker {} finished {} with {} record(s)",
                        self.id,
                        item.key,
                        records.len()
                    );
                }
                Decision::Retry { delay } => tracing::warn!(
                    "Worker {}: {} failed ({}), retrying in {:?}",
                    self.id,
                    item.key,
                    error.as_deref().unwrap_or("unknown"),
                    delay
                ),
                _ => {}
            }

            ctx.queue.apply(item, decision)?;

            let restarted = match outcome {
                Outcome::FatalSession | Outcome::BlockSignal => {
                    self.session.restart(outcome).await
                }
                _ => {
                    self.session.record_use(outcome);
                    Ok(())
                }
            };

            match restarted {
                Ok(()) | Err(SessionError::Open(_)) => {}
                Err(SessionError::Identity(IdentityError::Cancelled)) => {
                    return Ok(WorkerExit::Stopped)
                }
                Err(e) => return Ok(WorkerExit::SessionsExhausted(e.to_string())),
            }
        }
    }
}
