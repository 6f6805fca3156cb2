//! Run controller - main orchestration logic
//!
//! This module ties a run together:
//! - Resolving the run id and creating, resuming or refreshing its checkpoint
//! - Seeding new item keys
//! - Spawning the worker pool, the resource monitor and the signal listener
//! - Logging progress and persisting run counters at a fixed cadence
//! - Draining, releasing and flushing on the way out, and picking the final
//!   run status

use crate::config::{Config, RUN_ID_VAR};
use crate::engine::{
    Classifier, Pacing, QueueEvent, RetryPolicy, WorkQueue, Worker, WorkerContext, WorkerExit,
    WorkerReport,
};
use crate::identity::{load_identities, IdentityState, RotationManager};
use crate::lifecycle::{
    LifecycleController, ResourceLimits, ResourceMonitor, ResourceProbe, StopReason, SysinfoProbe,
};
use crate::output::{NullSink, RecordSink};
use crate::session::{DriverProvider, Extractor, RecycleSignal, SessionManager};
use crate::state::{RunCounters, RunRecord, RunStatus, WorkItem};
use crate::storage::{
    clear_run_pointer, generate_run_id, resolve_run_id, write_run_pointer, RunIdSource,
    SharedStore, StorageError,
};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

/// Per-invocation switches, usually from the command line
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Discard any checkpoint for the resolved run and start over
    pub fresh: bool,

    /// Fail instead of starting a new run when no checkpoint exists
    pub resume: bool,

    /// Re-enqueue DONE items of the resolved run
    pub refresh: bool,

    /// Stop issuing items after this many
    pub max_items: Option<u64>,

    /// Overrides `engine.worker-count`
    pub worker_count: Option<usize>,

    /// Explicit run id; takes precedence over the environment and sidecar
    pub run_id: Option<String>,
}

/// How a run ended
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stop_reason: Option<StopReason>,
    pub counters: RunCounters,

    /// Attempts made during this invocation
    pub processed: u64,

    /// Whether the final checkpoint flush succeeded
    pub flushed: bool,

    /// The run stopped because `max_items` was reached
    pub limit_reached: bool,

    /// Round the run was in when it stopped
    pub round: u32,
}

impl RunOutcome {
    /// Process exit code for this outcome
    ///
    /// 0 completed (or paused by `max_items`), 1 fatal error, 2 aborted with a
    /// clean checkpoint, 3 aborted with a failed final flush.
    pub fn exit_code(&self) -> u8 {
        match (self.status, &self.stop_reason) {
            (RunStatus::Completed | RunStatus::Running, _) => 0,
            (RunStatus::Aborted, Some(StopReason::Fatal(_))) => 1,
            (RunStatus::Aborted, _) if self.flushed => 2,
            (RunStatus::Aborted, _) => 3,
        }
    }
}

/// Owns one run from checkpoint load to final status
pub struct RunController {
    config: Config,
    config_hash: String,
    store: SharedStore,
    driver: Arc<dyn DriverProvider>,
    extractor: Arc<dyn Extractor>,
    sink: Arc<dyn RecordSink>,
    probe: Option<Box<dyn ResourceProbe>>,
    options: RunOptions,
    handle_signals: bool,
    lifecycle: Arc<LifecycleController>,
}

impl RunController {
    pub fn new(
        config: Config,
        store: SharedStore,
        driver: Arc<dyn DriverProvider>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            config.engine.shutdown_grace(),
        ));

        Self {
            config,
            config_hash: String::new(),
            store,
            driver,
            extractor,
            sink: Arc::new(NullSink),
            probe: None,
            options: RunOptions::default(),
            handle_signals: false,
            lifecycle,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the `sysinfo` probe used when resource limits are configured
    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Hash recorded with new runs and compared on resume
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Installs Ctrl-C / SIGTERM handling for the duration of the run
    pub fn with_signal_handlers(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    /// Lets callers request a stop from outside the run
    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        self.lifecycle.clone()
    }

    /// Runs to completion, stop request or worker exhaustion
    ///
    /// `seeds` are item keys; keys the checkpoint already holds are left alone.
    /// Errors returned here are startup or checkpoint failures. Anything that
    /// happens to individual items is in the checkpoint.
    pub async fn run(mut self, seeds: Vec<String>) -> Result<RunOutcome> {
        let output_dir = PathBuf::from(&self.config.run.output_dir);
        let scraper = self.config.run.scraper.clone();

        let (mut run_id, source) = match self.options.run_id.clone() {
            Some(id) => (id, RunIdSource::Env),
            None => {
                let env_value = std::env::var(RUN_ID_VAR).ok();
                resolve_run_id(env_value.as_deref(), &output_dir, &scraper)?
            }
        };

        if self.options.fresh {
            if source == RunIdSource::Sidecar {
                run_id = generate_run_id(&scraper);
            }
            tracing::info!("Starting fresh run {}", run_id);
            self.store.lock().delete_run(&run_id)?;
        }

        let existing = self.store.lock().find_run(&run_id)?;
        let mut run = match existing {
            Some(run) => {
                if run.status == RunStatus::Completed && !self.options.refresh {
                    tracing::info!("Run {} already completed, nothing to do", run_id);
                    let counters = self.store.lock().count_items(&run_id)?;
                    return Ok(RunOutcome {
                        run_id,
                        status: RunStatus::Completed,
                        stop_reason: None,
                        counters,
                        processed: 0,
                        flushed: true,
                        limit_reached: false,
                        round: run.current_round,
                    });
                }
                if !self.config_hash.is_empty() && run.config_hash != self.config_hash {
                    tracing::warn!(
                        "Configuration changed since run {} started (hash {} -> {})",
                        run_id,
                        short_hash(&run.config_hash),
                        short_hash(&self.config_hash)
                    );
                }
                tracing::info!(
                    "Resuming run {} (round {}, started {})",
                    run_id,
                    run.current_round.max(1),
                    run.started_at.to_rfc3339()
                );
                run
            }
            None => {
                if self.options.resume {
                    return Err(StorageError::RunNotFound(run_id).into());
                }
                let run = RunRecord::new(&run_id, &scraper, &self.config_hash);
                self.store.lock().create_run(&run)?;
                tracing::info!("Starting new run {}", run_id);
                run
            }
        };

        let items = {
            let mut store = self.store.lock();

            if self.options.refresh {
                let reset = store.reset_terminal(&run_id, false)?;
                tracing::info!("Refresh: {} finished item(s) re-enqueued", reset);
            }

            let initial_method = self.config.engine.initial_method();
            let seeded: Vec<WorkItem> = seeds
                .iter()
                .map(|key| WorkItem::new(key.as_str(), initial_method))
                .collect();
            let added = store.seed_items(&run_id, &seeded)?;
            if added > 0 {
                tracing::info!("Seeded {} new item(s)", added);
            }

            run.status = RunStatus::Running;
            run.finished_at = None;
            store.update_run(&run)?;

            let (_, items) = store.load(&run_id)?;
            items
        };

        if let Err(e) = write_run_pointer(&output_dir, &run_id) {
            tracing::warn!("Could not write run pointer in {}: {}", output_dir.display(), e);
        }

        let worker_count = self
            .options
            .worker_count
            .unwrap_or(self.config.engine.worker_count as usize)
            .max(1);
        let identities = Arc::new(RotationManager::new(
            load_identities(&self.config.identities, worker_count)?,
            &self.config.identities,
        )?);

        let policy = RetryPolicy::new(&self.config.engine, &self.config.retry);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(
            WorkQueue::new(&run_id, items, self.store.clone(), &policy, run.current_round)?
                .with_events(events_tx),
        );
        queue.set_max_items(self.options.max_items);
        run.current_round = queue.round();

        let lifecycle = self.lifecycle.clone();
        let signals = self
            .handle_signals
            .then(|| lifecycle.spawn_signal_listener());

        let recycle = RecycleSignal::new();
        let limits = ResourceLimits::from_config(&self.config.resources);
        let monitor = if limits.is_empty() {
            None
        } else {
            let probe = self
                .probe
                .take()
                .unwrap_or_else(|| Box::new(SysinfoProbe::new()));
            let monitor =
                ResourceMonitor::new(probe, limits, self.config.resources.sample_interval());
            Some(tokio::spawn(monitor.run(lifecycle.clone(), recycle.clone())))
        };

        let ctx = Arc::new(WorkerContext {
            run_id: run_id.clone(),
            queue: queue.clone(),
            classifier: Arc::new(Classifier::new(&self.config.classifier)),
            policy: Arc::new(policy),
            extractor: self.extractor.clone(),
            sink: self.sink.clone(),
            pacing: Pacing::from_config(&self.config.engine),
            call_timeout: self.config.engine.call_timeout(),
            shutdown: lifecycle.shutdown_token(),
            abort: lifecycle.abort_token(),
        });

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let session = SessionManager::new(
                id,
                self.driver.clone(),
                identities.clone(),
                &self.config.session,
                recycle.clone(),
                lifecycle.shutdown_token(),
            );
            workers.spawn(Worker::new(id, ctx.clone(), session).run());
        }

        let counters = queue.counters();
        tracing::info!(
            "Run {}: {} pending, {} done, {} failed; {} worker(s), {} identit{}",
            run_id,
            counters.pending,
            counters.done,
            counters.failed,
            worker_count,
            identities.len(),
            if identities.len() == 1 { "y" } else { "ies" }
        );

        let shutdown = lifecycle.shutdown_token();
        let mut progress = tokio::time::interval(self.config.engine.progress_interval());
        progress.tick().await;
        let mut processed = 0u64;
        let mut exhausted = 0usize;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                joined = workers.join_next() => match joined {
                    None => break,
                    Some(joined) => {
                        if let Some(report) = self.collect(joined, &mut processed) {
                            if matches!(report.exit, WorkerExit::SessionsExhausted(_)) {
                                exhausted += 1;
                                tracing::warn!(
                                    "{} of {} worker(s) gave up; continuing with the rest",
                                    exhausted,
                                    worker_count
                                );
                            }
                        }
                    }
                },

                Some(event) = events_rx.recv() => match event {
                    QueueEvent::RoundStarted { round, items } => {
                        tracing::info!("Round {}: {} item(s) to retry", round, items);
                        self.persist_progress(&queue, &mut run);
                    }
                    QueueEvent::Drained => tracing::info!("All items settled"),
                },

                _ = progress.tick() => {
                    self.log_progress(&queue, &identities);
                    self.persist_progress(&queue, &mut run);
                }
            }
        }

        let (results, report) = lifecycle.drain(&queue, &mut workers).await;
        for joined in results {
            self.collect(joined, &mut processed);
        }
        if let Some(handle) = monitor {
            handle.abort();
        }
        if let Some(handle) = signals {
            handle.abort();
        }

        let counters = queue.counters();
        let limit_reached = queue.limit_reached();
        let (status, stop_reason) = match lifecycle.stop_reason() {
            Some(reason) => (RunStatus::Aborted, Some(reason)),
            None if counters.is_settled() => (RunStatus::Completed, None),
            None if limit_reached => (RunStatus::Running, None),
            None => (RunStatus::Aborted, Some(StopReason::WorkersExhausted)),
        };

        run.counters = counters;
        run.current_round = queue.round();
        if status == RunStatus::Running {
            run.status = RunStatus::Running;
        } else {
            run.finish(status);
        }

        let mut flushed = report.flushed;
        if let Err(e) = self.sink.flush() {
            tracing::error!("Failed to flush record output: {}", e);
            flushed = false;
        }
        if let Err(e) = self.store.lock().update_run(&run) {
            tracing::error!("Failed to persist final run state: {}", e);
            flushed = false;
        }

        if status == RunStatus::Completed {
            if let Err(e) = clear_run_pointer(&output_dir) {
                tracing::warn!("Could not remove run pointer: {}", e);
            }
        }

        match (&status, &stop_reason) {
            (RunStatus::Completed, _) => tracing::info!(
                "Run {} completed: {} done, {} failed",
                run_id,
                counters.done,
                counters.failed
            ),
            (RunStatus::Running, _) => tracing::info!(
                "Run {} paused after {} item(s); {} pending, resume to continue",
                run_id,
                processed,
                counters.pending
            ),
            (_, reason) => tracing::warn!(
                "Run {} aborted ({}): {} done, {} failed, {} pending",
                run_id,
                reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown".to_string()),
                counters.done,
                counters.failed,
                counters.pending
            ),
        }
        if flushed {
            tracing::info!("Checkpoint flushed cleanly");
        } else {
            tracing::error!("Checkpoint flush failed; recent progress may be lost");
        }

        Ok(RunOutcome {
            run_id,
            status,
            stop_reason,
            counters,
            processed,
            flushed,
            limit_reached,
            round: queue.round(),
        })
    }

    /// Folds one finished worker into the totals; fatal worker errors stop
    /// the run
    fn collect(
        &self,
        joined: std::result::Result<Result<WorkerReport>, JoinError>,
        processed: &mut u64,
    ) -> Option<WorkerReport> {
        match joined {
            Ok(Ok(report)) => {
                *processed += report.processed;
                Some(report)
            }
            Ok(Err(e)) => {
                tracing::error!("Worker failed: {}", e);
                self.lifecycle.request_stop(StopReason::Fatal(e.to_string()));
                None
            }
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                tracing::error!("Worker panicked: {}", e);
                self.lifecycle
                    .request_stop(StopReason::Fatal(format!("worker panicked: {}", e)));
                None
            }
        }
    }

    fn log_progress(&self, queue: &WorkQueue, identities: &RotationManager) {
        let counters = queue.counters();
        let cooling = identities
            .snapshot()
            .iter()
            .filter(|s| s.state == IdentityState::CoolingDown)
            .count();

        tracing::info!(
            "Progress: {}/{} done, {} failed, {} pending, {} in flight (round {}, {} identit{} cooling down)",
            counters.done,
            counters.total(),
            counters.failed,
            counters.pending,
            queue.in_flight(),
            queue.round(),
            cooling,
            if cooling == 1 { "y" } else { "ies" }
        );
    }

    /// Writes counters and round to the run row; a failed write is fatal
    fn persist_progress(&self, queue: &WorkQueue, run: &mut RunRecord) {
        run.counters = queue.counters();
        run.current_round = queue.round();
        if let Err(e) = self.store.lock().update_run(run) {
            tracing::error!("Failed to persist run progress: {}", e);
            self.lifecycle.request_stop(StopReason::Fatal(e.to_string()));
        }
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
