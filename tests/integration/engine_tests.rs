//! End-to-end tests for the run controller
//!
//! These tests drive whole runs against a fake driver and a scripted
//! extractor, then inspect the checkpoint the run left behind.

use async_trait::async_trait;
use harvest_engine::config::Config;
use harvest_engine::engine::{RetryPolicy, RunController, RunOptions, TakeResult, WorkQueue};
use harvest_engine::identity::Identity;
use harvest_engine::lifecycle::{ResourceProbe, ResourceSample, StopReason};
use harvest_engine::output::{JsonlSink, OutputResult, RecordSink};
use harvest_engine::session::{DriverProvider, Extractor, Session, SessionManager};
use harvest_engine::state::{ItemStatus, RunRecord, RunStatus, WorkItem};
use harvest_engine::storage::{open_store, share, CheckpointStore, SharedStore, SqliteCheckpoint};
use harvest_engine::{FetchError, FetchResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RUN_ID: &str = "test-run";

struct FakeSession;

#[async_trait]
impl Session for FakeSession {
    async fn probe(&mut self) -> FetchResult<()> {
        Ok(())
    }

    async fn navigate(&mut self, _url: &str) -> FetchResult<String> {
        Ok("<html></html>".to_string())
    }

    async fn close(&mut self) {}
}

/// Opens fake sessions and remembers which identity each one used
#[derive(Default)]
struct FakeDriver {
    opened: Mutex<Vec<String>>,
}

#[async_trait]
impl DriverProvider for FakeDriver {
    async fn new_session(&self, identity: &Identity) -> FetchResult<Box<dyn Session>> {
        self.opened.lock().push(identity.id.clone());
        Ok(Box::new(FakeSession))
    }
}

/// Plays back scripted results per key and succeeds once a script runs out
///
/// Keys in `always_fail` never succeed. Every call is logged, and overlapping
/// calls for the same key are flagged.
#[derive(Default)]
struct ScriptedExtractor {
    scripts: Mutex<HashMap<String, VecDeque<FetchResult<Vec<Value>>>>>,
    always_fail: HashSet<String>,
    delay: Duration,
    calls: Mutex<Vec<(String, String)>>,
    active: Mutex<HashSet<String>>,
    overlap: AtomicBool,
}

impl ScriptedExtractor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn script(self, key: &str, results: Vec<FetchResult<Vec<Value>>>) -> Self {
        self.scripts.lock().insert(key.to_string(), results.into());
        self
    }

    fn failing(mut self, key: &str) -> Self {
        self.always_fail.insert(key.to_string());
        self
    }

    fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|(k, _)| k == key).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn fetch(&self, item: &WorkItem, _session: &mut SessionManager) -> FetchResult<Vec<Value>> {
        if !self.active.lock().insert(item.key.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        self.calls.lock().push((item.key.clone(), item.method.clone()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.always_fail.contains(&item.key) {
            Err(FetchError::TransientNetwork("connection reset by peer".into()))
        } else {
            self.scripts
                .lock()
                .get_mut(&item.key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(vec![json!({ "key": item.key })]))
        };

        self.active.lock().remove(&item.key);
        result
    }
}

/// Counts written items and flushes
#[derive(Default)]
struct CountingSink {
    written: AtomicUsize,
    flushes: AtomicUsize,
}

impl RecordSink for CountingSink {
    fn write(&self, _run_id: &str, _item: &WorkItem, _records: &[Value]) -> OutputResult<()> {
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> OutputResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always reports the same memory use
struct FixedProbe(u64);

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        Some(ResourceSample {
            rss_mb: self.0,
            threads: None,
        })
    }
}

/// A fast configuration: no pacing, no backoff, output under `dir`
fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.run.scraper = "test".to_string();
    config.run.output_dir = dir.display().to_string();
    config.output.database_path = dir.join("checkpoint.db").display().to_string();
    config.output.records_path = dir.join("records.jsonl").display().to_string();
    config.engine.worker_count = 2;
    config.engine.request_pause_base = 0.0;
    config.engine.jitter_min = 0.0;
    config.engine.jitter_max = 0.0;
    config.engine.progress_interval_seconds = 1;
    config.engine.shutdown_grace_seconds = 2;
    config.retry.backoff_base_ms = 0;
    config.retry.backoff_jitter_ms = 0;
    config.session.navigate_retry_delay_ms = 0;
    config
}

fn open(config: &Config) -> SharedStore {
    open_store(Path::new(&config.output.database_path), 10).unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        run_id: Some(RUN_ID.to_string()),
        ..RunOptions::default()
    }
}

fn keys(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("{}{}", prefix, n)).collect()
}

fn load_items(config: &Config) -> HashMap<String, WorkItem> {
    let mut store = SqliteCheckpoint::open(Path::new(&config.output.database_path), 10).unwrap();
    let (_, items) = store.load(RUN_ID).unwrap();
    items.into_iter().map(|i| (i.key.clone(), i)).collect()
}

#[tokio::test]
async fn test_run_completes_with_one_worker_per_key() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.worker_count = 4;

    let extractor = Arc::new(ScriptedExtractor::with_delay(Duration::from_millis(2)));
    let sink = JsonlSink::open(Path::new(&config.output.records_path)).unwrap();
    let records_path = config.output.records_path.clone();

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        extractor.clone(),
    )
    .with_sink(Arc::new(sink))
    .with_options(options())
    .run(keys("p", 40))
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.flushed);
    assert_eq!(outcome.counters.done, 40);
    assert_eq!(outcome.processed, 40);

    assert!(!extractor.overlap.load(Ordering::SeqCst));
    assert_eq!(extractor.total_calls(), 40);

    let lines = std::fs::read_to_string(records_path).unwrap();
    assert_eq!(lines.lines().count(), 40);

    // A completed run clears its pointer so the next run starts fresh
    assert!(!dir.path().join(".current_run_id").exists());
}

#[tokio::test]
async fn test_duplicate_keys_with_more_workers_than_items() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.worker_count = 8;

    let extractor = Arc::new(ScriptedExtractor::with_delay(Duration::from_millis(5)));
    let seeds = ["p1", "p1", "p2", "p2", "p3"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        extractor.clone(),
    )
    .with_options(options())
    .run(seeds)
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.done, 3);
    assert!(!extractor.overlap.load(Ordering::SeqCst));
    assert_eq!(extractor.total_calls(), 3);

    let items = load_items(&config);
    assert_eq!(items.len(), 3);
    assert!(items.values().all(|i| i.status == ItemStatus::Done));
}

#[tokio::test]
async fn test_two_item_scenario() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let extractor = Arc::new(ScriptedExtractor::default().script(
        "p2",
        vec![
            Err(FetchError::TransientNetwork("timed out".into())),
            Err(FetchError::TransientNetwork("timed out".into())),
        ],
    ));

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        extractor.clone(),
    )
    .with_options(options())
    .run(vec!["p1".to_string(), "p2".to_string()])
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);

    let items = load_items(&config);
    assert_eq!(items["p1"].status, ItemStatus::Done);
    assert_eq!(items["p1"].attempts_for("browser"), 1);
    assert_eq!(items["p2"].status, ItemStatus::Done);
    assert_eq!(items["p2"].attempts_for("browser"), 3);
}

#[tokio::test]
async fn test_retries_are_bounded_per_method_then_fail() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.methods = vec!["browser".to_string(), "api".to_string()];
    config.engine.max_loop_count = 2;
    config.engine.max_attempts_per_method = 3;

    let extractor = Arc::new(ScriptedExtractor::default().failing("bad"));

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        extractor.clone(),
    )
    .with_options(options())
    .run(vec!["good".to_string(), "bad".to_string()])
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.done, 1);
    assert_eq!(outcome.counters.failed, 1);

    let items = load_items(&config);
    let bad = &items["bad"];
    assert_eq!(bad.status, ItemStatus::FailedTerminal);
    assert_eq!(bad.attempts_for("browser"), 6);
    assert_eq!(bad.attempts_for("api"), 6);
    assert!(bad.last_error.is_some());
    assert_eq!(extractor.calls_for("bad"), 12);
}

#[tokio::test]
async fn test_resume_never_repeats_done_items() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.worker_count = 1;
    let seeds = keys("p", 10);

    let first = Arc::new(ScriptedExtractor::default());
    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        first.clone(),
    )
    .with_options(RunOptions {
        max_items: Some(4),
        ..options()
    })
    .run(seeds.clone())
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Running);
    assert!(outcome.limit_reached);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.counters.done, 4);
    assert_eq!(outcome.counters.pending, 6);

    let second = Arc::new(ScriptedExtractor::default());
    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        second.clone(),
    )
    .with_options(options())
    .run(seeds.clone())
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.done, 10);
    assert_eq!(second.total_calls(), 6);
    for (key, _) in first.calls.lock().iter() {
        assert_eq!(second.calls_for(key), 0, "{} was fetched again", key);
    }

    // Resuming a completed run does nothing
    let third = Arc::new(ScriptedExtractor::default());
    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        third.clone(),
    )
    .with_options(options())
    .run(seeds)
    .await
    .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(third.total_calls(), 0);
}

#[tokio::test]
async fn test_refresh_reprocesses_done_items() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let seeds = keys("p", 3);

    RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(ScriptedExtractor::default()),
    )
    .with_options(options())
    .run(seeds.clone())
    .await
    .unwrap();

    let extractor = Arc::new(ScriptedExtractor::default());
    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        extractor.clone(),
    )
    .with_options(RunOptions {
        refresh: true,
        ..options()
    })
    .run(seeds)
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(extractor.total_calls(), 3);
}

#[tokio::test]
async fn test_resume_flag_requires_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let result = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(ScriptedExtractor::default()),
    )
    .with_options(RunOptions {
        resume: true,
        ..options()
    })
    .run(keys("p", 2))
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_block_signal_rotates_identity() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.worker_count = 1;
    config.identities.entries = vec![
        Identity::with_proxy("proxy-a", "http://10.0.0.1:8080"),
        Identity::with_proxy("proxy-b", "http://10.0.0.2:8080"),
    ];

    let driver = Arc::new(FakeDriver::default());
    let extractor = Arc::new(
        ScriptedExtractor::default()
            .script("p1", vec![Err(FetchError::BlockSignal("captcha".into()))]),
    );

    let outcome = RunController::new(config.clone(), open(&config), driver.clone(), extractor)
        .with_options(options())
        .run(vec!["p1".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);

    let opened = driver.opened.lock().clone();
    assert_eq!(opened.len(), 2);
    assert_ne!(opened[0], opened[1], "blocked identity was reused");

    let items = load_items(&config);
    assert_eq!(items["p1"].attempts(), 2);
}

#[tokio::test]
async fn test_session_crash_reopens_same_identity() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.worker_count = 1;
    config.identities.entries = vec![
        Identity::with_proxy("proxy-a", "http://10.0.0.1:8080"),
        Identity::with_proxy("proxy-b", "http://10.0.0.2:8080"),
    ];

    let driver = Arc::new(FakeDriver::default());
    let extractor = Arc::new(
        ScriptedExtractor::default()
            .script("p1", vec![Err(FetchError::FatalSession("tab crashed".into()))]),
    );

    let outcome = RunController::new(config.clone(), open(&config), driver.clone(), extractor)
        .with_options(options())
        .run(vec!["p1".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        *driver.opened.lock(),
        vec!["proxy-a".to_string(), "proxy-a".to_string()]
    );
    assert_eq!(load_items(&config)["p1"].attempts(), 2);
}

#[tokio::test]
async fn test_isolated_crashes_do_not_exhaust_worker() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.engine.worker_count = 1;
    config.session.max_restarts_per_worker = 5;

    let seeds = keys("p", 10);
    let extractor = seeds.iter().fold(ScriptedExtractor::default(), |extractor, key| {
        extractor.script(key, vec![Err(FetchError::FatalSession("tab crashed".into()))])
    });

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(extractor),
    )
    .with_options(options())
    .run(seeds)
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.stop_reason, None);
    assert_eq!(outcome.counters.done, 10);
    assert_eq!(outcome.counters.pending, 0);
}

#[tokio::test]
async fn test_record_sink_flushed_at_end_of_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let sink = Arc::new(CountingSink::default());

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(ScriptedExtractor::default()),
    )
    .with_sink(sink.clone())
    .with_options(options())
    .run(keys("p", 3))
    .await
    .unwrap();

    assert!(outcome.flushed);
    assert_eq!(sink.written.load(Ordering::SeqCst), 3);
    assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_memory_limit_aborts_with_resumable_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.resources.memory_limit_mb = Some(1);
    let seeds = keys("p", 20);

    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(ScriptedExtractor::with_delay(Duration::from_millis(20))),
    )
    .with_options(options())
    .with_probe(Box::new(FixedProbe(512)))
    .run(seeds.clone())
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert!(matches!(
        outcome.stop_reason,
        Some(StopReason::ResourceExhausted(_))
    ));
    assert!(outcome.flushed);
    assert_eq!(outcome.exit_code(), 2);

    // Nothing is left claimed by a dead worker
    {
        let store = SqliteCheckpoint::open(Path::new(&config.output.database_path), 10).unwrap();
        let counters = store.count_items(RUN_ID).unwrap();
        assert_eq!(counters.in_progress, 0);
        assert_eq!(counters.total(), 20);
        assert_eq!(
            store.find_run(RUN_ID).unwrap().unwrap().status,
            RunStatus::Aborted
        );
    }

    // The pointer is kept so a plain rerun resumes
    assert!(dir.path().join(".current_run_id").exists());

    config.resources.memory_limit_mb = None;
    let outcome = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(ScriptedExtractor::default()),
    )
    .with_options(options())
    .run(seeds)
    .await
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.done, 20);
}

#[tokio::test]
async fn test_external_stop_saves_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let controller = RunController::new(
        config.clone(),
        open(&config),
        Arc::new(FakeDriver::default()),
        Arc::new(ScriptedExtractor::with_delay(Duration::from_millis(50))),
    )
    .with_options(options());
    let lifecycle = controller.lifecycle();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        lifecycle.request_stop(StopReason::Interrupted("test".into()));
    });

    let outcome = controller.run(keys("p", 50)).await.unwrap();
    stopper.await.unwrap();

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.exit_code(), 2);
    assert!(outcome.counters.done > 0);
    assert!(outcome.counters.done < 50);
    assert_eq!(outcome.counters.in_progress, 0);
}

#[tokio::test]
async fn test_done_survives_crash_before_flush() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("checkpoint.db");
    let config = Config::default();
    let policy = RetryPolicy::new(&config.engine, &config.retry);

    {
        let mut store = SqliteCheckpoint::open(&db_path, 100).unwrap();
        store
            .create_run(&RunRecord::new(RUN_ID, "test", "hash"))
            .unwrap();
        let items: Vec<WorkItem> = keys("p", 3)
            .iter()
            .map(|k| WorkItem::new(k.as_str(), "browser"))
            .collect();
        store.seed_items(RUN_ID, &items).unwrap();
        let queue = WorkQueue::new(RUN_ID, items, share(store), &policy, 1).unwrap();

        let take = || match queue.try_take().unwrap() {
            TakeResult::Item(item) => item,
            other => panic!("expected item, got {:?}", other),
        };
        let done = take();
        queue.complete(done).unwrap();
        // Claimed but never flushed when the process dies
        let _claimed = take();
    }

    let mut store = SqliteCheckpoint::open(&db_path, 100).unwrap();
    let (_, items) = store.load(RUN_ID).unwrap();
    let statuses: HashMap<String, ItemStatus> =
        items.into_iter().map(|i| (i.key, i.status)).collect();

    assert_eq!(statuses["p1"], ItemStatus::Done);
    assert_eq!(statuses["p2"], ItemStatus::Pending);
    assert_eq!(statuses["p3"], ItemStatus::Pending);
}
