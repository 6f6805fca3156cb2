//! Integration tests for the built-in HTTP target
//!
//! These tests use wiremock to stand in for the scraped site and run the
//! real driver, extractor and record sink end-to-end.

use harvest_engine::config::Config;
use harvest_engine::engine::{RunController, RunOptions};
use harvest_engine::identity::{Identity, IdentityKind};
use harvest_engine::output::JsonlSink;
use harvest_engine::session::{HttpDriver, HttpExtractor};
use harvest_engine::state::{ItemStatus, RunStatus};
use harvest_engine::storage::{open_store, CheckpointStore, SqliteCheckpoint};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RUN_ID: &str = "http-run";

fn account(id: &str) -> Identity {
    Identity {
        id: id.to_string(),
        kind: IdentityKind::Account,
        proxy: None,
        username: None,
        password: None,
    }
}

fn create_test_config(server: &MockServer, dir: &Path) -> Config {
    let mut config = Config::default();
    config.run.scraper = "http-test".to_string();
    config.run.output_dir = dir.display().to_string();
    config.output.database_path = dir.join("checkpoint.db").display().to_string();
    config.output.records_path = dir.join("records.jsonl").display().to_string();

    config.engine.worker_count = 1;
    config.engine.request_pause_base = 0.0;
    config.engine.jitter_min = 0.0;
    config.engine.jitter_max = 0.0;
    config.engine.call_timeout_seconds = 10;
    config.retry.backoff_base_ms = 0;
    config.retry.backoff_jitter_ms = 0;
    config.session.navigate_retries = 1;
    config.session.navigate_retry_delay_ms = 0;
    config.identities.entries = vec![account("acct-a"), account("acct-b")];

    config.target.url_templates.insert(
        "browser".to_string(),
        format!("{}/item/{{key}}", server.uri()),
    );
    config.target.expect_selector = Some(".price".to_string());
    config
}

async fn run(config: &Config, seeds: &[&str]) -> harvest_engine::RunOutcome {
    let store = open_store(Path::new(&config.output.database_path), 10).unwrap();
    let sink = JsonlSink::open(Path::new(&config.output.records_path)).unwrap();
    let driver = HttpDriver::new(&config.session, config.engine.call_timeout());
    let extractor = HttpExtractor::new(&config.target).unwrap();

    RunController::new(config.clone(), store, Arc::new(driver), Arc::new(extractor))
        .with_sink(Arc::new(sink))
        .with_options(RunOptions {
            run_id: Some(RUN_ID.to_string()),
            ..RunOptions::default()
        })
        .run(seeds.iter().map(|s| s.to_string()).collect())
        .await
        .unwrap()
}

fn page(title: &str) -> String {
    format!(
        "<html><head><title>{}</title></head><body><span class=\"price\">9.99</span></body></html>",
        title
    )
}

#[tokio::test]
async fn test_http_run_records_pages_and_fails_missing_ones() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/item/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page("Item One")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/item/p2"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let config = create_test_config(&server, dir.path());
    let outcome = run(&config, &["p1", "p2"]).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.done, 1);
    assert_eq!(outcome.counters.failed, 1);

    let mut store = SqliteCheckpoint::open(Path::new(&config.output.database_path), 10).unwrap();
    let (_, items) = store.load(RUN_ID).unwrap();
    let p2 = items.iter().find(|i| i.key == "p2").unwrap();
    assert_eq!(p2.status, ItemStatus::FailedTerminal);
    // Missing pages get max-invalid-retries extra attempts
    assert_eq!(p2.attempts(), config.retry.max_invalid_retries + 1);
    assert!(p2.last_error.as_deref().unwrap().contains("404"));

    let output = std::fs::read_to_string(&config.output.records_path).unwrap();
    let lines: Vec<Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["key"], "p1");
    assert_eq!(lines[0]["run_id"], RUN_ID);
    assert_eq!(lines[0]["record"]["title"], "Item One");
}

#[tokio::test]
async fn test_rate_limit_rotates_to_next_identity() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/item/p1"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/item/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page("Item One")))
        .mount(&server)
        .await;

    let config = create_test_config(&server, dir.path());
    let outcome = run(&config, &["p1"]).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.done, 1);

    let store = SqliteCheckpoint::open(Path::new(&config.output.database_path), 10).unwrap();
    assert!(store.failed_items(RUN_ID).unwrap().is_empty());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_page_without_expected_content_is_invalid() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/item/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Sorry</body></html>"))
        .mount(&server)
        .await;

    let mut config = create_test_config(&server, dir.path());
    config.retry.max_invalid_retries = 0;
    config.session.max_restarts_per_worker = 10;
    let outcome = run(&config, &["p1"]).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.counters.failed, 1);

    let store = SqliteCheckpoint::open(Path::new(&config.output.database_path), 10).unwrap();
    let failed = store.failed_items(RUN_ID).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].1.as_deref().unwrap().contains("data-invalid"));
}
