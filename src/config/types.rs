//! Configuration types, one struct per TOML section, with defaults

use crate::engine::ClassifierRule;
use crate::identity::Identity;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for the engine
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub identities: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

/// Run identification
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RunConfig {
    /// Scraper name, used as the run id prefix
    pub scraper: String,

    /// Directory holding the `.current_run_id` sidecar
    pub output_dir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scraper: "harvest".to_string(),
            output_dir: "./output".to_string(),
        }
    }
}

/// Worker pool and round behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Number of concurrent workers, one session each
    pub worker_count: u32,

    /// Rounds an item may survive under one method
    pub max_loop_count: u32,

    /// Attempts per item per round under one method
    pub max_attempts_per_method: u32,

    /// Acquisition methods in handoff order; the first owns new items
    pub methods: Vec<String>,

    /// IN_PROGRESS writes buffered before a forced flush
    pub checkpoint_batch_size: u32,

    /// Upper bound on one extractor call
    pub call_timeout_seconds: u64,

    pub progress_interval_seconds: u64,

    /// Time in-flight items get to settle after a stop request
    pub shutdown_grace_seconds: u64,

    /// Fixed pause before every operation (seconds)
    pub request_pause_base: f64,

    /// Lower bound of the uniform jitter added to the pause (seconds)
    pub jitter_min: f64,

    /// Upper bound of the uniform jitter added to the pause (seconds)
    pub jitter_max: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_loop_count: 3,
            max_attempts_per_method: 3,
            methods: vec!["browser".to_string()],
            checkpoint_batch_size: 10,
            call_timeout_seconds: 60,
            progress_interval_seconds: 30,
            shutdown_grace_seconds: 10,
            request_pause_base: 1.0,
            jitter_min: 0.0,
            jitter_max: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_seconds.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// The method that owns freshly seeded items
    pub fn initial_method(&self) -> &str {
        self.methods.first().map(String::as_str).unwrap_or("default")
    }

    /// The method an item moves to once `current` is exhausted
    pub fn next_method(&self, current: &str) -> Option<&str> {
        let pos = self.methods.iter().position(|m| m == current)?;
        self.methods.get(pos + 1).map(String::as_str)
    }
}

/// Backoff and invalid-content budgets
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound of the uniform jitter added to each backoff
    pub backoff_jitter_ms: u64,
    /// DATA_INVALID outcomes tolerated before an item fails terminally
    pub max_invalid_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_jitter_ms: 500,
            max_invalid_retries: 2,
        }
    }
}

/// Identity pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdentityConfig {
    /// Fail at startup when the pool is empty
    pub required: bool,

    /// Uses before an identity is forced into cooldown
    pub rotation_limit: u32,

    pub cooldown_seconds: u64,

    /// Longest a worker waits while every identity is leased; cooldowns are
    /// always waited out
    pub acquire_timeout_seconds: u64,

    /// Optional file with one `id[,proxy-url]` per line
    pub file: Option<String>,

    #[serde(rename = "identity")]
    pub entries: Vec<Identity>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            required: false,
            rotation_limit: 50,
            cooldown_seconds: 300,
            acquire_timeout_seconds: 600,
            file: None,
            entries: Vec::new(),
        }
    }
}

impl IdentityConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Consecutive restarts without a successful item before a worker gives up
    pub max_restarts_per_worker: u32,

    /// Sessions older than this are recycled before the next item (0 disables)
    pub max_browser_runtime_seconds: u64,

    /// Navigation attempts on each side of the single restart
    pub navigate_retries: u32,

    pub navigate_retry_delay_ms: u64,

    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_restarts_per_worker: 5,
            max_browser_runtime_seconds: 3_600,
            navigate_retries: 3,
            navigate_retry_delay_ms: 2_000,
            user_agent: format!("harvest-engine/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SessionConfig {
    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_browser_runtime_seconds > 0)
            .then(|| Duration::from_secs(self.max_browser_runtime_seconds))
    }

    pub fn navigate_retry_delay(&self) -> Duration {
        Duration::from_millis(self.navigate_retry_delay_ms)
    }
}

/// Resource limits
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ResourceConfig {
    /// Hard RSS limit; exceeding it stops the run with a saved checkpoint
    pub memory_limit_mb: Option<u64>,

    /// Soft RSS limit; exceeding it triggers a cleanup pass
    pub memory_soft_limit_mb: Option<u64>,

    /// Hard limit on OS threads in the process
    pub thread_limit: Option<u64>,

    pub sample_interval_seconds: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: None,
            memory_soft_limit_mb: None,
            thread_limit: None,
            sample_interval_seconds: 15,
        }
    }
}

impl ResourceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds.max(1))
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OutputConfig {
    /// Path to the SQLite checkpoint database
    pub database_path: String,

    /// Path to the JSON Lines record file
    pub records_path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            database_path: "./output/checkpoint.db".to_string(),
            records_path: "./output/records.jsonl".to_string(),
        }
    }
}

/// Built-in HTTP target used by the CLI
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TargetConfig {
    /// URL template per method; `{key}` is replaced by the item key
    pub url_templates: BTreeMap<String, String>,

    /// Inline item keys
    pub seeds: Vec<String>,

    /// File with one item key per line
    pub seeds_file: Option<String>,

    /// Text a valid page must contain
    pub expect_text: Option<String>,

    /// CSS selector a valid page must match
    pub expect_selector: Option<String>,
}

/// Failure classifier table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClassifierConfig {
    /// Drop the built-in rules and use only the configured ones
    pub replace_defaults: bool,

    #[serde(rename = "rule")]
    pub rules: Vec<ClassifierRule>,
}
