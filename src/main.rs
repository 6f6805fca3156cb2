//! Harvest main entry point
//!
//! This is the command-line interface for the harvest work-queue engine.

use anyhow::Context;
use clap::Parser;
use harvest_engine::config::{load_config_with_hash, Config, RUN_ID_VAR};
use harvest_engine::engine::{RunController, RunOptions};
use harvest_engine::output::{load_statistics, print_statistics, JsonlSink};
use harvest_engine::session::{HttpDriver, HttpExtractor};
use harvest_engine::storage::{open_store, resolve_run_id, RunIdSource, SqliteCheckpoint};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Harvest: a resumable, fault-tolerant scrape work queue
///
/// Harvest works through a list of item keys with a pool of workers, each
/// driving its own session and identity. Progress is checkpointed per item, so
/// an interrupted run picks up where it left off.
#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(version)]
#[command(about = "A resumable, fault-tolerant scrape work queue", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume the current run; fail if it has no checkpoint
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Discard the current run's checkpoint and start a new run
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Re-enqueue items the run already finished
    #[arg(long)]
    refresh: bool,

    /// Stop after issuing this many items; the run stays resumable
    #[arg(long, value_name = "N")]
    max_items: Option<u64>,

    /// Override the configured number of workers
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..=64))]
    workers: Option<u32>,

    /// Validate config and show what would run without running it
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show checkpoint statistics and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env: {}", e);
        }
    }

    setup_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.stats {
        handle_stats(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let seeds = load_seeds(&config)?;

    if cli.dry_run {
        handle_dry_run(&config, &seeds)?;
        return Ok(ExitCode::SUCCESS);
    }

    let options = RunOptions {
        fresh: cli.fresh,
        resume: cli.resume,
        refresh: cli.refresh,
        max_items: cli.max_items,
        worker_count: cli.workers.map(|n| n as usize),
        run_id: None,
    };
    handle_run(config, config_hash, seeds, options).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("harvest_engine=info,warn"),
            1 => EnvFilter::new("harvest_engine=debug,info"),
            2 => EnvFilter::new("harvest_engine=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Collects item keys from the inline list and the seeds file, in that order
fn load_seeds(config: &Config) -> anyhow::Result<Vec<String>> {
    let mut seeds: Vec<String> = config
        .target
        .seeds
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if let Some(path) = &config.target.seeds_file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seeds file {}", path))?;
        seeds.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    Ok(seeds)
}

/// Handles the --dry-run mode: validates config and shows what would run
fn handle_dry_run(config: &Config, seeds: &[String]) -> anyhow::Result<()> {
    println!("=== Harvest Dry Run ===\n");

    let engine = &config.engine;
    println!("Engine:");
    println!("  Workers: {}", engine.worker_count);
    println!("  Methods: {}", engine.methods.join(" -> "));
    println!(
        "  Budget per method: {} round(s) x {} attempt(s)",
        engine.max_loop_count, engine.max_attempts_per_method
    );
    println!(
        "  Pacing: {}s + {}..{}s jitter",
        engine.request_pause_base, engine.jitter_min, engine.jitter_max
    );
    println!("  Call timeout: {}s", engine.call_timeout_seconds);

    println!("\nIdentities:");
    println!("  Inline: {}", config.identities.entries.len());
    if let Some(file) = &config.identities.file {
        println!("  File: {}", file);
    }
    println!(
        "  Rotation: every {} use(s), {}s cooldown",
        config.identities.rotation_limit, config.identities.cooldown_seconds
    );

    println!("\nResources:");
    let limit = |v: Option<u64>| v.map_or_else(|| "none".to_string(), |v| v.to_string());
    println!("  Memory limit: {} MB", limit(config.resources.memory_limit_mb));
    println!(
        "  Soft memory limit: {} MB",
        limit(config.resources.memory_soft_limit_mb)
    );
    println!("  Thread limit: {}", limit(config.resources.thread_limit));

    println!("\nOutput:");
    println!("  Checkpoint: {}", config.output.database_path);
    println!("  Records: {}", config.output.records_path);

    let env_value = std::env::var(RUN_ID_VAR).ok();
    let (run_id, source) = resolve_run_id(
        env_value.as_deref(),
        Path::new(&config.run.output_dir),
        &config.run.scraper,
    )?;
    let source = match source {
        RunIdSource::Env => "from environment",
        RunIdSource::Sidecar => "resuming",
        RunIdSource::Generated => "new",
    };
    println!("\nRun: {} ({})", run_id, source);

    println!("\nSeeds ({}):", seeds.len());
    for seed in seeds.iter().take(10) {
        println!("  - {}", seed);
    }
    if seeds.len() > 10 {
        println!("  ... and {} more", seeds.len() - 10);
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --stats mode: shows statistics from the checkpoint
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Checkpoint: {}\n", config.output.database_path);

    let store = SqliteCheckpoint::open(Path::new(&config.output.database_path), 1)?;
    let run_id = std::env::var(RUN_ID_VAR).ok().filter(|s| !s.trim().is_empty());

    match load_statistics(&store, run_id.as_deref())? {
        Some(stats) => print_statistics(&stats),
        None => println!("No runs recorded yet"),
    }

    Ok(())
}

/// Handles the main run
async fn handle_run(
    config: Config,
    config_hash: String,
    seeds: Vec<String>,
    options: RunOptions,
) -> anyhow::Result<ExitCode> {
    if options.fresh {
        tracing::info!("Starting fresh run (ignoring previous checkpoint)");
    }
    tracing::info!("{} seed key(s) configured", seeds.len());

    let store = open_store(
        Path::new(&config.output.database_path),
        config.engine.checkpoint_batch_size as usize,
    )
    .context("failed to open checkpoint")?;
    let sink = JsonlSink::open(Path::new(&config.output.records_path))
        .context("failed to open record output")?;
    let driver = HttpDriver::new(&config.session, config.engine.call_timeout());
    let extractor = HttpExtractor::new(&config.target)?;

    let outcome = RunController::new(config, store, Arc::new(driver), Arc::new(extractor))
        .with_sink(Arc::new(sink))
        .with_options(options)
        .with_config_hash(config_hash)
        .with_signal_handlers()
        .run(seeds)
        .await?;

    println!(
        "Run {}: {} ({} done, {} failed, {} pending)",
        outcome.run_id,
        outcome.status.to_db_string(),
        outcome.counters.done,
        outcome.counters.failed,
        outcome.counters.pending
    );

    Ok(ExitCode::from(outcome.exit_code()))
}
