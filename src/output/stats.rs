//! Statistics from a run checkpoint
//!
//! This module provides functionality for extracting and displaying run
//! statistics from the checkpoint store.

use crate::state::{RunCounters, RunRecord};
use crate::storage::{CheckpointStore, StorageError};

/// Checkpoint statistics for one run
#[derive(Debug, Clone)]
pub struct RunStatistics {
    pub run: RunRecord,

    /// Live counts from the item table
    pub counters: RunCounters,

    /// Terminally failed items with their last error
    pub failures: Vec<(String, Option<String>)>,
}

/// Loads statistics for `run_id`, or for the latest run when `None`
///
/// Returns `Ok(None)` when the checkpoint holds no such run.
pub fn load_statistics(
    store: &dyn CheckpointStore,
    run_id: Option<&str>,
) -> Result<Option<RunStatistics>, StorageError> {
    let run = match run_id {
        Some(id) => store.find_run(id)?,
        None => store.latest_run()?,
    };

    let Some(run) = run else {
        return Ok(None);
    };

    let counters = store.count_items(&run.run_id)?;
    let failures = store.failed_items(&run.run_id)?;

    Ok(Some(RunStatistics {
        run,
        counters,
        failures,
    }))
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &RunStatistics) {
    let run = &stats.run;
    let counters = &stats.counters;

    println!("=== Run Statistics ===\n");

    println!("Run:");
    println!("  Id: {}", run.run_id);
    println!("  Scraper: {}", run.scraper);
    println!("  Status: {}", run.status.to_db_string());
    println!("  Started: {}", run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        let elapsed = finished - run.started_at;
        println!(
            "  Finished: {} ({}s)",
            finished.to_rfc3339(),
            elapsed.num_seconds()
        );
    }
    println!("  Round: {}", run.current_round);
    println!();

    println!("Items:");
    let total = counters.total();
    for (label, count) in [
        ("done", counters.done),
        ("failed", counters.failed),
        ("pending", counters.pending),
        ("in progress", counters.in_progress),
    ] {
        println!("  {}: {} ({:.1}%)", label, count, percentage(count, total));
    }
    println!("  total: {}", total);
    println!();

    if !stats.failures.is_empty() {
        println!("Failed Items ({}):", stats.failures.len());
        for (key, error) in stats.failures.iter().take(20) {
            println!("  - {}: {}", key, error.as_deref().unwrap_or("unknown"));
        }
        if stats.failures.len() > 20 {
            println!("  ... and {} more", stats.failures.len() - 20);
        }
        println!();
    }

    println!(
        "Success Rate: {:.1}% ({} / {} items done)",
        percentage(counters.done, total),
        counters.done,
        total
    );
}

fn percentage(count: u64, total: u64) -> f64 {
    if total > 0 {
        (count as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}
