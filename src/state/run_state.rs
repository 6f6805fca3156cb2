//! Run-level status, counters and records

use crate::state::{ItemStatus, WorkItem};
use chrono::{DateTime, Utc};

/// Status of an engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Aggregate item counts for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    pub failed: u64,
}

impl RunCounters {
    /// Tallies a set of items by status
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let mut counters = Self::default();
        for item in items {
            counters.add(item.status);
        }
        counters
    }

    pub fn add(&mut self, status: ItemStatus) {
        self.add_many(status, 1);
    }

    /// Adds `count` items in `status`
    pub fn add_many(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::InProgress => self.in_progress += count,
            ItemStatus::Done => self.done += count,
            ItemStatus::FailedTerminal => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done + self.failed
    }

    /// True when nothing is left to attempt
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Represents one execution of the engine
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub scraper: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// Round the run was in when last persisted (1-based, 0 before the first round)
    pub current_round: u32,
    pub config_hash: String,
    pub counters: RunCounters,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, scraper: impl Into<String>, config_hash: &str) -> Self {
        Self {
            run_id: run_id.into(),
            scraper: scraper.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            current_round: 0,
            config_hash: config_hash.to_string(),
            counters: RunCounters::default(),
        }
    }

    /// Marks the run finished with `status`
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}
