/// Work item state definitions for tracking scrape progress
///
/// This module defines the states a work item moves through and the item record
/// itself, including its per-method retry counters.
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Represents the current state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    /// Waiting to be taken by a worker (possibly after a backoff delay)
    Pending,

    /// Held by exactly one worker
    InProgress,

    /// Extracted successfully; never re-enqueued without a refresh pass
    Done,

    /// Retry budget exhausted on every configured method
    FailedTerminal,
}

impl ItemStatus {
    /// Returns true if no further processing happens without a refresh
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::FailedTerminal)
    }

    /// Returns true if a transition from `self` to `to` is legal during a run
    ///
    /// Refresh passes bypass this check on purpose: they rewrite terminal rows
    /// back to `Pending` directly in the store.
    pub fn can_transition_to(&self, to: ItemStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::FailedTerminal)
                | (Self::InProgress, Self::Pending)
                | (Self::InProgress, Self::Done)
                | (Self::InProgress, Self::FailedTerminal)
        )
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    /// Parses a status from its database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed_terminal" => Some(Self::FailedTerminal),
            _ => None,
        }
    }

    /// Returns all possible statuses
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::InProgress,
            Self::Done,
            Self::FailedTerminal,
        ]
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// One unit of scrape work
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable natural identifier (product+company, page number, ...)
    pub key: String,

    /// Acquisition path that currently owns the item
    pub method: String,

    /// Attempt counter per method
    pub attempts_by_method: BTreeMap<String, u32>,

    /// Full retry rounds survived under the current method
    pub loop_count: u32,

    /// Records extracted per method
    pub records_found: BTreeMap<String, u64>,

    pub status: ItemStatus,

    pub last_error: Option<String>,

    pub updated_at: DateTime<Utc>,

    /// Set when the item was moved to a new method and has not been taken since
    pub handoff_pending: bool,

    /// Failures since the last success or round change; drives backoff
    pub consecutive_failures: u32,

    /// DATA_INVALID outcomes under the current method
    pub invalid_count: u32,
}

impl WorkItem {
    /// Creates a fresh pending item owned by `method`
    pub fn new(key: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            method: method.into(),
            attempts_by_method: BTreeMap::new(),
            loop_count: 0,
            records_found: BTreeMap::new(),
            status: ItemStatus::Pending,
            last_error: None,
            updated_at: Utc::now(),
            handoff_pending: false,
            consecutive_failures: 0,
            invalid_count: 0,
        }
    }

    /// Attempts made under the current method
    pub fn attempts(&self) -> u32 {
        self.attempts_for(&self.method)
    }

    pub fn attempts_for(&self, method: &str) -> u32 {
        self.attempts_by_method.get(method).copied().unwrap_or(0)
    }

    /// Attempts summed across every method
    pub fn total_attempts(&self) -> u32 {
        self.attempts_by_method.values().sum()
    }

    /// Charges one attempt to the current method and returns the new count
    pub fn record_attempt(&mut self) -> u32 {
        let counter = self
            .attempts_by_method
            .entry(self.method.clone())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Adds to the records found under the current method
    pub fn record_found(&mut self, count: u64) {
        *self
            .records_found
            .entry(self.method.clone())
            .or_insert(0) += count;
    }

    /// Moves the item to `to`, rejecting transitions the lifecycle forbids
    pub fn transition(&mut self, to: ItemStatus) -> Result<(), HarvestError> {
        if !self.status.can_transition_to(to) {
            return Err(HarvestError::InvalidTransition {
                key: self.key.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    /// Hands the item to another acquisition method
    ///
    /// The method, the cleared round counters and the `handoff_pending` flag are
    /// written as one unit so a resume never sees a half-switched item.
    pub fn hand_off(&mut self, to_method: &str) {
        self.method = to_method.to_string();
        self.loop_count = 0;
        self.consecutive_failures = 0;
        self.invalid_count = 0;
        self.handoff_pending = true;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
