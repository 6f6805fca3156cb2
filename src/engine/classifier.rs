//! Failure classification
//!
//! Every error an extractor or driver raises is mapped to exactly one
//! [`Outcome`]. Typed errors map directly. Free-form messages go through an
//! ordered table of case-insensitive substring rules; anything unmatched is
//! treated as transient so a surprise error never takes an item out of the
//! retry loop on its own.

use crate::config::ClassifierConfig;
use crate::FetchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    /// Network hiccup or timeout; retry after a backoff
    Transient,
    /// Session crashed or is no longer usable; restart it and retry
    FatalSession,
    /// Target is refusing us (captcha, 429, ban page); rotate identity
    BlockSignal,
    /// Page loaded but the expected content is missing
    DataInvalid,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Transient => "transient",
            Self::FatalSession => "fatal-session",
            Self::BlockSignal => "block-signal",
            Self::DataInvalid => "data-invalid",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One substring rule of the classification table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassifierRule {
    /// Case-insensitive substring searched in the error message
    pub contains: String,
    pub outcome: Outcome,
}

impl ClassifierRule {
    pub fn new(contains: &str, outcome: Outcome) -> Self {
        Self {
            contains: contains.to_string(),
            outcome,
        }
    }
}

/// Rules applied after any configured ones
pub fn default_rules() -> Vec<ClassifierRule> {
    let fatal = [
        "tab crashed",
        "invalid session id",
        "session deleted",
        "chrome not reachable",
        "browser has disconnected",
        "target closed",
    ];
    let block = [
        "captcha",
        "too many requests",
        "access denied",
        "rate limit",
        "forbidden",
        "unusual traffic",
    ];

    fatal
        .iter()
        .map(|s| ClassifierRule::new(s, Outcome::FatalSession))
        .chain(block.iter().map(|s| ClassifierRule::new(s, Outcome::BlockSignal)))
        .collect()
}

/// Maps fetch errors to outcomes
#[derive(Debug, Clone)]
pub struct Classifier {
    /// Lowercased needles, in match order
    rules: Vec<(String, Outcome)>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_rules(default_rules())
    }
}

impl Classifier {
    /// Builds the table from configuration
    ///
    /// Configured rules come first so they can override a default. With
    /// `replace-defaults` the built-in rules are dropped entirely.
    pub fn new(config: &ClassifierConfig) -> Self {
        let mut rules = config.rules.clone();
        if !config.replace_defaults {
            rules.extend(default_rules());
        }
        Self::from_rules(rules)
    }

    pub fn from_rules(rules: Vec<ClassifierRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .filter(|r| !r.contains.is_empty())
                .map(|r| (r.contains.to_lowercase(), r.outcome))
                .collect(),
        }
    }

    pub fn classify(&self, error: &FetchError) -> Outcome {
        match error {
            FetchError::TransientNetwork(_) | FetchError::Timeout(_) => Outcome::Transient,
            FetchError::FatalSession(_) => Outcome::FatalSession,
            FetchError::BlockSignal(_) => Outcome::BlockSignal,
            FetchError::DataInvalid(_) => Outcome::DataInvalid,
            FetchError::HttpStatus { status, .. } => classify_status(*status),
            FetchError::Other(message) => self.classify_message(message),
        }
    }

    /// Runs a free-form message through the rule table
    pub fn classify_message(&self, message: &str) -> Outcome {
        let haystack = message.to_lowercase();
        self.rules
            .iter()
            .find(|(needle, _)| haystack.contains(needle.as_str()))
            .map(|(_, outcome)| *outcome)
            .unwrap_or(Outcome::Transient)
    }
}

fn classify_status(status: u16) -> Outcome {
    match status {
        403 | 429 => Outcome::BlockSignal,
        404 | 410 => Outcome::DataInvalid,
        _ => Outcome::Transient,
    }
}
