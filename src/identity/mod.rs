//! Identity rotation
//!
//! An identity is whatever the target sees as "who is asking": a logged-in
//! account, an outbound proxy, an anonymizing exit circuit, or nothing at all.
//! This module handles:
//! - Loading the pool from config or a file
//! - Leasing identities round-robin so no identity serves two sessions at once
//! - Cooling an identity down after a block or after its use budget

mod manager;
mod source;

pub use manager::{IdentitySnapshot, Lease, RotationManager};
pub use source::{load_identities, FileIdentitySource, IdentitySource, StaticIdentitySource};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the identity pool
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("No identity became available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("Identity pool is empty")]
    EmptyPool,

    #[error("Identity acquisition cancelled")]
    Cancelled,

    #[error("Failed to read identity file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid identity on line {line} of {path}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },
}

/// What kind of identity this is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Account,
    Proxy,
    Circuit,
    #[default]
    Direct,
}

/// One identity in the pool
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    pub id: String,

    #[serde(default)]
    pub kind: IdentityKind,

    /// Outbound proxy URL (`http://`, `https://` or `socks5://`)
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Identity {
    /// An identity with no proxy or credentials
    pub fn direct() -> Self {
        Self {
            id: "direct".to_string(),
            kind: IdentityKind::Direct,
            proxy: None,
            username: None,
            password: None,
        }
    }

    /// An identity routed through `proxy`
    pub fn with_proxy(id: impl Into<String>, proxy: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdentityKind::Proxy,
            proxy: Some(proxy.into()),
            username: None,
            password: None,
        }
    }
}

// Keeps passwords out of logs
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("proxy", &self.proxy)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Whether an identity can be leased right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Active,
    CoolingDown,
}
