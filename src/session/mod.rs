//! Session lifecycle
//!
//! A session is one live browser or HTTP client bound to one identity. Each
//! worker owns exactly one [`SessionManager`], which probes the session before
//! every unit of work, restarts it when it breaks or gets blocked, and swaps it
//! out when it has been alive too long.
//!
//! The automation backend is pluggable through [`DriverProvider`]. The crate
//! ships an HTTP driver built on `reqwest`.

mod extractor;
mod http;
mod manager;

pub use extractor::{Extractor, HttpExtractor};
pub use http::{build_http_client, HttpDriver, HttpSession};
pub use manager::{RecycleSignal, SessionManager};

use crate::identity::{Identity, IdentityError};
use crate::FetchResult;
use async_trait::async_trait;
use thiserror::Error;

/// Errors that end a worker's session management
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Worker {worker} exceeded {max} session restarts")]
    RestartsExhausted { worker: usize, max: u32 },

    #[error("Could not open a session: {0}")]
    Open(crate::FetchError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Session has been torn down")]
    Terminated,
}

/// Health of a worker's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    /// No session opened yet
    Created,
    Healthy,
    /// Failed a probe or an operation; must restart before more work
    Unhealthy,
    Terminated,
}

/// One live automation session
#[async_trait]
pub trait Session: Send {
    /// Cheap liveness check run before every unit of work
    async fn probe(&mut self) -> FetchResult<()>;

    /// Loads `url` and returns the page content
    async fn navigate(&mut self, url: &str) -> FetchResult<String>;

    /// Releases the underlying browser or connection pool
    async fn close(&mut self);
}

/// Opens sessions bound to an identity
#[async_trait]
pub trait DriverProvider: Send + Sync {
    async fn new_session(&self, identity: &Identity) -> FetchResult<Box<dyn Session>>;
}
