//! Per-worker session ownership: probing, restarts, recycling and the
//! navigation retry helper

use super::{DriverProvider, Session, SessionError, SessionHealth};
use crate::config::SessionConfig;
use crate::engine::Outcome;
use crate::identity::{Identity, Lease, RotationManager};
use crate::{FetchError, FetchResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Asks every worker to recycle its session before its next item
///
/// The resource monitor bumps the generation on a soft memory limit; session
/// managers compare it with the generation their session was opened under.
#[derive(Debug, Clone, Default)]
pub struct RecycleSignal(Arc<AtomicU64>);

impl RecycleSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Owns one worker's session and identity lease
pub struct SessionManager {
    worker: usize,
    provider: Arc<dyn DriverProvider>,
    identities: Arc<RotationManager>,
    recycle: RecycleSignal,
    cancel: CancellationToken,

    max_restarts: u32,
    max_runtime: Option<Duration>,
    navigate_retries: u32,
    navigate_retry_delay: Duration,

    session: Option<Box<dyn Session>>,
    lease: Option<Lease>,
    health: SessionHealth,
    created_at: Option<Instant>,
    ops_since_restart: u64,
    restarts: u32,
    generation: u64,
    rotation_due: bool,
}

impl SessionManager {
    /// Creates a manager; no session is opened until the first
    /// [`ensure_ready`](Self::ensure_ready)
    ///
    /// `cancel` interrupts waits for a free identity.
    pub fn new(
        worker: usize,
        provider: Arc<dyn DriverProvider>,
        identities: Arc<RotationManager>,
        config: &SessionConfig,
        recycle: RecycleSignal,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            provider,
            identities,
            recycle,
            cancel,
            max_restarts: config.max_restarts_per_worker,
            max_runtime: config.max_runtime(),
            navigate_retries: config.navigate_retries.max(1),
            navigate_retry_delay: config.navigate_retry_delay(),
            session: None,
            lease: None,
            health: SessionHealth::Created,
            created_at: None,
            ops_since_restart: 0,
            restarts: 0,
            generation: 0,
            rotation_due: false,
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn health(&self) -> SessionHealth {
        self.health
    }

    /// Restarts charged since the last successful unit of work
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn ops_since_restart(&self) -> u64 {
        self.ops_since_restart
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.lease.as_ref().map(Lease::identity)
    }

    /// Mutable access to the live session, if one is open
    pub fn session(&mut self) -> Option<&mut (dyn Session + 'static)> {
        self.session.as_deref_mut()
    }

    /// Makes sure a healthy session exists before a unit of work
    ///
    /// Opens the first session, swaps out sessions that are too old or were
    /// asked to recycle, and restarts sessions that fail their probe.
    pub async fn ensure_ready(&mut self) -> Result<(), SessionError> {
        match self.health {
            SessionHealth::Terminated => return Err(SessionError::Terminated),
            SessionHealth::Created => return self.open().await,
            SessionHealth::Unhealthy => return self.restart(Outcome::FatalSession).await,
            SessionHealth::Healthy => {}
        }

        if let Some(reason) = self.recycle_reason() {
            tracing::info!("Worker {} recycling session: {}", self.worker, reason);
            self.close_current(Outcome::Success).await;
            return self.open().await;
        }

        let probe = match self.session.as_mut() {
            Some(session) => session.probe().await,
            None => Err(FetchError::FatalSession("no session".to_string())),
        };

        if let Err(e) = probe {
            tracing::warn!("Worker {} session failed probe: {}", self.worker, e);
            self.health = SessionHealth::Unhealthy;
            return self.restart(Outcome::FatalSession).await;
        }

        Ok(())
    }

    /// Counts one completed unit of work on the current session
    ///
    /// A success clears the restart budget, so only consecutive failed
    /// restarts can end the worker.
    pub fn record_use(&mut self, outcome: Outcome) {
        self.ops_since_restart += 1;
        if outcome == Outcome::Success {
            self.restarts = 0;
        }
        if let Some(lease) = &self.lease {
            if self.identities.record_use(lease) {
                self.rotation_due = true;
            }
        }
    }

    /// Replaces the session after a failure
    ///
    /// A fatal session error reopens under the same identity. Anything else
    /// releases the identity with `outcome`, so a block puts it into cooldown
    /// before the next one is leased. Every call is charged against the
    /// restart budget; once it is spent the session is torn down and the
    /// worker should stop.
    pub async fn restart(&mut self, outcome: Outcome) -> Result<(), SessionError> {
        if self.health == SessionHealth::Terminated {
            return Err(SessionError::Terminated);
        }

        self.restarts += 1;
        if self.restarts > self.max_restarts {
            tracing::error!(
                "Worker {} exceeded {} session restarts, stopping",
                self.worker,
                self.max_restarts
            );
            self.teardown().await;
            return Err(SessionError::RestartsExhausted {
                worker: self.worker,
                max: self.max_restarts,
            });
        }

        tracing::info!(
            "Worker {} restarting session after {} ({}/{})",
            self.worker,
            outcome,
            self.restarts,
            self.max_restarts
        );

        if outcome == Outcome::FatalSession && !self.rotation_due {
            if let Some(lease) = self.lease.take() {
                self.close_session().await;
                return self.open_with(lease).await;
            }
        }

        self.close_current(outcome).await;
        self.open().await
    }

    /// Navigates to `url` and checks the page with `validate`
    ///
    /// Tries up to `navigate_retries` times, restarts the session once, then
    /// tries as many times again before giving up with the last error. Blocks
    /// and client errors are returned at once since retrying them in place
    /// only makes things worse.
    pub async fn navigate_with_retry<F>(&mut self, url: &str, validate: F) -> FetchResult<String>
    where
        F: Fn(&str) -> FetchResult<()> + Send + Sync,
    {
        let mut last_error = None;

        for phase in 0..2 {
            if phase == 1 {
                if let Err(e) = self.restart(Outcome::FatalSession).await {
                    return Err(FetchError::FatalSession(e.to_string()));
                }
            }

            for attempt in 1..=self.navigate_retries {
                let result = match self.session.as_mut() {
                    Some(session) => match session.navigate(url).await {
                        Ok(body) => validate(&body).map(|_| body),
                        Err(e) => Err(e),
                    },
                    None => Err(FetchError::FatalSession("no session".to_string())),
                };

                let error = match result {
                    Ok(body) => return Ok(body),
                    Err(e) => e,
                };

                tracing::debug!(
                    "Worker {} navigation attempt {}/{} to {} failed: {}",
                    self.worker,
                    attempt,
                    self.navigate_retries,
                    url,
                    error
                );

                match &error {
                    FetchError::BlockSignal(_) => return Err(error),
                    FetchError::HttpStatus { status, .. } if *status < 500 => return Err(error),
                    FetchError::FatalSession(_) => {
                        self.health = SessionHealth::Unhealthy;
                        last_error = Some(error);
                        break;
                    }
                    _ => last_error = Some(error),
                }

                if attempt < self.navigate_retries && !self.navigate_retry_delay.is_zero() {
                    tokio::time::sleep(self.navigate_retry_delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| FetchError::Other(format!("navigation to {} failed", url))))
    }

    /// Closes the session and returns the identity for good
    pub async fn teardown(&mut self) {
        self.close_current(Outcome::Success).await;
        self.health = SessionHealth::Terminated;
    }

    fn recycle_reason(&self) -> Option<&'static str> {
        if self.rotation_due {
            return Some("identity reached its rotation limit");
        }
        if self.recycle.generation() != self.generation {
            return Some("resource cleanup requested");
        }
        match (self.max_runtime, self.created_at) {
            (Some(max), Some(created)) if created.elapsed() >= max => {
                Some("maximum session runtime reached")
            }
            _ => None,
        }
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        let lease = self.identities.acquire(&self.cancel).await?;
        self.open_with(lease).await
    }

    async fn open_with(&mut self, lease: Lease) -> Result<(), SessionError> {
        match self.provider.new_session(lease.identity()).await {
            Ok(session) => {
                tracing::debug!(
                    "Worker {} opened session with identity {}",
                    self.worker,
                    lease.identity()
                );
                self.session = Some(session);
                self.lease = Some(lease);
                self.health = SessionHealth::Healthy;
                self.created_at = Some(Instant::now());
                self.ops_since_restart = 0;
                self.generation = self.recycle.generation();
                self.rotation_due = false;
                Ok(())
            }
            Err(e) => {
                self.identities.release(lease, Outcome::FatalSession);
                self.health = SessionHealth::Unhealthy;
                Err(SessionError::Open(e))
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.created_at = None;
    }

    async fn close_current(&mut self, outcome: Outcome) {
        self.close_session().await;
        if let Some(lease) = self.lease.take() {
            self.identities.release(lease, outcome);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Aborted workers never reach teardown; give the identity back anyway
        if let Some(lease) = self.lease.take() {
            self.identities.release(lease, Outcome::Success);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted session; pops one navigate result per call
    struct ScriptedSession {
        results: Arc<Mutex<VecDeque<FetchResult<String>>>>,
        probe_ok: bool,
    }

    #[async_trait]
    impl Session for ScriptedSession {
        async fn probe(&mut self) -> FetchResult<()> {
            if self.probe_ok {
                Ok(())
            } else {
                Err(FetchError::FatalSession("dead".into()))
            }
        }

        async fn navigate(&mut self, _url: &str) -> FetchResult<String> {
            self.results
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("<html>ok</html>".to_string()))
        }

        async fn close(&mut self) {}
    }

    struct ScriptedDriver {
        results: Arc<Mutex<VecDeque<FetchResult<String>>>>,
        opened: Arc<Mutex<Vec<String>>>,
        probe_ok: bool,
    }

    #[async_trait]
    impl DriverProvider for ScriptedDriver {
        async fn new_session(&self, identity: &Identity) -> FetchResult<Box<dyn Session>> {
            self.opened.lock().push(identity.id.clone());
            Ok(Box::new(ScriptedSession {
                results: self.results.clone(),
                probe_ok: self.probe_ok,
            }))
        }
    }

    struct Fixture {
        manager: SessionManager,
        identities: Arc<RotationManager>,
        results: Arc<Mutex<VecDeque<FetchResult<String>>>>,
        opened: Arc<Mutex<Vec<String>>>,
        recycle: RecycleSignal,
    }

    fn fixture(config: SessionConfig, probe_ok: bool) -> Fixture {
        let identities = Arc::new(
            RotationManager::new(
                vec![
                    Identity {
                        id: "a".into(),
                        ..Identity::direct()
                    },
                    Identity {
                        id: "b".into(),
                        ..Identity::direct()
                    },
                ],
                &IdentityConfig::default(),
            )
            .unwrap(),
        );
        let results = Arc::new(Mutex::new(VecDeque::new()));
        let opened = Arc::new(Mutex::new(Vec::new()));
        let driver = Arc::new(ScriptedDriver {
            results: results.clone(),
            opened: opened.clone(),
            probe_ok,
        });
        let recycle = RecycleSignal::new();
        let manager = SessionManager::new(
            1,
            driver,
            identities.clone(),
            &config,
            recycle.clone(),
            CancellationToken::new(),
        );
        Fixture {
            manager,
            identities,
            results,
            opened,
            recycle,
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            max_restarts_per_worker: 2,
            navigate_retries: 2,
            navigate_retry_delay_ms: 0,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_ensure_opens_session() {
        let mut f = fixture(config(), true);
        assert_eq!(f.manager.health(), SessionHealth::Created);
        f.manager.ensure_ready().await.unwrap();
        assert_eq!(f.manager.health(), SessionHealth::Healthy);
        assert_eq!(f.manager.identity().unwrap().id, "a");
        assert_eq!(f.manager.restarts(), 0);
    }

    #[tokio::test]
    async fn test_block_restart_rotates_identity() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        f.manager.restart(Outcome::BlockSignal).await.unwrap();

        assert_eq!(f.manager.identity().unwrap().id, "b");
        assert_eq!(*f.opened.lock(), vec!["a".to_string(), "b".to_string()]);
        let snapshot = f.identities.snapshot();
        assert_eq!(snapshot[0].state, crate::identity::IdentityState::CoolingDown);
    }

    #[tokio::test]
    async fn test_fatal_restart_keeps_identity() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        f.manager.restart(Outcome::FatalSession).await.unwrap();

        assert_eq!(f.manager.identity().unwrap().id, "a");
        assert_eq!(*f.opened.lock(), vec!["a".to_string(), "a".to_string()]);
        let snapshot = f.identities.snapshot();
        assert!(snapshot[0].leased);
        assert!(!snapshot[1].leased);
    }

    #[tokio::test]
    async fn test_success_resets_restart_budget() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();

        // Isolated crashes separated by good work never exhaust the budget
        for _ in 0..5 {
            f.manager.restart(Outcome::FatalSession).await.unwrap();
            f.manager.restart(Outcome::FatalSession).await.unwrap();
            f.manager.record_use(Outcome::Success);
            assert_eq!(f.manager.restarts(), 0);
        }

        f.manager.restart(Outcome::FatalSession).await.unwrap();
        f.manager.record_use(Outcome::Transient);
        assert_eq!(f.manager.restarts(), 1);
    }

    #[tokio::test]
    async fn test_restart_budget() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        f.manager.restart(Outcome::FatalSession).await.unwrap();
        f.manager.restart(Outcome::FatalSession).await.unwrap();

        let err = f.manager.restart(Outcome::FatalSession).await.unwrap_err();
        assert!(matches!(err, SessionError::RestartsExhausted { max: 2, .. }));
        assert_eq!(f.manager.health(), SessionHealth::Terminated);
        assert!(f.identities.snapshot().iter().all(|s| !s.leased));
    }

    #[tokio::test]
    async fn test_failed_probe_restarts() {
        let mut f = fixture(config(), false);
        f.manager.ensure_ready().await.unwrap();
        f.manager.ensure_ready().await.unwrap();
        assert_eq!(f.manager.restarts(), 1);
    }

    #[tokio::test]
    async fn test_recycle_request_is_free() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        f.recycle.request();
        f.manager.ensure_ready().await.unwrap();
        assert_eq!(f.opened.lock().len(), 2);
        assert_eq!(f.manager.restarts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_runtime_recycles() {
        let mut f = fixture(
            SessionConfig {
                max_browser_runtime_seconds: 60,
                ..config()
            },
            true,
        );
        f.manager.ensure_ready().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        f.manager.ensure_ready().await.unwrap();
        assert_eq!(f.opened.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_navigate_retries_then_restarts() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        {
            let mut results = f.results.lock();
            for _ in 0..3 {
                results.push_back(Err(FetchError::TransientNetwork("reset".into())));
            }
        }

        let body = f
            .manager
            .navigate_with_retry("https://example.com", |_| Ok(()))
            .await
            .unwrap();
        assert_eq!(body, "<html>ok</html>");
        assert_eq!(f.manager.restarts(), 1);
    }

    #[tokio::test]
    async fn test_navigate_gives_up_after_second_phase() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        {
            let mut results = f.results.lock();
            for _ in 0..4 {
                results.push_back(Err(FetchError::TransientNetwork("reset".into())));
            }
        }

        let err = f
            .manager
            .navigate_with_retry("https://example.com", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TransientNetwork(_)));
    }

    #[tokio::test]
    async fn test_navigate_surfaces_block_immediately() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        f.results
            .lock()
            .push_back(Err(FetchError::BlockSignal("captcha".into())));

        let err = f
            .manager
            .navigate_with_retry("https://example.com", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::BlockSignal(_)));
        assert_eq!(f.manager.restarts(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_is_retried() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        f.results.lock().push_back(Ok("<html>loading</html>".into()));

        let body = f
            .manager
            .navigate_with_retry("https://example.com", |body| {
                if body.contains("ok") {
                    Ok(())
                } else {
                    Err(FetchError::DataInvalid("not loaded".into()))
                }
            })
            .await
            .unwrap();
        assert!(body.contains("ok"));
    }

    #[tokio::test]
    async fn test_drop_releases_identity() {
        let mut f = fixture(config(), true);
        f.manager.ensure_ready().await.unwrap();
        let identities = f.identities.clone();
        drop(f);
        assert!(identities.snapshot().iter().all(|s| !s.leased));
    }
}
