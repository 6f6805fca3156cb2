//! Identity leasing, use counting and cooldowns

use super::{Identity, IdentityError, IdentityState};
use crate::config::IdentityConfig;
use crate::engine::Outcome;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Slot {
    identity: Identity,
    uses_since_rotation: u32,
    cooldown_until: Option<Instant>,
    leased: bool,
}

impl Slot {
    fn state(&self, now: Instant) -> IdentityState {
        match self.cooldown_until {
            Some(until) if until > now => IdentityState::CoolingDown,
            _ => IdentityState::Active,
        }
    }
}

#[derive(Debug)]
struct Pool {
    slots: Vec<Slot>,
    cursor: usize,
}

/// An identity held by one session
///
/// Hand it back with [`RotationManager::release`].
#[derive(Debug)]
pub struct Lease {
    identity: Identity,
    slot: usize,
}

impl Lease {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Point-in-time view of one identity
#[derive(Debug, Clone)]
pub struct IdentitySnapshot {
    pub id: String,
    pub state: IdentityState,
    pub leased: bool,
    pub uses_since_rotation: u32,
    pub cooldown_remaining: Option<Duration>,
}

/// Leases identities round-robin and cools them down on blocks
pub struct RotationManager {
    pool: Mutex<Pool>,
    released: Notify,
    rotation_limit: u32,
    cooldown: Duration,
    acquire_timeout: Duration,
}

impl RotationManager {
    pub fn new(identities: Vec<Identity>, config: &IdentityConfig) -> Result<Self, IdentityError> {
        if identities.is_empty() {
            return Err(IdentityError::EmptyPool);
        }

        let slots = identities
            .into_iter()
            .map(|identity| Slot {
                identity,
                uses_since_rotation: 0,
                cooldown_until: None,
                leased: false,
            })
            .collect();

        Ok(Self {
            pool: Mutex::new(Pool { slots, cursor: 0 }),
            released: Notify::new(),
            rotation_limit: config.rotation_limit.max(1),
            cooldown: config.cooldown(),
            acquire_timeout: config.acquire_timeout(),
        })
    }

    pub fn len(&self) -> usize {
        self.pool.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leases the next free, active identity
    ///
    /// Cooling identities are waited out however long that takes. The acquire
    /// timeout only bounds waits where every identity is leased to a session.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Lease, IdentityError> {
        let mut deadline: Option<Instant> = None;

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let next_cooldown = match self.try_acquire() {
                Ok(lease) => return Ok(lease),
                Err(next_cooldown) => next_cooldown,
            };

            let wake_at = match next_cooldown {
                Some(at) => {
                    deadline = None;
                    at
                }
                None => {
                    let at = *deadline
                        .get_or_insert_with(|| Instant::now() + self.acquire_timeout);
                    if Instant::now() >= at {
                        return Err(IdentityError::AcquireTimeout(self.acquire_timeout));
                    }
                    at
                }
            };

            tracing::debug!(
                "All identities busy or cooling down, waiting up to {:?}",
                wake_at.saturating_duration_since(Instant::now())
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(IdentityError::Cancelled),
                _ = &mut released => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Leases without waiting
    ///
    /// On failure returns the earliest time a cooling identity becomes active,
    /// if any identity is cooling down and not leased.
    pub fn try_acquire(&self) -> Result<Lease, Option<Instant>> {
        let mut pool = self.pool.lock();
        let now = Instant::now();
        let count = pool.slots.len();
        let mut earliest: Option<Instant> = None;

        for offset in 0..count {
            let index = (pool.cursor + offset) % count;
            let slot = &mut pool.slots[index];
            if slot.leased {
                continue;
            }

            match slot.state(now) {
                IdentityState::Active => {
                    if slot.cooldown_until.take().is_some() {
                        tracing::info!("Identity {} is active again", slot.identity);
                    }
                    slot.leased = true;
                    let lease = Lease {
                        identity: slot.identity.clone(),
                        slot: index,
                    };
                    pool.cursor = (index + 1) % count;
                    return Ok(lease);
                }
                IdentityState::CoolingDown => {
                    if let Some(until) = slot.cooldown_until {
                        earliest = Some(earliest.map_or(until, |e| e.min(until)));
                    }
                }
            }
        }

        Err(earliest)
    }

    /// Counts one unit of work done under `lease`
    ///
    /// Returns true once the identity has reached its rotation limit and should
    /// be swapped out.
    pub fn record_use(&self, lease: &Lease) -> bool {
        let mut pool = self.pool.lock();
        match pool.slots.get_mut(lease.slot) {
            Some(slot) => {
                slot.uses_since_rotation += 1;
                slot.uses_since_rotation >= self.rotation_limit
            }
            None => false,
        }
    }

    /// Returns a lease
    ///
    /// A block, or a spent use budget, puts the identity into cooldown.
    pub fn release(&self, lease: Lease, outcome: Outcome) {
        {
            let mut pool = self.pool.lock();
            if let Some(slot) = pool.slots.get_mut(lease.slot) {
                slot.leased = false;

                let blocked = outcome == Outcome::BlockSignal;
                if blocked || slot.uses_since_rotation >= self.rotation_limit {
                    slot.cooldown_until = Some(Instant::now() + self.cooldown);
                    slot.uses_since_rotation = 0;
                    if blocked {
                        tracing::warn!(
                            "Identity {} blocked, cooling down for {:?}",
                            slot.identity,
                            self.cooldown
                        );
                    } else {
                        tracing::info!(
                            "Identity {} reached its rotation limit, cooling down for {:?}",
                            slot.identity,
                            self.cooldown
                        );
                    }
                }
            }
        }
        self.released.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<IdentitySnapshot> {
        let pool = self.pool.lock();
        let now = Instant::now();
        pool.slots
            .iter()
            .map(|slot| IdentitySnapshot {
                id: slot.identity.id.clone(),
                state: slot.state(now),
                leased: slot.leased,
                uses_since_rotation: slot.uses_since_rotation,
                cooldown_remaining: slot
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| until - now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager(ids: &[&str], rotation_limit: u32) -> RotationManager {
        let identities = ids
            .iter()
            .map(|id| Identity {
                id: id.to_string(),
                ..Identity::direct()
            })
            .collect();
        let config = IdentityConfig {
            rotation_limit,
            cooldown_seconds: 60,
            acquire_timeout_seconds: 120,
            ..IdentityConfig::default()
        };
        RotationManager::new(identities, &config).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(
            RotationManager::new(Vec::new(), &IdentityConfig::default()),
            Err(IdentityError::EmptyPool)
        ));
    }

    #[tokio::test]
    async fn test_round_robin() {
        let manager = manager(&["a", "b", "c"], 10);
        let cancel = CancellationToken::new();

        let first = manager.acquire(&cancel).await.unwrap();
        assert_eq!(first.identity().id, "a");
        manager.release(first, Outcome::Success);

        let second = manager.acquire(&cancel).await.unwrap();
        assert_eq!(second.identity().id, "b");
    }

    #[tokio::test]
    async fn test_never_leased_twice() {
        let manager = manager(&["a", "b"], 10);
        let cancel = CancellationToken::new();

        let a = manager.acquire(&cancel).await.unwrap();
        let b = manager.acquire(&cancel).await.unwrap();
        assert_ne!(a.identity().id, b.identity().id);
        assert!(manager.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_cools_down() {
        let manager = manager(&["a", "b"], 10);
        let cancel = CancellationToken::new();

        let a = manager.acquire(&cancel).await.unwrap();
        manager.release(a, Outcome::BlockSignal);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0].state, IdentityState::CoolingDown);
        assert_eq!(snapshot[1].state, IdentityState::Active);

        // The cooling identity is skipped
        let next = manager.acquire(&cancel).await.unwrap();
        assert_eq!(next.identity().id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_earliest_cooldown() {
        let manager = manager(&["a"], 10);
        let cancel = CancellationToken::new();

        let a = manager.acquire(&cancel).await.unwrap();
        manager.release(a, Outcome::BlockSignal);

        let started = Instant::now();
        let again = manager.acquire(&cancel).await.unwrap();
        assert_eq!(again.identity().id, "a");
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(manager.snapshot()[0].state, IdentityState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_limit() {
        let manager = manager(&["a", "b"], 2);
        let cancel = CancellationToken::new();

        let a = manager.acquire(&cancel).await.unwrap();
        assert!(!manager.record_use(&a));
        assert!(manager.record_use(&a));
        manager.release(a, Outcome::Success);

        assert_eq!(manager.snapshot()[0].state, IdentityState::CoolingDown);
        assert_eq!(manager.snapshot()[0].uses_since_rotation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let config = IdentityConfig {
            acquire_timeout_seconds: 5,
            ..IdentityConfig::default()
        };
        let manager = RotationManager::new(vec![Identity::direct()], &config).unwrap();
        let cancel = CancellationToken::new();

        let _held = manager.acquire(&cancel).await.unwrap();
        let err = manager.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, IdentityError::AcquireTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_outlasts_acquire_timeout() {
        let config = IdentityConfig {
            cooldown_seconds: 60,
            acquire_timeout_seconds: 5,
            ..IdentityConfig::default()
        };
        let manager = RotationManager::new(vec![Identity::direct()], &config).unwrap();
        let cancel = CancellationToken::new();

        let lease = manager.acquire(&cancel).await.unwrap();
        manager.release(lease, Outcome::BlockSignal);

        let started = Instant::now();
        let again = manager.acquire(&cancel).await.unwrap();
        assert_eq!(again.identity().id, "direct");
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let manager = Arc::new(manager(&["a"], 10));
        let cancel = CancellationToken::new();
        let held = manager.acquire(&cancel).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.acquire(&cancel).await })
        };

        tokio::task::yield_now().await;
        manager.release(held, Outcome::Success);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.identity().id, "a");
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let manager = manager(&["a"], 10);
        let cancel = CancellationToken::new();
        let _held = manager.acquire(&cancel).await.unwrap();

        cancel.cancel();
        assert!(matches!(
            manager.acquire(&cancel).await,
            Err(IdentityError::Cancelled)
        ));
    }
}
