//! Work queue over the checkpointed items
//!
//! This module handles:
//! - Handing each pending item to exactly one worker at a time
//! - Delayed visibility for items waiting out a backoff
//! - Round accounting: items that spent their round budget are parked until
//!   everything else in the round has settled
//! - Writing every state change through to the checkpoint store
//!
//! All bookkeeping lives behind one lock. Store writes happen while that lock
//! is held, so a key's checkpoint row can never be written out of order.

use crate::engine::retry::{Decision, RetryPolicy};
use crate::state::{ItemStatus, RunCounters, WorkItem};
use crate::storage::SharedStore;
use crate::{HarvestError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Notifications the queue sends to the run controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A new round started with `items` items offered
    RoundStarted { round: u32, items: usize },

    /// Nothing is left to offer or in flight
    Drained,
}

/// An item waiting out a backoff delay
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    key: String,
}

// Earliest deadline pops first from the max-heap
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result of one non-blocking take
#[derive(Debug)]
pub enum TakeResult {
    Item(WorkItem),

    /// Nothing is ready; `until` is the next delay expiry if there is one
    Wait { until: Option<Instant> },

    /// The queue will never issue another item
    Finished,
}

#[derive(Debug, Default)]
struct QueueState {
    items: HashMap<String, WorkItem>,
    ready: VecDeque<String>,
    delayed: BinaryHeap<Delayed>,
    parked: Vec<String>,
    in_flight: HashSet<String>,
    round: u32,
    issued: u64,
    max_items: Option<u64>,
    closed: bool,
    drained: bool,
}

impl QueueState {
    fn promote_delayed(&mut self, now: Instant) {
        while let Some(next) = self.delayed.peek() {
            if next.ready_at > now {
                break;
            }
            if let Some(entry) = self.delayed.pop() {
                self.ready.push_back(entry.key);
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.max_items.is_some_and(|max| self.issued >= max)
    }

    fn counters(&self) -> RunCounters {
        RunCounters::from_items(self.items.values())
    }
}

/// Thread-safe queue shared by all workers
pub struct WorkQueue {
    run_id: String,
    state: Mutex<QueueState>,
    store: SharedStore,
    notify: Notify,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
}

impl WorkQueue {
    /// Builds the queue from loaded items
    ///
    /// Terminal items are kept for counting but never offered. Pending items
    /// that already exceed their budget under `policy` are handed off or failed
    /// before the first take.
    pub fn new(
        run_id: impl Into<String>,
        items: Vec<WorkItem>,
        store: SharedStore,
        policy: &RetryPolicy,
        start_round: u32,
    ) -> Result<Self> {
        let run_id = run_id.into();
        let mut state = QueueState {
            round: start_round.max(1),
            ..QueueState::default()
        };

        let mut handoffs = 0usize;
        {
            let mut store_guard = store.lock();
            for mut item in items {
                if item.status == ItemStatus::InProgress {
                    // Stores revert these on load; accept raw items too
                    item.status = ItemStatus::Pending;
                }

                if item.status == ItemStatus::Pending {
                    if item.handoff_pending {
                        handoffs += 1;
                    }
                    match policy.normalize(&mut item) {
                        Some(Decision::HandOff { to }) => {
                            item.hand_off(&to);
                            store_guard.upsert_item(&run_id, &item)?;
                        }
                        Some(Decision::Terminal { reason }) => {
                            item.last_error = Some(reason);
                            item.transition(ItemStatus::FailedTerminal)?;
                            store_guard.upsert_item(&run_id, &item)?;
                        }
                        _ => {}
                    }
                }

                if item.status == ItemStatus::Pending {
                    state.ready.push_back(item.key.clone());
                }
                state.items.insert(item.key.clone(), item);
            }
            store_guard.flush()?;
        }

        if handoffs > 0 {
            tracing::info!("{} item(s) resume under a newly assigned method", handoffs);
        }

        Ok(Self {
            run_id,
            state: Mutex::new(state),
            store,
            notify: Notify::new(),
            events: None,
        })
    }

    /// Sends round and drain notifications to `sender`
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<QueueEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Caps the number of items this queue will issue
    pub fn set_max_items(&self, max_items: Option<u64>) {
        self.state.lock().max_items = max_items;
        self.notify.notify_waiters();
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn round(&self) -> u32 {
        self.state.lock().round
    }

    pub fn counters(&self) -> RunCounters {
        self.state.lock().counters()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// True once `max_items` items have been issued
    pub fn limit_reached(&self) -> bool {
        self.state.lock().limit_reached()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Copy of one item's latest known state
    pub fn item(&self, key: &str) -> Option<WorkItem> {
        self.state.lock().items.get(key).cloned()
    }

    /// Copies of every item, in no particular order
    pub fn snapshot(&self) -> Vec<WorkItem> {
        self.state.lock().items.values().cloned().collect()
    }

    /// Takes the next ready item without waiting
    ///
    /// The returned item is already IN_PROGRESS in the checkpoint.
    pub fn try_take(&self) -> Result<TakeResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        loop {
            if state.closed || state.limit_reached() {
                return Ok(TakeResult::Finished);
            }

            state.promote_delayed(Instant::now());

            while let Some(key) = state.ready.pop_front() {
                let Some(item) = state.items.get_mut(&key) else {
                    continue;
                };
                if item.status != ItemStatus::Pending || state.in_flight.contains(&key) {
                    continue;
                }

                item.transition(ItemStatus::InProgress)?;
                item.handoff_pending = false;
                let taken = item.clone();

                self.store.lock().upsert_item(&self.run_id, &taken)?;
                state.in_flight.insert(key);
                state.issued += 1;

                tracing::debug!(
                    "Issued {} (method {}, attempt {})",
                    taken.key,
                    taken.method,
                    taken.attempts() + 1
                );
                return Ok(TakeResult::Item(taken));
            }

            if let Some(next) = state.delayed.peek() {
                return Ok(TakeResult::Wait {
                    until: Some(next.ready_at),
                });
            }

            if !state.in_flight.is_empty() {
                // An in-flight item may come back for this round
                return Ok(TakeResult::Wait { until: None });
            }

            if state.parked.is_empty() {
                if !state.drained {
                    state.drained = true;
                    self.emit(QueueEvent::Drained);
                }
                return Ok(TakeResult::Finished);
            }

            // Everything in this round has settled; start the next one
            let parked = std::mem::take(&mut state.parked);
            state.round += 1;
            let round = state.round;
            tracing::info!("Starting round {} with {} parked item(s)", round, parked.len());
            state.ready.extend(parked);
            let items = state.ready.len();
            self.emit(QueueEvent::RoundStarted { round, items });
        }
    }

    /// Takes the next item, waiting for delays and in-flight work to settle
    ///
    /// Returns `None` once the queue is finished or `cancel` fires.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Option<WorkItem>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking so a wakeup between the two is not lost
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(None);
            }

            let until = match self.try_take()? {
                TakeResult::Item(item) => return Ok(Some(item)),
                TakeResult::Finished => return Ok(None),
                TakeResult::Wait { until } => until,
            };

            let delay = async {
                match until {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
                _ = delay => {}
            }
        }
    }

    /// Marks an in-flight item DONE; durable when this returns
    pub fn complete(&self, item: WorkItem) -> Result<()> {
        self.settle(item, ItemStatus::Done, |_, _| {})
    }

    /// Marks an in-flight item FAILED_TERMINAL with `reason`; durable when this
    /// returns
    pub fn fail(&self, mut item: WorkItem, reason: &str) -> Result<()> {
        tracing::warn!("Item {} failed terminally: {}", item.key, reason);
        item.last_error = Some(reason.to_string());
        self.settle(item, ItemStatus::FailedTerminal, |_, _| {})
    }

    /// Returns an item for another attempt after `delay`
    pub fn requeue(&self, item: WorkItem, delay: Duration) -> Result<()> {
        self.settle(item, ItemStatus::Pending, |state, key| {
            if delay.is_zero() {
                state.ready.push_back(key);
            } else {
                state.delayed.push(Delayed {
                    ready_at: Instant::now() + delay,
                    key,
                });
            }
        })
    }

    /// Holds an item back until the next round
    pub fn park(&self, item: WorkItem) -> Result<()> {
        tracing::debug!(
            "Parking {} until the next round ({} attempt(s), loop {})",
            item.key,
            item.attempts(),
            item.loop_count
        );
        self.settle(item, ItemStatus::Pending, |state, key| state.parked.push(key))
    }

    /// Moves an item to `to_method` and offers it again right away
    pub fn hand_off(&self, mut item: WorkItem, to_method: &str) -> Result<()> {
        tracing::info!(
            "Handing {} from {} to {}",
            item.key,
            item.method,
            to_method
        );
        item.hand_off(to_method);
        self.settle(item, ItemStatus::Pending, |state, key| {
            state.ready.push_back(key)
        })
    }

    /// Returns an item untouched, without charging an attempt
    ///
    /// Used when a worker stops before it could attempt the item.
    pub fn release(&self, item: WorkItem) -> Result<()> {
        let key = item.key.clone();
        let mut state = self.state.lock();
        if !state.in_flight.contains(&key) {
            return Ok(());
        }
        let original = state.items.get(&key).cloned().unwrap_or(item);
        drop(state);
        self.settle(original, ItemStatus::Pending, |state, key| {
            state.ready.push_front(key)
        })
    }

    /// Applies a retry decision to an in-flight item
    pub fn apply(&self, item: WorkItem, decision: Decision) -> Result<()> {
        match decision {
            Decision::Done => self.complete(item),
            Decision::Retry { delay } => self.requeue(item, delay),
            Decision::Park => self.park(item),
            Decision::HandOff { to } => self.hand_off(item, &to),
            Decision::Terminal { reason } => self.fail(item, &reason),
        }
    }

    /// Stops issuing items; in-flight items can still settle
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Returns every in-flight item to PENDING without charging an attempt
    ///
    /// Used after workers were aborted. Returns the number of items released.
    pub fn release_all_in_flight(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state.in_flight.drain().collect();
        let mut store = self.store.lock();

        for key in &keys {
            if let Some(item) = state.items.get_mut(key) {
                if item.status == ItemStatus::InProgress {
                    item.transition(ItemStatus::Pending)?;
                    store.upsert_item(&self.run_id, item)?;
                }
            }
            state.ready.push_front(key.clone());
        }

        if !keys.is_empty() {
            tracing::info!("Released {} in-flight item(s)", keys.len());
        }
        drop(store);
        drop(state);
        self.notify.notify_waiters();
        Ok(keys.len())
    }

    /// Moves an in-flight item to `status`, persists it and files its key
    fn settle<F>(&self, mut item: WorkItem, status: ItemStatus, place: F) -> Result<()>
    where
        F: FnOnce(&mut QueueState, String),
    {
        let mut state = self.state.lock();
        let key = item.key.clone();

        if !state.in_flight.contains(&key) {
            tracing::warn!("Ignoring update for {}: not in flight", key);
            return Ok(());
        }
        if item.status != ItemStatus::InProgress {
            return Err(HarvestError::InvalidTransition {
                key,
                from: item.status,
                to: status,
            });
        }

        item.transition(status)?;
        self.store.lock().upsert_item(&self.run_id, &item)?;

        state.in_flight.remove(&key);
        state.items.insert(key.clone(), item);
        if status == ItemStatus::Pending {
            place(&mut *state, key);
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(sender) = &self.events {
            // The controller may already be gone during shutdown
            let _ = sender.send(event);
        }
    }
}
