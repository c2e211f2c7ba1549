//! Observable per-batch progress.
//!
//! A batch owns exactly one [`ProgressReporter`], the single writer of its
//! [`ProgressState`]. Any number of [`ProgressWatch`] handles observe the
//! state and are woken on every change.

use std::sync::Arc;

use dashmap::DashMap;
use derive_more::{Debug, Display};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, warn};

use crate::generation::Generation;
use crate::key::{ItemId, OwnerId};

mod bar;

pub use bar::{TransferBar, format_size};

/// A per-item failure recorded by a batch.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("{}: {reason}", item.as_ref().map_or("<missing id>", ItemId::as_str))]
pub struct ItemFailure {
    /// `None` when the request did not name the item.
    pub item: Option<ItemId>,
    pub reason: String,
}

/// Counters describing one batch.
///
/// Every recorded outcome increments `attempted` along with exactly one of
/// `succeeded`, `cancelled`, or `failures`. Items that were already cached
/// when the batch started count as succeeded.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProgressState {
    pub generation: Generation,
    pub owner: OwnerId,
    pub attempted: u64,
    pub succeeded: u64,
    pub cancelled: u64,
    pub total: u64,
    pub in_flight: bool,
    pub failures: Vec<ItemFailure>,
}

impl ProgressState {
    fn new(generation: Generation, owner: OwnerId, total: u64) -> Self {
        Self {
            generation,
            owner,
            attempted: 0,
            succeeded: 0,
            cancelled: 0,
            total,
            in_flight: true,
            failures: Vec::new(),
        }
    }

    /// Whether every item has a recorded outcome.
    pub fn is_complete(&self) -> bool {
        self.attempted == self.total
    }
}

/// The writer half of a batch's progress.
#[derive(Debug)]
pub struct ProgressReporter {
    #[debug("{:?}", *state.borrow())]
    state: watch::Sender<ProgressState>,
}

impl ProgressReporter {
    /// Start tracking a batch of `total` items.
    pub fn new(generation: Generation, owner: OwnerId, total: u64) -> Self {
        let (state, _) = watch::channel(ProgressState::new(generation, owner, total));
        Self { state }
    }

    /// Create an observer of this batch.
    pub fn watch(&self) -> ProgressWatch {
        ProgressWatch {
            state: self.state.subscribe(),
        }
    }

    pub fn record_success(&self) {
        self.record(|state| state.succeeded += 1);
    }

    pub fn record_cancelled(&self) {
        self.record(|state| state.cancelled += 1);
    }

    pub fn record_failure(&self, item: Option<ItemId>, reason: impl Into<String>) {
        let reason = reason.into();
        self.record(move |state| state.failures.push(ItemFailure { item, reason }));
    }

    fn record(&self, outcome: impl FnOnce(&mut ProgressState)) {
        self.state.send_modify(|state| {
            if state.is_complete() {
                warn!(
                    generation = %state.generation,
                    owner = %state.owner,
                    "ignoring outcome recorded past batch total"
                );
                return;
            }
            outcome(state);
            state.attempted += 1;
        });
    }

    /// Mark the batch as no longer in flight.
    ///
    /// Only takes effect once every item has an outcome; returns whether the
    /// batch is now finished.
    pub fn finish(&self) -> bool {
        let mut finished = false;
        self.state.send_if_modified(|state| {
            if !state.in_flight {
                finished = true;
                return false;
            }
            if !state.is_complete() {
                warn!(
                    attempted = state.attempted,
                    total = state.total,
                    "batch finished before every item had an outcome"
                );
                return false;
            }
            state.in_flight = false;
            finished = true;
            debug!(
                generation = %state.generation,
                owner = %state.owner,
                succeeded = state.succeeded,
                cancelled = state.cancelled,
                failed = state.failures.len(),
                "batch finished"
            );
            true
        });
        finished
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state.borrow().clone()
    }
}

/// An observer of a batch's progress.
#[derive(Clone, Debug)]
pub struct ProgressWatch {
    #[debug("{:?}", *state.borrow())]
    state: watch::Receiver<ProgressState>,
}

impl ProgressWatch {
    /// The latest state, marking it as seen.
    pub fn snapshot(&mut self) -> ProgressState {
        self.state.borrow_and_update().clone()
    }

    /// The latest state without marking it as seen.
    pub fn peek(&self) -> ProgressState {
        self.state.borrow().clone()
    }

    /// Wait for a change since the last [`ProgressWatch::snapshot`].
    ///
    /// Returns `false` once the batch's reporter is gone and no further
    /// changes can arrive.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    /// Wait until the batch is no longer in flight and return its final state.
    ///
    /// If the reporter is dropped first, returns the last state it published.
    pub async fn wait_done(&mut self) -> ProgressState {
        if let Ok(state) = self.state.wait_for(|state| !state.in_flight).await {
            return state.clone();
        }
        self.state.borrow().clone()
    }
}

/// Tracks the latest batch started for each owner.
///
/// Clones share the same registry.
#[derive(Clone, Debug, Default)]
pub struct BatchRegistry {
    #[debug("{} owners", batches.len())]
    batches: Arc<DashMap<OwnerId, ProgressWatch>>,

    #[debug(skip)]
    locks: Arc<DashMap<OwnerId, Arc<Mutex<()>>>>,
}

impl BatchRegistry {
    /// Record `progress` as the latest batch for its owner.
    pub fn register(&self, progress: ProgressWatch) {
        let owner = progress.peek().owner;
        self.batches.insert(owner, progress);
    }

    /// The latest batch for `owner`, if any was started.
    pub fn latest(&self, owner: &OwnerId) -> Option<ProgressWatch> {
        self.batches.get(owner).map(|entry| entry.value().clone())
    }

    /// Exclusive access to `owner`'s batches.
    ///
    /// Starting a batch holds this until the batch is registered, and
    /// eviction holds it from the in-flight check through the delete.
    pub async fn lock(&self, owner: &OwnerId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(owner.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Whether the latest batch for `owner` is in flight.
    pub fn in_flight(&self, owner: &OwnerId) -> bool {
        self.batches
            .get(owner)
            .is_some_and(|entry| entry.value().peek().in_flight)
    }
}
