//! Waiting for a document that a running batch may still produce.

use std::time::Duration;

use derive_more::{Debug, Display, Error};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::generation::GenerationTracker;
use crate::key::{CacheKey, Locator};
use crate::progress::BatchRegistry;
use crate::store::{CacheEntry, CacheStore};

/// Default bound on how long [`CacheWaiter::wait_for`] waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a wait ended without a document.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum WaitError {
    /// No running batch will produce the document: there is no batch for the
    /// owner, it finished without the document, or it was superseded.
    #[display("{key} is not cached and no running batch will produce it")]
    NeverProduced { key: CacheKey },

    /// The caller cancelled the wait.
    #[display("wait for {key} was cancelled")]
    Cancelled { key: CacheKey },

    #[display("timed out after {timeout:?} waiting for {key}")]
    TimedOut { key: CacheKey, timeout: Duration },
}

/// Blocks consumers until a document is cached by a running batch.
#[derive(Clone, Debug)]
pub struct CacheWaiter {
    store: CacheStore,
    batches: BatchRegistry,
    generations: GenerationTracker,
    timeout: Duration,
}

impl CacheWaiter {
    pub fn new(
        store: CacheStore,
        batches: BatchRegistry,
        generations: GenerationTracker,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            batches,
            generations,
            timeout,
        }
    }

    /// Return the document for `key`, waiting for the owner's running batch
    /// to produce it if necessary.
    ///
    /// Fails fast with [`WaitError::NeverProduced`] when nothing is running
    /// that could produce the document. Otherwise re-checks the store on each
    /// progress change until the document appears, the batch ends or is
    /// superseded, `cancel` fires, or the timeout elapses. A batch superseded
    /// by a newer batch for the same owner hands the wait over to that batch
    /// within the original timeout.
    #[instrument(name = "CacheWaiter::wait_for", skip(self, cancel))]
    pub async fn wait_for(
        &self,
        locator: Option<&Locator>,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<CacheEntry, WaitError> {
        // Subscribe before checking the store so no commit slips between them.
        let mut progress = self.batches.latest(&key.owner);
        let state = progress.as_mut().map(|progress| progress.snapshot());

        if let Some(entry) = self.lookup(locator, key).await {
            return Ok(entry);
        }

        let never_produced = || WaitError::NeverProduced { key: key.clone() };
        let (Some(mut progress), Some(state)) = (progress, state) else {
            debug!("no batch for owner");
            return Err(never_produced());
        };
        if !state.in_flight || !self.generations.is_current(state.generation) {
            debug!(generation = %state.generation, in_flight = state.in_flight, "batch will not produce entry");
            return Err(never_produced());
        }

        let mut generation = state.generation;
        let deadline = tokio::time::sleep(self.timeout);
        let superseded = self.generations.superseded(generation);
        tokio::pin!(deadline, superseded);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled { key: key.clone() });
                }
                alive = progress.changed() => {
                    let state = progress.snapshot();
                    if let Some(entry) = self.lookup(locator, key).await {
                        return Ok(entry);
                    }
                    if !alive || !state.in_flight {
                        debug!("batch ended without entry");
                        return Err(never_produced());
                    }
                }
                _ = &mut superseded => {
                    // A newer batch for the owner is registered under the
                    // owner lock, so taking it shows that batch if there is one.
                    let latest = {
                        let _owner_lock = self.batches.lock(&key.owner).await;
                        self.batches.latest(&key.owner)
                    };
                    let next = latest.map(|mut next| (next.snapshot(), next));

                    // A commit may have landed just before the supersession.
                    if let Some(entry) = self.lookup(locator, key).await {
                        return Ok(entry);
                    }
                    let Some((next_state, next)) = next.filter(|(next_state, _)| {
                        next_state.generation != generation
                            && next_state.in_flight
                            && self.generations.is_current(next_state.generation)
                    }) else {
                        debug!(%generation, "batch superseded");
                        return Err(never_produced());
                    };

                    debug!(from = %generation, to = %next_state.generation, "following newer batch for owner");
                    generation = next_state.generation;
                    progress = next;
                    superseded.set(self.generations.superseded(generation));
                }
                _ = &mut deadline => {
                    return Err(WaitError::TimedOut { key: key.clone(), timeout: self.timeout });
                }
            }
        }
    }

    /// Check the store, treating errors as a miss.
    async fn lookup(&self, locator: Option<&Locator>, key: &CacheKey) -> Option<CacheEntry> {
        match self.store.get(locator, key).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%key, %error, "cache lookup failed, treating as miss");
                None
            }
        }
    }
}
