//! The sync engine: accepts batch requests and serves cached documents.
//!
//! Starting a batch issues a new generation, which supersedes every batch
//! already running. Items are de-duplicated, already cached items are counted
//! as succeeded, and the rest are handed to the scheduler in the background.

use std::collections::HashSet;

use bon::{Builder, bon};
use clients::Token;
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::evict::{EvictionReport, Evictor, GradingLedger};
use crate::fetch::{Fetcher, Transfer};
use crate::generation::{Generation, GenerationTracker};
use crate::key::{CacheKey, ItemId, Locator, OwnerId};
use crate::progress::{BatchRegistry, ProgressReporter, ProgressState, ProgressWatch};
use crate::schedule::{DownloadTask, ScheduledBatch, Scheduler};
use crate::store::{CacheEntry, CacheStore, EntryMetadata, OwnerSummary, StoreSize, StoreUnavailable};
use crate::wait::{CacheWaiter, WaitError};

/// Failure reason for items the request did not identify.
pub const MISSING_ITEM_ID: &str = "missing item id";

/// Failure reason for uncached items without a source.
pub const NO_SOURCE_LOCATOR: &str = "no source locator";

/// One candidate document in a batch request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    #[serde(default)]
    pub item: Option<ItemId>,
    #[serde(default)]
    pub locator: Option<Locator>,
}

impl BatchItem {
    pub fn new(item: impl Into<ItemId>, locator: impl Into<String>) -> Self {
        Self {
            item: Some(item.into()),
            locator: Some(Locator::new(locator)),
        }
    }
}

/// A request to make a set of documents available offline.
#[derive(Clone, Debug, Builder)]
pub struct BatchRequest {
    #[builder(into)]
    pub owner: OwnerId,

    /// Human readable name stored alongside each document.
    #[builder(into)]
    pub owner_label: String,

    pub items: Vec<BatchItem>,

    /// Concurrent downloads; the configured default when unset, and the
    /// internal ceiling when `0`.
    pub concurrency: Option<usize>,

    pub auth: Token,
}

/// A started batch.
#[derive(Clone, Debug)]
pub struct BatchHandle {
    pub generation: Generation,
    pub progress: ProgressWatch,
}

impl BatchHandle {
    /// Wait for the batch to finish and return its final state.
    pub async fn done(mut self) -> ProgressState {
        self.progress.wait_done().await
    }
}

/// An item outcome known before any download starts.
#[derive(Debug)]
enum Settled {
    Cached,
    Failed(Option<ItemId>, &'static str),
}

/// Batch items sorted by what has to happen to them.
#[derive(Debug, Default)]
struct Partition {
    settled: Vec<Settled>,
    tasks: Vec<DownloadTask>,
}

/// Orchestrates the cache store, scheduler, progress, and eviction.
///
/// ## Cloning
///
/// This type is cheaply cloneable; clones drive the same store and
/// generation.
#[derive(Clone, Debug)]
pub struct SyncEngine<T> {
    store: CacheStore,
    generations: GenerationTracker,
    batches: BatchRegistry,
    scheduler: Scheduler<T>,
    waiter: CacheWaiter,
    evictor: Evictor,
    concurrency: usize,
}

#[bon]
impl<T: Transfer> SyncEngine<T> {
    #[builder]
    pub fn new(
        store: CacheStore,
        transfer: T,
        #[builder(default)] generations: GenerationTracker,
        #[builder(default)] batches: BatchRegistry,
        #[builder(default)] config: Config,
    ) -> Self {
        let fetcher = Fetcher::new(transfer, config.retry, generations.clone());
        let scheduler = Scheduler::new(fetcher, store.clone(), generations.clone());
        let waiter = CacheWaiter::new(
            store.clone(),
            batches.clone(),
            generations.clone(),
            config.wait_timeout,
        );
        let evictor = Evictor::new(store.clone(), batches.clone(), config.eviction_horizon);
        Self {
            store,
            generations,
            batches,
            scheduler,
            waiter,
            evictor,
            concurrency: config.concurrency,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn generations(&self) -> &GenerationTracker {
        &self.generations
    }

    /// Start a batch, superseding any batch already running.
    ///
    /// Returns once the batch is registered; downloads continue in the
    /// background. A batch with nothing to download is already finished.
    #[instrument(
        name = "SyncEngine::start_batch",
        skip(self, request),
        fields(owner = %request.owner, items = request.items.len())
    )]
    pub async fn start_batch(&self, request: BatchRequest) -> BatchHandle {
        let BatchRequest {
            owner,
            owner_label,
            items,
            concurrency,
            auth,
        } = request;

        // Held until the batch is registered so eviction cannot delete what
        // the partition counts as cached.
        let owner_lock = self.batches.lock(&owner).await;
        let generation = self.generations.new_generation().await;
        let Partition { settled, tasks } = self.partition(&owner, items).await;
        let total = (settled.len() + tasks.len()) as u64;
        info!(%generation, total, downloads = tasks.len(), "starting batch");

        let reporter = ProgressReporter::new(generation, owner, total);
        for outcome in settled {
            match outcome {
                Settled::Cached => reporter.record_success(),
                Settled::Failed(item, reason) => reporter.record_failure(item, reason),
            }
        }
        let progress = reporter.watch();
        self.batches.register(progress.clone());
        drop(owner_lock);

        if tasks.is_empty() {
            reporter.finish();
        } else {
            let batch = ScheduledBatch {
                generation,
                owner_label,
                auth,
                tasks,
                concurrency: concurrency.unwrap_or(self.concurrency),
            };
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move { scheduler.run(batch, reporter).await });
        }

        BatchHandle {
            generation,
            progress,
        }
    }

    /// Supersede every running batch without starting a new one.
    #[instrument(name = "SyncEngine::cancel_running", skip(self))]
    pub async fn cancel_running(&self) -> Generation {
        self.generations.new_generation().await
    }

    async fn partition(&self, owner: &OwnerId, items: Vec<BatchItem>) -> Partition {
        let mut partition = Partition::default();
        let mut seen = HashSet::new();
        for BatchItem { item, locator } in items {
            let Some(item) = item.filter(|item| !item.as_str().is_empty()) else {
                warn!(?locator, "batch item has no id");
                partition
                    .settled
                    .push(Settled::Failed(None, MISSING_ITEM_ID));
                continue;
            };
            if !seen.insert(item.clone()) {
                warn!(%item, "duplicate batch item, keeping the first");
                continue;
            }

            let key = CacheKey::new(owner, item);
            let cached = match self.store.contains(&key).await {
                Ok(cached) => cached,
                Err(error) => {
                    warn!(%key, %error, "cache check failed, treating as miss");
                    false
                }
            };
            match (cached, locator) {
                (true, _) => {
                    debug!(%key, "already cached");
                    partition.settled.push(Settled::Cached);
                }
                (false, None) => {
                    partition
                        .settled
                        .push(Settled::Failed(Some(key.item), NO_SOURCE_LOCATOR));
                }
                (false, Some(locator)) => partition.tasks.push(DownloadTask { key, locator }),
            }
        }
        partition
    }

    /// The latest batch started for `owner`.
    pub fn progress(&self, owner: &OwnerId) -> Option<ProgressWatch> {
        self.batches.latest(owner)
    }

    /// Look up a cached document without waiting.
    ///
    /// Store failures are reported as a miss.
    #[instrument(name = "SyncEngine::lookup", skip(self))]
    pub async fn lookup(
        &self,
        locator: Option<&Locator>,
        owner: &OwnerId,
        item: &ItemId,
    ) -> Option<CacheEntry> {
        let key = CacheKey::new(owner, item);
        match self.store.get(locator, &key).await {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%key, %error, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Look up a cached document, waiting for a running batch to produce it.
    pub async fn wait_for(
        &self,
        locator: Option<&Locator>,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Result<CacheEntry, WaitError> {
        self.waiter.wait_for(locator, key, cancel).await
    }

    pub async fn delete_owner(&self, owner: &OwnerId) -> Result<u64, StoreUnavailable> {
        self.store.delete_owner(owner).await
    }

    pub async fn delete_all(&self) -> Result<u64, StoreUnavailable> {
        self.store.delete_all().await
    }

    pub async fn total_size(&self) -> Result<StoreSize, StoreUnavailable> {
        self.store.total_size().await
    }

    pub async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<EntryMetadata>, StoreUnavailable> {
        self.store.list_by_owner(owner).await
    }

    pub async fn owners(&self) -> Result<Vec<OwnerSummary>, StoreUnavailable> {
        self.store.owners().await
    }

    /// Run age-based eviction.
    pub async fn evict_expired(&self) -> Result<EvictionReport, StoreUnavailable> {
        self.evictor.evict_expired().await
    }

    /// Run completion-based eviction.
    pub async fn evict_completed(
        &self,
        ledger: &impl GradingLedger,
    ) -> Result<EvictionReport, StoreUnavailable> {
        self.evictor.evict_completed(ledger).await
    }
}
