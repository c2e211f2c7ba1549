//! Rules for removing cached documents that are no longer needed.
//!
//! - Age-based: documents cached longer ago than the horizon are deleted.
//! - Completion-based: an owner whose submissions are all graded, with every
//!   staged grade pushed upstream, has its whole cache deleted.
//!
//! Neither rule touches an owner whose latest batch is still in flight. Both
//! are idempotent.

use std::future::Future;
use std::time::Duration;

use color_eyre::Result;
use derive_more::{Debug, Display};
use jiff::Timestamp;
use tracing::{debug, info, instrument, warn};

use crate::key::OwnerId;
use crate::progress::BatchRegistry;
use crate::store::{CacheStore, StoreUnavailable};

/// Default age after which cached documents are evicted.
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Grading state of an owner, as far as eviction cares.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerStatus {
    /// Every submission under the owner has reached a terminal graded state.
    pub all_graded: bool,

    /// Every locally staged grade for the owner has been pushed upstream.
    pub staged_grades_pushed: bool,
}

impl OwnerStatus {
    pub fn is_complete(&self) -> bool {
        self.all_graded && self.staged_grades_pushed
    }
}

/// Answers whether an owner's grading is finished.
pub trait GradingLedger: Send + Sync {
    fn status(&self, owner: &OwnerId) -> impl Future<Output = Result<OwnerStatus>> + Send;
}

/// An owner whose documents were removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictedOwner {
    pub owner: OwnerId,
    pub entries: u64,
}

/// Why an owner was left alone.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum SkipReason {
    #[display("a batch is in flight")]
    InFlight,

    #[display("grading is not complete")]
    Incomplete,

    #[display("grading status unavailable: {_0}")]
    LedgerUnavailable(String),
}

/// An owner that was considered but not evicted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedOwner {
    pub owner: OwnerId,
    pub reason: SkipReason,
}

/// What an eviction pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<EvictedOwner>,
    pub skipped: Vec<SkippedOwner>,
}

impl EvictionReport {
    /// Total entries removed across owners.
    pub fn entries(&self) -> u64 {
        self.evicted.iter().map(|evicted| evicted.entries).sum()
    }

    fn skip(&mut self, owner: OwnerId, reason: SkipReason) {
        debug!(%owner, %reason, "skipping owner");
        self.skipped.push(SkippedOwner { owner, reason });
    }
}

/// Applies eviction rules to a cache store.
#[derive(Clone, Debug)]
pub struct Evictor {
    store: CacheStore,
    batches: BatchRegistry,
    horizon: Duration,
}

impl Evictor {
    pub fn new(store: CacheStore, batches: BatchRegistry, horizon: Duration) -> Self {
        Self {
            store,
            batches,
            horizon,
        }
    }

    /// Delete documents older than the horizon.
    pub async fn evict_expired(&self) -> Result<EvictionReport, StoreUnavailable> {
        self.evict_expired_at(Timestamp::now()).await
    }

    /// Delete documents cached before `now` minus the horizon.
    #[instrument(name = "Evictor::evict_expired", skip(self))]
    pub async fn evict_expired_at(&self, now: Timestamp) -> Result<EvictionReport, StoreUnavailable> {
        let cutoff = now.checked_sub(self.horizon).unwrap_or(Timestamp::MIN);
        let mut report = EvictionReport::default();
        for owner in self.store.stale_owners(cutoff).await? {
            let _owner_lock = self.batches.lock(&owner).await;
            if self.batches.in_flight(&owner) {
                report.skip(owner, SkipReason::InFlight);
                continue;
            }
            let entries = self.store.delete_older_than(&owner, cutoff).await?;
            if entries > 0 {
                report.evicted.push(EvictedOwner { owner, entries });
            }
        }

        info!(
            %cutoff,
            entries = report.entries(),
            owners = report.evicted.len(),
            skipped = report.skipped.len(),
            "evicted expired entries"
        );
        Ok(report)
    }

    /// Delete the cache of every owner whose grading is complete.
    ///
    /// The ledger is consulted once per owner; an owner whose grading state
    /// changes between the check and the delete is still evicted. Batches for
    /// the owner cannot start until its check and delete are done.
    #[instrument(name = "Evictor::evict_completed", skip(self, ledger))]
    pub async fn evict_completed(
        &self,
        ledger: &impl GradingLedger,
    ) -> Result<EvictionReport, StoreUnavailable> {
        let mut report = EvictionReport::default();
        for summary in self.store.owners().await? {
            let owner = summary.owner;
            let _owner_lock = self.batches.lock(&owner).await;
            if self.batches.in_flight(&owner) {
                report.skip(owner, SkipReason::InFlight);
                continue;
            }

            match ledger.status(&owner).await {
                Ok(status) if status.is_complete() => {
                    let entries = self.store.delete_owner(&owner).await?;
                    report.evicted.push(EvictedOwner { owner, entries });
                }
                Ok(_) => report.skip(owner, SkipReason::Incomplete),
                Err(error) => {
                    warn!(%owner, ?error, "failed to read grading status");
                    report.skip(owner, SkipReason::LedgerUnavailable(format!("{error:#}")));
                }
            }
        }

        info!(
            entries = report.entries(),
            owners = report.evicted.len(),
            skipped = report.skipped.len(),
            "evicted completed owners"
        );
        Ok(report)
    }
}
