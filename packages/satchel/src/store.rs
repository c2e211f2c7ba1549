//! The persistent cache of downloaded documents.
//!
//! A [`CacheStore`] combines two pieces of local storage:
//! - A filesystem blob store holding document bytes, content-addressed and
//!   compressed with zstd (`{root}/blobs/`).
//! - A SQLite index mapping each [`CacheKey`] to its blob and metadata
//!   (`{root}/index.db`).
//!
//! Identical documents under different keys share one blob. Blobs are removed
//! once no index entry references them.

mod blobs;
mod index;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display, Error};
use itertools::Itertools;
use jiff::Timestamp;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::key::{BlobKey, CacheKey, Locator, OwnerId};

use self::blobs::BlobStore;
use self::index::Index;

/// The store could not complete an operation.
///
/// Covers I/O failures, database errors, and corrupted content. Readers treat
/// this as a cache miss; administrative callers should surface it.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
#[display("cache store unavailable: {reason}")]
pub struct StoreUnavailable {
    pub reason: String,
}

impl From<color_eyre::Report> for StoreUnavailable {
    fn from(err: color_eyre::Report) -> Self {
        Self {
            reason: err.chain().join(": "),
        }
    }
}

/// A cached document along with its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub source_locator: Option<Locator>,
    #[debug("<{} bytes>", blob.len())]
    pub blob: Vec<u8>,
    pub size_bytes: u64,
    pub cached_at: Timestamp,
    pub owner_label: String,
}

/// Metadata for a cached document, without its content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMetadata {
    pub key: CacheKey,
    pub source_locator: Option<Locator>,
    pub blob_key: BlobKey,
    pub size_bytes: u64,
    pub cached_at: Timestamp,
    pub owner_label: String,
}

/// Aggregate view of one owner's cached documents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerSummary {
    pub owner: OwnerId,
    pub owner_label: String,
    pub count: u64,
    pub bytes: u64,
    pub oldest: Timestamp,
}

/// The number of cached entries and the sum of their sizes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreSize {
    pub count: u64,
    pub bytes: u64,
}

/// Persistent key to document store.
///
/// ## Cloning
///
/// This type is cheaply cloneable; clones share the same index connection and
/// blob directory.
///
/// ## Concurrency
///
/// Index access is serialized behind a mutex, so writes to a key never
/// interleave. Blob writes hold the collection fence for reading while blob
/// garbage collection holds it for writing: a blob can't be removed between a
/// `put` writing it and the index recording the reference.
#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
    blobs: BlobStore,
    #[debug("<index>")]
    index: Arc<Mutex<Index>>,
    #[debug(skip)]
    fence: Arc<RwLock<()>>,
}

impl CacheStore {
    /// Open or create a cache store in the given directory.
    #[instrument(name = "CacheStore::open", skip(root))]
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let blobs = BlobStore::new(root.join("blobs"));
        let index = Index::open(root.join("index.db")).context("open cache index")?;
        debug!(?root, "opened cache store");

        Ok(Self {
            root,
            blobs,
            index: Arc::new(Mutex::new(index)),
            fence: Arc::new(RwLock::new(())),
        })
    }

    /// The directory holding the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a document, replacing any existing entry for `key`.
    ///
    /// The blob is fully written before the index references it, so a
    /// concurrent reader sees either the previous entry or the new one.
    #[instrument(name = "CacheStore::put", skip(self, blob), fields(bytes = blob.len()))]
    pub async fn put(
        &self,
        key: &CacheKey,
        source_locator: Option<&Locator>,
        blob: &[u8],
        owner_label: &str,
    ) -> Result<(), StoreUnavailable> {
        let replaced = {
            let _fence = self.fence.read().await;
            let (blob_key, _) = self.blobs.write(blob).await.context("write blob")?;
            let entry = EntryMetadata {
                key: key.clone(),
                source_locator: source_locator.cloned(),
                blob_key,
                size_bytes: blob.len() as u64,
                cached_at: Timestamp::now(),
                owner_label: owner_label.to_string(),
            };
            self.with_index(|index| index.upsert(&entry))?
        };

        if let Some(replaced) = replaced {
            self.collect([replaced]).await?;
        }
        Ok(())
    }

    /// Look up a document.
    ///
    /// The lookup is by `key`; when nothing is stored under the key and a
    /// locator is given, the most recent entry under the same owner recorded
    /// for that locator is returned instead.
    #[instrument(name = "CacheStore::get", skip(self))]
    pub async fn get(
        &self,
        source_locator: Option<&Locator>,
        key: &CacheKey,
    ) -> Result<Option<CacheEntry>, StoreUnavailable> {
        let metadata = self.with_index(|index| match index.get(key)? {
            Some(found) => Ok(Some(found)),
            None => match source_locator {
                Some(locator) => index.get_by_locator(locator, &key.owner),
                None => Ok(None),
            },
        })?;
        let Some(metadata) = metadata else {
            return Ok(None);
        };

        let Some(blob) = self.blobs.read(&metadata.blob_key).await? else {
            // Deleted between the index read and the blob read.
            warn!(key = %metadata.key, blob = %metadata.blob_key, "indexed blob is missing");
            return Ok(None);
        };
        if metadata.blob_key != blake3::hash(&blob) {
            return Err(eyre!(
                "blob {} for {} does not match its content",
                metadata.blob_key,
                metadata.key
            )
            .into());
        }

        Ok(Some(CacheEntry {
            key: metadata.key,
            source_locator: metadata.source_locator,
            blob,
            size_bytes: metadata.size_bytes,
            cached_at: metadata.cached_at,
            owner_label: metadata.owner_label,
        }))
    }

    /// Check whether a document is stored under `key` without reading it.
    #[instrument(name = "CacheStore::contains", skip(self))]
    pub async fn contains(&self, key: &CacheKey) -> Result<bool, StoreUnavailable> {
        self.with_index(|index| index.contains(key))
            .map_err(StoreUnavailable::from)
    }

    /// List the documents stored under an owner.
    #[instrument(name = "CacheStore::list_by_owner", skip(self))]
    pub async fn list_by_owner(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<EntryMetadata>, StoreUnavailable> {
        self.with_index(|index| index.list_owner(owner))
            .map_err(StoreUnavailable::from)
    }

    /// Summarize every owner with cached documents.
    #[instrument(name = "CacheStore::owners", skip(self))]
    pub async fn owners(&self) -> Result<Vec<OwnerSummary>, StoreUnavailable> {
        self.with_index(|index| index.owners())
            .map_err(StoreUnavailable::from)
    }

    /// Owners with at least one document cached before `cutoff`.
    #[instrument(name = "CacheStore::stale_owners", skip(self))]
    pub async fn stale_owners(&self, cutoff: Timestamp) -> Result<Vec<OwnerId>, StoreUnavailable> {
        self.with_index(|index| index.stale_owners(cutoff))
            .map_err(StoreUnavailable::from)
    }

    /// Delete every document under an owner.
    ///
    /// Once this returns, no `get` observes the deleted entries.
    #[instrument(name = "CacheStore::delete_owner", skip(self))]
    pub async fn delete_owner(&self, owner: &OwnerId) -> Result<u64, StoreUnavailable> {
        let removed = self.with_index(|index| index.delete_owner(owner))?;
        let count = removed.len() as u64;
        self.collect(removed).await?;
        debug!(%owner, count, "deleted owner");
        Ok(count)
    }

    /// Delete documents under an owner that were cached before `cutoff`.
    #[instrument(name = "CacheStore::delete_older_than", skip(self))]
    pub async fn delete_older_than(
        &self,
        owner: &OwnerId,
        cutoff: Timestamp,
    ) -> Result<u64, StoreUnavailable> {
        let removed = self.with_index(|index| index.delete_older_than(owner, cutoff))?;
        let count = removed.len() as u64;
        self.collect(removed).await?;
        Ok(count)
    }

    /// Delete every document.
    #[instrument(name = "CacheStore::delete_all", skip(self))]
    pub async fn delete_all(&self) -> Result<u64, StoreUnavailable> {
        let _fence = self.fence.write().await;
        let count = self.with_index(|index| index.delete_all())?;
        self.blobs.clear().await.context("clear blobs")?;
        debug!(count, "deleted all entries");
        Ok(count)
    }

    /// Count stored documents and sum their sizes.
    #[instrument(name = "CacheStore::total_size", skip(self))]
    pub async fn total_size(&self) -> Result<StoreSize, StoreUnavailable> {
        self.with_index(|index| index.totals())
            .map_err(StoreUnavailable::from)
    }

    /// Remove the candidate blobs no entry references anymore.
    async fn collect(&self, candidates: impl IntoIterator<Item = BlobKey>) -> Result<()> {
        let _fence = self.fence.write().await;
        for blob in candidates.into_iter().unique() {
            if self.with_index(|index| index.is_referenced(&blob))? {
                continue;
            }
            self.blobs.remove(&blob).await?;
        }
        Ok(())
    }

    fn with_index<T>(&self, f: impl FnOnce(&Index) -> Result<T>) -> Result<T> {
        let index = self.index.lock().map_err(|e| eyre!("lock index: {e}"))?;
        f(&index)
    }
}
