//! Offline document cache and concurrent sync engine.
//!
//! Batches of remote documents are downloaded under a bounded-concurrency
//! policy with retries, stored by a stable logical key, and served back to
//! consumers, who can wait for documents a running batch has not produced
//! yet. Starting a new batch cancels the previous one.
//!
//! The entry point is [`sync::SyncEngine`].

pub mod config;
pub mod evict;
pub mod fetch;
pub mod generation;
pub mod key;
pub mod progress;
pub mod schedule;
pub mod store;
pub mod sync;
pub mod wait;

pub use config::Config;
pub use key::{BlobKey, CacheKey, ItemId, Locator, OwnerId};
pub use store::{CacheEntry, CacheStore, StoreUnavailable};
pub use sync::{BatchHandle, BatchItem, BatchRequest, SyncEngine};
