use color_eyre::{Result, eyre::Context as _};
use tap::Pipe as _;
use tracing::{debug, instrument};

use satchel::{CacheStore, Config, SyncEngine};

pub mod cache;
pub mod get;
pub mod sync;

/// Open the cache store at the configured location.
#[instrument]
pub fn open_store(config: &Config) -> Result<CacheStore> {
    let dir = config.cache_dir().context("resolve cache directory")?;
    debug!(?dir, "opening cache");
    CacheStore::open(&dir).with_context(|| format!("open cache at {dir:?}"))
}

/// Open the cache and build an engine that downloads over HTTP.
#[instrument]
pub fn open_engine(config: Config) -> Result<SyncEngine<clients::Client>> {
    let store = open_store(&config)?;
    let client = clients::Client::new().context("create download client")?;
    SyncEngine::builder()
        .store(store)
        .transfer(client)
        .config(config)
        .build()
        .pipe(Ok)
}
