use color_eyre::{Result, eyre::Context as _};
use tracing::instrument;

use satchel::Config;
use satchel::evict::Evictor;
use satchel::progress::BatchRegistry;

#[instrument]
pub async fn exec(config: Config) -> Result<()> {
    let store = super::super::open_store(&config)?;
    let evictor = Evictor::new(store, BatchRegistry::default(), config.eviction_horizon);
    let report = evictor.evict_expired().await.context("evict expired entries")?;

    for evicted in &report.evicted {
        println!("{}: removed {} documents", evicted.owner, evicted.entries);
    }
    for skipped in &report.skipped {
        println!("{}: skipped, {}", skipped.owner, skipped.reason);
    }
    println!("Done! Removed {} documents.", report.entries());
    Ok(())
}
