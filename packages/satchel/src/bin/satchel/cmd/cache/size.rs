use color_eyre::{Result, eyre::Context as _};
use tracing::instrument;

use satchel::Config;
use satchel::progress::format_size;

#[instrument]
pub async fn exec(config: Config) -> Result<()> {
    let store = super::super::open_store(&config)?;
    let size = store.total_size().await.context("compute cache size")?;
    println!("{} documents, {}", size.count, format_size(size.bytes));
    Ok(())
}
