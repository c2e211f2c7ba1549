use color_eyre::{Result, eyre::Context as _};
use tracing::instrument;

use satchel::Config;

#[instrument]
pub async fn exec(config: Config) -> Result<()> {
    let cache_dir = config.cache_dir().context("resolve cache directory")?;
    println!("{}", cache_dir.display());
    Ok(())
}
