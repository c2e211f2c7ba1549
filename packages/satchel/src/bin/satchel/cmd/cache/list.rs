use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use colored::Colorize as _;
use derive_more::Debug;
use tracing::instrument;

use satchel::progress::format_size;
use satchel::{Config, OwnerId};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// List the documents of this owner instead of all owners.
    #[arg(long)]
    owner: Option<OwnerId>,
}

#[instrument]
pub async fn exec(config: Config, options: Options) -> Result<()> {
    let store = super::super::open_store(&config)?;
    match options.owner {
        Some(owner) => {
            let entries = store
                .list_by_owner(&owner)
                .await
                .with_context(|| format!("list documents of {owner}"))?;
            if entries.is_empty() {
                println!("nothing cached for {owner}");
            }
            for entry in entries {
                println!(
                    "{}  {:>10}  {}",
                    entry.key.item.as_str().bold(),
                    format_size(entry.size_bytes),
                    entry.cached_at,
                );
            }
        }
        None => {
            let owners = store.owners().await.context("list owners")?;
            if owners.is_empty() {
                println!("cache is empty");
            }
            for owner in owners {
                println!(
                    "{} ({})  {} documents  {:>10}  oldest {}",
                    owner.owner.as_str().bold(),
                    owner.owner_label,
                    owner.count,
                    format_size(owner.bytes),
                    owner.oldest,
                );
            }
        }
    }
    Ok(())
}
