use std::path::PathBuf;

use clap::Args;
use clients::Token;
use color_eyre::{
    Result,
    eyre::{Context as _, OptionExt as _},
};
use colored::Colorize as _;
use derive_more::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use satchel::progress::format_size;
use satchel::{BatchItem, BatchRequest, CacheEntry, CacheKey, Config, ItemId, Locator, OwnerId};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The owner the document belongs to.
    #[arg(long)]
    owner: OwnerId,

    /// The document's item id.
    #[arg(long)]
    item: ItemId,

    /// Where the document comes from; also used as a fallback lookup key.
    #[arg(long)]
    locator: Option<Locator>,

    /// Write the document here instead of printing its metadata.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Download the document from `--locator` if it is not cached, and wait
    /// for it.
    #[arg(long, requires = "locator")]
    wait: bool,

    /// Authentication token for the submission API; needed with `--wait`.
    #[arg(long = "api-token", env = "SATCHEL_API_TOKEN")]
    api_token: Option<Token>,
}

#[instrument]
pub async fn exec(config: Config, options: Options) -> Result<()> {
    let engine = super::open_engine(config)?;
    let key = CacheKey::new(&options.owner, &options.item);
    let locator = options.locator.as_ref();

    let entry = match engine.lookup(locator, &options.owner, &options.item).await {
        Some(entry) => Some(entry),
        None if options.wait => {
            let auth = options
                .api_token
                .clone()
                .ok_or_eyre("--api-token is required with --wait")?;
            let item = BatchItem {
                item: Some(options.item.clone()),
                locator: options.locator.clone(),
            };
            let request = BatchRequest::builder()
                .owner(options.owner.clone())
                .owner_label(options.owner.as_str())
                .items(vec![item])
                .auth(auth)
                .build();
            let handle = engine.start_batch(request).await;
            debug!(generation = %handle.generation, "started download");

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                }
            });
            let entry = engine
                .wait_for(locator, &key, &cancel)
                .await
                .with_context(|| format!("wait for {key}"));
            if entry.is_err() {
                for failure in handle.progress.peek().failures {
                    println!("{} {failure}", "failed:".red());
                }
            }
            Some(entry?)
        }
        None => None,
    };

    let Some(entry) = entry else {
        println!("{} {key} is not cached", "miss:".yellow());
        return Ok(());
    };
    match options.output {
        Some(path) => {
            tokio::fs::write(&path, &entry.blob)
                .await
                .with_context(|| format!("write document to {path:?}"))?;
            println!("wrote {} to {}", format_size(entry.size_bytes), path.display());
        }
        None => print_entry(&entry),
    }
    Ok(())
}

fn print_entry(entry: &CacheEntry) {
    println!("{}", entry.key.to_string().bold());
    println!("  label:     {}", entry.owner_label);
    println!("  size:      {}", format_size(entry.size_bytes));
    println!("  cached at: {}", entry.cached_at);
    if let Some(locator) = &entry.source_locator {
        println!("  source:    {locator}");
    }
}
