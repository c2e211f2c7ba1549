use std::path::PathBuf;

use clap::Args;
use clients::Token;
use color_eyre::{Result, eyre::Context as _};
use colored::Colorize as _;
use derive_more::Debug;
use tracing::{info, instrument};

use satchel::progress::TransferBar;
use satchel::{BatchItem, BatchRequest, Config, OwnerId};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// The owner (e.g. assignment) the documents belong to.
    #[arg(long)]
    owner: OwnerId,

    /// Human readable name for the owner; defaults to the owner id.
    #[arg(long)]
    label: Option<String>,

    /// JSON file listing the documents: `[{"item": "...", "locator": "..."}]`.
    #[arg(long)]
    manifest: PathBuf,

    /// Concurrent downloads; `0` uses the internal ceiling.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Authentication token for the submission API.
    #[arg(long = "api-token", env = "SATCHEL_API_TOKEN")]
    api_token: Token,
}

#[instrument]
pub async fn exec(config: Config, options: Options) -> Result<()> {
    let manifest = tokio::fs::read_to_string(&options.manifest)
        .await
        .with_context(|| format!("read manifest {:?}", options.manifest))?;
    let items = serde_json::from_str::<Vec<BatchItem>>(&manifest)
        .with_context(|| format!("parse manifest {:?}", options.manifest))?;

    let engine = super::open_engine(config)?;
    let expired = engine.evict_expired().await.context("evict expired entries")?;
    if expired.entries() > 0 {
        info!(entries = expired.entries(), "evicted expired entries");
    }

    let label = options
        .label
        .unwrap_or_else(|| options.owner.as_str().to_string());
    let request = BatchRequest::builder()
        .owner(options.owner)
        .owner_label(label)
        .items(items)
        .maybe_concurrency(options.concurrency)
        .auth(options.api_token)
        .build();

    let handle = engine.start_batch(request).await;
    let total = handle.progress.peek().total;
    let state = TransferBar::new(total, "Syncing").follow(handle.progress).await;

    for failure in &state.failures {
        println!("{} {failure}", "failed:".red());
    }
    println!(
        "{} of {} documents cached ({} failed, {} cancelled)",
        state.succeeded.to_string().green(),
        state.total,
        state.failures.len(),
        state.cancelled,
    );
    Ok(())
}
