use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use colored::Colorize as _;
use derive_more::Debug;
use inquire::Confirm;
use tracing::instrument;

use satchel::{Config, OwnerId};

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Skip all confirmation prompts.
    #[arg(short, long)]
    yes: bool,

    /// Only delete the documents of this owner.
    #[arg(long)]
    owner: Option<OwnerId>,
}

#[instrument]
pub async fn exec(config: Config, options: Options) -> Result<()> {
    if !options.yes {
        let warning = match &options.owner {
            Some(owner) => format!("WARNING: This will delete every cached document for {owner}"),
            None => String::from("WARNING: This will delete every cached document"),
        };
        println!("{}", warning.on_red());
        let confirmed = Confirm::new("Are you sure you want to proceed?")
            .with_default(false)
            .prompt()?;
        if !confirmed {
            return Ok(());
        }
    }

    let store = super::super::open_store(&config)?;
    let removed = match &options.owner {
        Some(owner) => store
            .delete_owner(owner)
            .await
            .with_context(|| format!("delete documents of {owner}"))?,
        None => store.delete_all().await.context("delete all documents")?,
    };

    println!("Done! Removed {removed} documents.");
    Ok(())
}
