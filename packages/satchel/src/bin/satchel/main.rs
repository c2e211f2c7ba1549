//! The binary entrypoint for `satchel`, the offline submission cache.

use std::path::PathBuf;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context};
use git_version::git_version;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt as _;

use satchel::Config;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
mod cmd;
mod log;

#[derive(Parser)]
#[command(
    name = "satchel",
    about = "Keep submissions on hand for offline grading",
    version = format!(
        "v{} commit {}",
        crate_version!(),
        git_version!(args = ["--always"], fallback = "unknown"),
    ),
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the config file
    #[arg(long, global = true, env = "SATCHEL_CONFIG")]
    config: Option<PathBuf>,

    /// Emit flamegraph profiling data
    #[arg(short, long, hide(true))]
    profile: Option<PathBuf>,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Download a batch of documents into the cache
    Sync(cmd::sync::Options),

    /// Read a document from the cache
    Get(cmd::get::Options),

    /// Manage the local cache
    #[clap(subcommand)]
    Cache(cmd::cache::Command),
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;

    let (logger, flame_guard) = log::make_logger(cli.profile.as_ref(), cli.color)?;
    logger.init();

    let config = Config::load(cli.config.as_deref()).context("load configuration")?;
    let result = match cli.command {
        Command::Sync(opts) => cmd::sync::exec(config, opts).await,
        Command::Get(opts) => cmd::get::exec(config, opts).await,
        Command::Cache(cmd) => match cmd {
            cmd::cache::Command::Show => cmd::cache::show::exec(config).await,
            cmd::cache::Command::List(opts) => cmd::cache::list::exec(config, opts).await,
            cmd::cache::Command::Size => cmd::cache::size::exec(config).await,
            cmd::cache::Command::Evict => cmd::cache::evict::exec(config).await,
            cmd::cache::Command::Reset(opts) => cmd::cache::reset::exec(config, opts).await,
        },
    };

    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame_guard")?;
    }

    result
}
