//! Engine configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, the config
//! file (`satchel.toml`), environment variables, and command line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, OptionExt},
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::evict::DEFAULT_HORIZON;
use crate::fetch::{RetryPolicy, duration_secs};
use crate::wait::DEFAULT_WAIT_TIMEOUT;

/// Name used for the platform config and cache directories.
pub const APP_NAME: &str = "satchel";

/// Name of the config file inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "satchel.toml";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "SATCHEL_CACHE_DIR";

/// Default number of concurrent downloads per batch.
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Concurrent downloads per batch; `0` means the internal ceiling.
    #[builder(default = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Age after which cached documents are evicted.
    #[builder(default = DEFAULT_HORIZON)]
    #[serde(with = "duration_secs")]
    pub eviction_horizon: Duration,

    /// How long a consumer waits for a running batch to produce a document.
    #[builder(default = DEFAULT_WAIT_TIMEOUT)]
    #[serde(with = "duration_secs")]
    pub wait_timeout: Duration,

    #[builder(default)]
    pub retry: RetryPolicy,

    /// Where the cache lives; see [`Config::cache_dir`].
    #[builder(into)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicitly given file must exist. Otherwise the file in the platform
    /// config directory is used when present, and defaults when not.
    #[instrument(name = "Config::load")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => {
                    debug!("no config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {path:?}"))?;
        Self::parse(&contents)
            .with_section(|| path.display().to_string().header("Config file:"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str::<Self>(contents).context("parse config")
    }

    /// Resolve the cache directory.
    ///
    /// Uses `SATCHEL_CACHE_DIR` if set, then the configured directory, then
    /// the platform cache directory.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let from_env = std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from);
        self.cache_dir_with(from_env)
    }

    fn cache_dir_with(&self, from_env: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = from_env.or_else(|| self.cache_dir.clone()) {
            return Ok(dir);
        }
        ProjectDirs::from("", "", APP_NAME)
            .ok_or_eyre("could not determine cache directory")
            .map(|dirs| dirs.cache_dir().to_path_buf())
    }
}

/// The config file in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
