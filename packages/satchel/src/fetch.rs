//! Downloading a single document with retries.
//!
//! The [`Fetcher`] wraps a [`Transfer`] implementation with failure
//! classification, a per-attempt timeout, and exponential backoff. It never
//! writes to the cache store: callers decide what to do with the outcome.

use std::future::Future;
use std::time::Duration;

use bon::Builder;
use clients::Token;
use derive_more::{Debug, Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::generation::{Generation, GenerationTracker};
use crate::key::Locator;

/// Moves a document from its source locator to memory.
///
/// This is the only way the engine talks to the outside world, so tests
/// substitute scripted implementations.
pub trait Transfer: Clone + Send + Sync + 'static {
    /// Download the document at `locator`.
    fn transfer(
        &self,
        locator: &Locator,
        auth: &Token,
    ) -> impl Future<Output = Result<Vec<u8>, TransferError>> + Send;
}

/// A failed transfer, as reported by the transfer implementation.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum TransferError {
    /// The remote answered with a non-success status.
    #[display("status {status}: {message}")]
    Status { status: u16, message: String },

    /// No response was received.
    #[display("transport: {message}")]
    Transport { message: String },

    /// The locator can't be interpreted by the transfer implementation.
    #[display("invalid locator: {message}")]
    Invalid { message: String },
}

/// Why a fetch failed.
///
/// The display form is the human readable reason recorded in batch progress.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum FetchError {
    #[display("not found (status {status}): {message}")]
    NotFound { status: u16, message: String },

    #[display("rejected: {message}")]
    Rejected { message: String },

    #[display("server returned an empty document")]
    EmptyBody,

    #[display("unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[display("transport error: {message}")]
    Transport { message: String },
}

/// The classified result of one transfer attempt.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Attempt {
    Success(#[debug("<{} bytes>", _0.len())] Vec<u8>),

    /// Worth trying again.
    Retry(FetchError),

    /// Trying again would not help.
    Fail(FetchError),
}

/// Decide what a transfer result means for the fetch.
pub fn classify(result: Result<Vec<u8>, TransferError>) -> Attempt {
    match result {
        Ok(bytes) if bytes.is_empty() => Attempt::Retry(FetchError::EmptyBody),
        Ok(bytes) => Attempt::Success(bytes),
        Err(TransferError::Status { status, message }) => match status {
            404 | 410 => Attempt::Fail(FetchError::NotFound { status, message }),
            408 | 429 => Attempt::Retry(FetchError::Unavailable { status, message }),
            400..=499 => Attempt::Fail(FetchError::Rejected {
                message: format!("status {status}: {message}"),
            }),
            _ => Attempt::Retry(FetchError::Unavailable { status, message }),
        },
        Err(TransferError::Transport { message }) => {
            Attempt::Retry(FetchError::Transport { message })
        }
        Err(TransferError::Invalid { message }) => Attempt::Fail(FetchError::Rejected {
            message: format!("invalid locator: {message}"),
        }),
    }
}

/// How often and how patiently a fetch is retried.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts made after the first one fails with a retryable error.
    #[builder(default = 3)]
    pub max_retries: u32,

    /// The delay before the first retry; each later delay doubles.
    #[builder(default = Duration::from_secs(1))]
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,

    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,

    /// Bound on a single transfer attempt.
    #[builder(default = Duration::from_secs(60))]
    #[serde(with = "duration_secs")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// The delay before retry number `retry` (zero based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Serde helper for durations expressed as (possibly fractional) seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// The terminal outcome of a fetch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FetchOutcome {
    Fetched(#[debug("<{} bytes>", _0.len())] Vec<u8>),
    Failed { error: FetchError, attempts: u32 },

    /// The generation was superseded; this is not a failure.
    Cancelled,
}

/// Performs logical downloads: one or more transfer attempts until a
/// terminal outcome.
#[derive(Clone, Debug)]
pub struct Fetcher<T> {
    #[debug(skip)]
    transfer: T,
    policy: RetryPolicy,
    generations: GenerationTracker,
}

impl<T: Transfer> Fetcher<T> {
    pub fn new(transfer: T, policy: RetryPolicy, generations: GenerationTracker) -> Self {
        Self {
            transfer,
            policy,
            generations,
        }
    }

    /// Download the document at `locator` on behalf of `generation`.
    ///
    /// The generation is checked before every attempt, and a superseded
    /// generation ends any backoff early. Transfers already started are
    /// allowed to finish.
    #[instrument(name = "Fetcher::fetch", skip(self, auth))]
    pub async fn fetch(
        &self,
        locator: &Locator,
        auth: &Token,
        generation: Generation,
    ) -> FetchOutcome {
        let mut attempts = 0u32;
        loop {
            if !self.generations.is_current(generation) {
                debug!(attempts, "generation superseded before attempt");
                return FetchOutcome::Cancelled;
            }

            attempts += 1;
            let transfer = self.transfer.transfer(locator, auth);
            let result = match tokio::time::timeout(self.policy.attempt_timeout, transfer).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Transport {
                    message: format!("timed out after {:?}", self.policy.attempt_timeout),
                }),
            };

            let error = match classify(result) {
                Attempt::Success(bytes) => {
                    debug!(attempts, bytes = bytes.len(), "fetched");
                    return FetchOutcome::Fetched(bytes);
                }
                Attempt::Fail(error) => {
                    debug!(attempts, %error, "fetch failed");
                    return FetchOutcome::Failed { error, attempts };
                }
                Attempt::Retry(error) => error,
            };

            let retry = attempts - 1;
            if retry >= self.policy.max_retries {
                warn!(attempts, %error, "retries exhausted");
                return FetchOutcome::Failed { error, attempts };
            }

            let delay = self.policy.backoff(retry);
            debug!(attempts, %error, ?delay, "retrying after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.generations.superseded(generation) => {
                    debug!(attempts, "generation superseded during backoff");
                    return FetchOutcome::Cancelled;
                }
            }
        }
    }
}

impl Transfer for clients::Client {
    async fn transfer(&self, locator: &Locator, auth: &Token) -> Result<Vec<u8>, TransferError> {
        let url = Url::parse(locator.as_str()).map_err(|err| TransferError::Invalid {
            message: format!("{locator}: {err}"),
        })?;
        self.download(&url, auth).await.map_err(|err| match err.status() {
            Some(status) => TransferError::Status {
                status: status.as_u16(),
                message: err.detail(),
            },
            None => TransferError::Transport {
                message: err.detail(),
            },
        })
    }
}
