//! Shared client library for the remote submission API.
//!
//! This library provides the authorization capability handed to the sync
//! engine and the HTTP client used to download submission documents. Types are
//! always available, while HTTP client code is gated behind the `client`
//! feature.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use serde::{Deserialize, Serialize};
use tap::Pipe;

pub mod download;

/// An authentication token for API access.
///
/// This type wraps a token string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The download client.
#[cfg(feature = "client")]
pub type Client = download::Client;
