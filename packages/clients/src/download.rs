//! Authenticated document downloads from the remote submission API.

use derive_more::{Debug, Display, Error};
use http::StatusCode;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

/// A failed download, with the remote error body translated for callers.
///
/// Callers that need to decide whether to retry should look at
/// [`DownloadError::status`]; this type makes no retry decisions itself.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// The server answered with a non-success status code.
    #[display("unexpected status code {status} from {url}")]
    Status {
        status: StatusCode,
        url: String,
        request_id: String,
        body: String,
    },

    /// The request never produced a response, or the body could not be read.
    #[display("transport error: {message}")]
    Transport { message: String },
}

impl DownloadError {
    /// The HTTP status of the response, if there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DownloadError::Status { status, .. } => Some(*status),
            DownloadError::Transport { .. } => None,
        }
    }

    /// The most useful human readable detail for this error.
    ///
    /// For status errors this is the response body when the server sent one,
    /// otherwise the canonical reason for the status code.
    pub fn detail(&self) -> String {
        match self {
            DownloadError::Status { status, body, .. } if body.trim().is_empty() => status
                .canonical_reason()
                .map(String::from)
                .unwrap_or_else(|| status.to_string()),
            DownloadError::Status { body, .. } => body.trim().to_string(),
            DownloadError::Transport { message } => message.clone(),
        }
    }
}
