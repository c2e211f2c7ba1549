//! HTTP client for document downloads.

use color_eyre::{Result, eyre::Context};
use derive_more::Debug;
use reqwest::Response;
use tracing::{instrument, trace};
use url::Url;

use super::DownloadError;
use crate::Token;

/// Client for downloading submission documents.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug)]
pub struct Client {
    #[debug(skip)]
    http: reqwest::Client,
}

impl Client {
    /// Create a new client.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("build http client")?;

        Ok(Self { http })
    }

    /// Download the document at `url`, authenticating with `token`.
    ///
    /// Any 2xx response is a success; the body is returned as-is, even when
    /// empty.
    #[instrument(name = "Client::download", skip(self, token), fields(url = %url))]
    pub async fn download(&self, url: &Url, token: &Token) -> Result<Vec<u8>, DownloadError> {
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|err| DownloadError::Transport {
                message: format!("send request: {err}"),
            })?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|err| DownloadError::Transport {
                    message: format!("read body: {err}"),
                })?;
            trace!(bytes = body.len(), "downloaded document");
            return Ok(body.to_vec());
        }

        let url = response.url().to_string();
        let request_id = request_id(&response);
        let body = response.text().await.unwrap_or_default();
        Err(DownloadError::Status {
            status,
            url,
            request_id,
            body,
        })
    }
}

/// Extract the request ID from a response header.
fn request_id(response: &Response) -> String {
    response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| String::from("<not set>"))
}
