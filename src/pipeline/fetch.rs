//! HTTP access used by validation and downloading.
//!
//! The [`Fetcher`] trait is the seam between the pipeline and the network:
//! a header-only probe for validation and a streaming GET for downloads.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use url::Url;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status code {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

/// A successful GET: response headers already checked, body still streaming.
pub struct FetchResponse {
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Header-only request. Any HTTP response counts as reachable;
    /// returns the `Content-Type` header if the server sent one.
    async fn probe(&self, url: &Url) -> Result<Option<String>, FetchError>;

    /// Full GET. Non-2xx responses are errors.
    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    probe_timeout: Duration,
    download_timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new(probe_timeout: Duration, download_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("url-bundler/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self {
            client,
            probe_timeout,
            download_timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Self::new(config.probe_timeout, config.download_timeout)
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn probe(&self, url: &Url) -> Result<Option<String>, FetchError> {
        let response = self
            .client
            .head(url.clone())
            .timeout(self.probe_timeout)
            .send()
            .await?;

        Ok(header_string(response.headers()))
    }

    async fn fetch(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.download_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = header_string(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();

        Ok(FetchResponse { content_type, body })
    }
}

fn header_string(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Media subtype of a content type, lower-cased: `image/jpeg; q=1` → `jpeg`.
///
/// Returns `None` unless the media type has exactly one `/` and a non-empty subtype.
pub fn content_subtype(content_type: &str) -> Option<String> {
    let media = content_type.split(';').next().unwrap_or_default().trim();
    let mut parts = media.split('/');
    let (_, subtype) = match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(subtype), None) => (kind, subtype.trim()),
        _ => return None,
    };
    if subtype.is_empty() {
        return None;
    }
    Some(subtype.to_ascii_lowercase())
}
