//! Per-URL admission checks run before a URL is attached to a task.
//!
//! Checks run in order and stop at the first failure:
//! 1. absolute `http`/`https` URL with a host
//! 2. reachable through a HEAD probe within the probe timeout
//! 3. the probe response carries a content type
//! 4. the content-type subtype is allow-listed

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::fetch::{content_subtype, Fetcher};
use crate::config::Config;

/// Why a URL was not accepted. Never fatal for the batch it arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    MalformedUrl,
    Unreachable,
    MissingContentType,
    DisallowedType,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Self::MalformedUrl => "invalid URL format",
            Self::Unreachable => "URL not reachable",
            Self::MissingContentType => "empty content type",
            Self::DisallowedType => "invalid file extension",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

pub struct UrlValidator {
    fetcher: Arc<dyn Fetcher>,
    allowed_extensions: HashSet<String>,
    probe_timeout: Duration,
}

impl UrlValidator {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        allowed_extensions: HashSet<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            allowed_extensions,
            probe_timeout,
        }
    }

    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        Self::new(
            fetcher,
            config.allowed_extensions.clone(),
            config.probe_timeout,
        )
    }

    /// Syntactic check only.
    ///
    /// The input must already be in `scheme://host` form. Inputs that
    /// `Url::parse` would repair (missing or extra slashes, backslashes)
    /// are rejected rather than rewritten.
    pub fn parse(raw: &str) -> Result<Url, Rejection> {
        let trimmed = raw.trim();
        if trimmed.contains('\\') {
            return Err(Rejection::MalformedUrl);
        }
        let (scheme, rest) = trimmed.split_once("://").ok_or(Rejection::MalformedUrl)?;
        if rest.starts_with('/') {
            return Err(Rejection::MalformedUrl);
        }

        let url = Url::parse(trimmed).map_err(|_| Rejection::MalformedUrl)?;
        if !scheme.eq_ignore_ascii_case(url.scheme()) {
            return Err(Rejection::MalformedUrl);
        }
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(Rejection::MalformedUrl),
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(url),
            _ => Err(Rejection::MalformedUrl),
        }
    }

    pub async fn validate(&self, raw: &str) -> Result<Url, Rejection> {
        let url = Self::parse(raw)?;

        let content_type = match tokio::time::timeout(self.probe_timeout, self.fetcher.probe(&url))
            .await
        {
            Ok(Ok(content_type)) => content_type,
            Ok(Err(e)) => {
                tracing::debug!(url = %url, error = %e, "Probe failed");
                return Err(Rejection::Unreachable);
            }
            Err(_) => {
                tracing::debug!(url = %url, timeout = ?self.probe_timeout, "Probe timed out");
                return Err(Rejection::Unreachable);
            }
        };

        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .ok_or(Rejection::MissingContentType)?;

        match content_subtype(&content_type) {
            Some(subtype) if self.allowed_extensions.contains(&subtype) => Ok(url),
            _ => Err(Rejection::DisallowedType),
        }
    }
}
