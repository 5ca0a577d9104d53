//! Download worker pool and result collector.
//!
//! One tokio task per URL streams the body into a uniquely named file in the
//! download directory. The collector joins every worker and splits the results
//! into file paths and error messages; together they always account for every
//! input URL.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::fetch::{content_subtype, FetchError, Fetcher};
use crate::config::{Config, TruncationPolicy};
use crate::task::TaskId;

/// Extension used when the response has no usable content type.
const FALLBACK_EXTENSION: &str = "bin";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to save file: {0}")]
    Io(#[from] std::io::Error),

    #[error("content exceeds the {limit} byte limit")]
    Truncated { limit: u64 },

    #[error("download worker panicked")]
    Panicked,
}

/// Collected outcome of one download batch.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub files: Vec<PathBuf>,
    pub errors: Vec<String>,
}

impl DownloadReport {
    pub fn total(&self) -> usize {
        self.files.len() + self.errors.len()
    }
}

#[derive(Clone)]
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    dir: PathBuf,
    max_bytes: u64,
    truncation: TruncationPolicy,
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        dir: PathBuf,
        max_bytes: u64,
        truncation: TruncationPolicy,
    ) -> Self {
        Self {
            fetcher,
            dir,
            max_bytes,
            truncation,
        }
    }

    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        Self::new(
            fetcher,
            config.download_dir.clone(),
            config.download_max_bytes,
            config.truncation_policy,
        )
    }

    /// Download every URL concurrently and wait for all of them.
    ///
    /// If `cancel` fires, outstanding workers are aborted and each of their URLs
    /// is reported as an error.
    pub async fn download_all(
        &self,
        task_id: TaskId,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> DownloadReport {
        let mut report = DownloadReport::default();
        let mut workers = JoinSet::new();
        let mut pending: BTreeMap<usize, String> = urls.iter().cloned().enumerate().collect();

        for (index, url) in urls.iter().enumerate() {
            let this = self.clone();
            let url = url.clone();
            workers.spawn(async move {
                let result = AssertUnwindSafe(this.download_one(&url))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(DownloadError::Panicked));
                (index, result)
            });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    workers.shutdown().await;
                    for url in std::mem::take(&mut pending).into_values() {
                        report.errors.push(format!("download of {} cancelled", url));
                    }
                    break;
                }
                next = workers.join_next() => match next {
                    None => break,
                    Some(Ok((index, result))) => {
                        let Some(url) = pending.remove(&index) else {
                            continue;
                        };
                        match result {
                            Ok(path) => {
                                tracing::debug!(
                                    task_id = %task_id,
                                    url = %url,
                                    path = %path.display(),
                                    "Downloaded file"
                                );
                                report.files.push(path);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    task_id = %task_id,
                                    url = %url,
                                    error = %e,
                                    "Failed to download file"
                                );
                                report.errors.push(download_failure(&url, &e));
                            }
                        }
                    }
                    Some(Err(join_err)) => {
                        tracing::error!(
                            task_id = %task_id,
                            error = %join_err,
                            "Download worker aborted"
                        );
                    }
                },
            }
        }

        // Workers that never reported back still count as failures.
        for url in pending.into_values() {
            report.errors.push(download_failure(&url, "download worker did not report a result"));
        }

        tracing::info!(
            task_id = %task_id,
            downloaded = report.files.len(),
            failed = report.errors.len(),
            "Download stage complete"
        );

        report
    }

    /// Fetch one URL into a new file under the download directory.
    pub async fn download_one(&self, raw_url: &str) -> Result<PathBuf, DownloadError> {
        let url = Url::parse(raw_url)?;
        let response = self.fetcher.fetch(&url).await?;

        let extension = response
            .content_type
            .as_deref()
            .and_then(content_subtype)
            .map(|s| sanitize_extension(&s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());

        let path = self.dir.join(unique_file_name(&extension));
        let mut guard = PartialFile::new(path.clone());
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let mut body = response.body;
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let remaining = self.max_bytes - written;
            if chunk.len() as u64 > remaining {
                match self.truncation {
                    TruncationPolicy::Fail => {
                        return Err(DownloadError::Truncated {
                            limit: self.max_bytes,
                        });
                    }
                    TruncationPolicy::Keep => {
                        file.write_all(&chunk[..remaining as usize]).await?;
                        tracing::warn!(
                            url = %url,
                            limit = self.max_bytes,
                            "Download truncated at byte limit"
                        );
                        break;
                    }
                }
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        guard.keep();
        Ok(path)
    }
}

/// Removes the file on drop unless [`PartialFile::keep`] was called.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn download_failure(url: &str, cause: impl std::fmt::Display) -> String {
    format!("failed to download file {}, error: {}", url, cause)
}

fn unique_file_name(extension: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("file-{}-{}.{}", nanos, &suffix[..8], extension)
}

fn sanitize_extension(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Best-effort removal of downloaded files.
pub async fn cleanup_files(files: &[PathBuf]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", file.display(), e);
            }
        }
    }
}
