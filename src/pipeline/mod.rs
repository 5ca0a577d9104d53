//! Pipeline module - validation, download and archiving of task URLs.
//!
//! # Stages
//! - Validate: each URL is checked when it is submitted (`validate`)
//! - Download: one worker per URL, results collected once all finish (`download`)
//! - Archive: successful downloads are zipped, then removed (`archive`)
//!
//! A [`Pipeline`] runs download → archive for one task once its URL quota is
//! reached. It never touches the task store; the caller records the
//! [`PipelineOutcome`].

pub mod archive;
pub mod download;
pub mod fetch;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::task::{TaskId, TaskStatus};

pub use archive::{ArchiveError, Archiver};
pub use download::{DownloadError, DownloadReport, Downloader};
pub use fetch::{FetchError, FetchResponse, Fetcher, ReqwestFetcher};
pub use validate::{Rejection, UrlValidator};

/// Final result of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub errors: Vec<String>,
    pub archive_url: Option<String>,
}

impl PipelineOutcome {
    /// `completed` only when an archive was produced.
    pub fn status(&self) -> TaskStatus {
        if self.archive_url.is_some() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }
}

pub struct Pipeline {
    downloader: Downloader,
    archiver: Archiver,
}

impl Pipeline {
    pub fn new(downloader: Downloader, archiver: Archiver) -> Self {
        Self {
            downloader,
            archiver,
        }
    }

    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
        Self::new(
            Downloader::from_config(fetcher, config),
            Archiver::from_config(config),
        )
    }

    pub async fn run(
        &self,
        task_id: TaskId,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let DownloadReport { files, mut errors } =
            self.downloader.download_all(task_id, urls, cancel).await;

        if cancel.is_cancelled() {
            download::cleanup_files(&files).await;
            errors.push("pipeline cancelled by shutdown".to_string());
            return PipelineOutcome {
                errors,
                archive_url: None,
            };
        }

        if files.is_empty() {
            tracing::warn!(task_id = %task_id, "No files downloaded, nothing to archive");
            return PipelineOutcome {
                errors,
                archive_url: None,
            };
        }

        let archived = self.archiver.create(task_id, &files).await;
        download::cleanup_files(&files).await;

        match archived {
            Ok(locator) => PipelineOutcome {
                errors,
                archive_url: Some(locator),
            },
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to create zip archive");
                errors.push(e.to_string());
                PipelineOutcome {
                    errors,
                    archive_url: None,
                }
            }
        }
    }
}
