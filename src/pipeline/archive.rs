//! Zip bundling of downloaded files.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::Config;
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no files to archive")]
    Empty,

    #[error("failed to write archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Writes `<archive_dir>/<task id>.zip` and hands out the public locator for it.
#[derive(Debug, Clone)]
pub struct Archiver {
    dir: PathBuf,
    public_base_url: String,
}

impl Archiver {
    pub fn new(dir: PathBuf, public_base_url: impl Into<String>) -> Self {
        Self {
            dir,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.archive_dir.clone(), config.public_base_url.clone())
    }

    pub fn archive_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(archive_file_name(task_id))
    }

    /// URL under which the static `/archives` route serves the bundle.
    pub fn locator(&self, task_id: TaskId) -> String {
        format!("{}/archives/{}", self.public_base_url, archive_file_name(task_id))
    }

    /// Bundle `files` into the task's archive and return its locator.
    ///
    /// Entries are named by base name; a later file with the same base name
    /// replaces the earlier one. On failure no archive file is left behind.
    pub async fn create(&self, task_id: TaskId, files: &[PathBuf]) -> Result<String, ArchiveError> {
        if files.is_empty() {
            return Err(ArchiveError::Empty);
        }

        let target = self.archive_path(task_id);
        let files = files.to_vec();
        tokio::task::spawn_blocking(move || write_archive(&target, &files)).await??;

        tracing::info!(
            task_id = %task_id,
            "Created archive {}",
            self.archive_path(task_id).display()
        );
        Ok(self.locator(task_id))
    }
}

fn archive_file_name(task_id: TaskId) -> String {
    format!("{}.zip", task_id)
}

fn write_archive(target: &Path, files: &[PathBuf]) -> Result<(), ArchiveError> {
    let partial = target.with_extension("zip.part");
    match write_entries(&partial, files) {
        Ok(()) => {
            std::fs::rename(&partial, target)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn write_entries(dest: &Path, files: &[PathBuf]) -> Result<(), ArchiveError> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, path) in entry_names(files) {
        let mut source = File::open(path)?;
        zip.start_file(name, options)?;
        std::io::copy(&mut source, &mut zip)?;
    }

    let mut out = zip.finish()?;
    out.flush()?;
    Ok(())
}

/// One entry per base name, in first-seen order, pointing at the last path with that name.
fn entry_names(files: &[PathBuf]) -> Vec<(String, &Path)> {
    let mut entries: Vec<(String, &Path)> = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = path.as_path(),
            None => entries.push((name, path.as_path())),
        }
    }
    entries
}
