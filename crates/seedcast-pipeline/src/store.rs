//! Temp file ownership on disk.
//!
//! [`TempFileStore`] derives paths from pipeline keys and deletes files.
//! [`FileLease`] is the capability to delete one of those files: exactly one
//! lease exists per path at a time, and it moves from the download to the
//! transcode stage once, never back.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use seedcast_core::PipelineKey;
use serde::Serialize;

/// Extension used when the caller's is empty or unusable.
const DEFAULT_EXTENSION: &str = "bin";

/// Longest extension kept in a file name.
const MAX_EXTENSION_LEN: usize = 8;

/// Owns the temp file root directory.
#[derive(Debug)]
pub struct TempFileStore {
    root: PathBuf,
    leased: Arc<Mutex<HashSet<PathBuf>>>,
}

impl TempFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist.
    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Deterministic path for `key` with the given extension.
    ///
    /// The extension is reduced to ASCII alphanumerics; an empty result falls
    /// back to `bin`.
    pub fn path_for(&self, key: &PipelineKey, extension: &str) -> PathBuf {
        let ext: String = extension
            .trim_start_matches('.')
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(MAX_EXTENSION_LEN)
            .collect::<String>()
            .to_ascii_lowercase();
        let ext = if ext.is_empty() {
            DEFAULT_EXTENSION.to_string()
        } else {
            ext
        };
        self.root.join(format!("{}.{ext}", key.file_stem()))
    }

    /// Take the deletion lease for `path`.
    ///
    /// Returns `None` while another lease for the same path is alive.
    pub fn lease(&self, path: PathBuf) -> Option<FileLease> {
        if !self.leased.lock().insert(path.clone()) {
            return None;
        }
        Some(FileLease {
            path,
            leased: Arc::clone(&self.leased),
        })
    }

    /// Whether a live lease exists for `path`.
    pub fn is_leased(&self, path: &Path) -> bool {
        self.leased.lock().contains(path)
    }

    /// Delete `path`. Failures are logged, never returned.
    ///
    /// Returns `true` when the file is gone afterwards, including when it
    /// was already missing.
    pub async fn remove(&self, path: &Path) -> bool {
        remove_file_logged(path).await
    }

    /// Delete every file directly under the root whose modification time is
    /// older than `retention`, whether or not anything in memory refers to
    /// it. Directories are left alone.
    pub async fn sweep(&self, retention: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), "Cannot list temp directory: {e}");
                report.failed += 1;
                return report;
            }
        };

        let now = SystemTime::now();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(root = %self.root.display(), "Error while listing temp directory: {e}");
                    report.failed += 1;
                    break;
                }
            };
            report.scanned += 1;

            let path = entry.path();
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.already_gone += 1;
                    continue;
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), "Cannot stat temp entry: {e}");
                    report.failed += 1;
                    continue;
                }
            };

            // The pipeline only creates files; directories are not ours.
            if meta.is_dir() {
                tracing::debug!(path = %path.display(), "Sweep skips directory");
                continue;
            }

            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age <= retention {
                continue;
            }

            let result = tokio::fs::remove_file(&path).await;
            match result {
                Ok(()) => {
                    tracing::info!(
                        path = %path.display(),
                        age_secs = age.as_secs(),
                        "Swept stale temp file"
                    );
                    report.removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => report.already_gone += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to sweep temp file: {e}");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    /// Entries that disappeared between listing and deletion.
    pub already_gone: usize,
    pub failed: usize,
}

/// The right to delete one temp file.
///
/// Not `Clone`: whoever holds the lease decides the file's fate, either by
/// [`release`](Self::release) (delete) or [`keep`](Self::keep). Dropping a
/// lease gives up the right without deleting anything.
#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    leased: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FileLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file and give up the lease.
    ///
    /// Returns `true` when the file is gone afterwards.
    pub async fn release(self) -> bool {
        remove_file_logged(&self.path).await
    }

    /// Give up the lease and leave the file on disk.
    pub fn keep(self) -> PathBuf {
        self.path.clone()
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.path);
    }
}

async fn remove_file_logged(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed temp file");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Temp file already gone");
            true
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to remove temp file: {e}");
            false
        }
    }
}
