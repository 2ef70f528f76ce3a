//! Bridges a download to the transcoder.
//!
//! The orchestrator waits for a session's threshold (or completion), starts
//! the transcoder once, moves the file lease into a cleanup task, and gives
//! the caller the output stream. The cleanup task waits for the process to
//! end, deletes the file unless told to keep it, and records the outcome.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use seedcast_av::ProcessRunner;
use seedcast_core::config::PipelineConfig;
use seedcast_core::{Error, PipelineKey, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::download::DownloadSession;
use crate::stream::{TranscodeCompletion, TranscodeOutcome, TranscodeStream};

/// Per-request transcode switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscodeOptions {
    /// Leave the temp file on disk after the process ends. The sweeper
    /// reclaims it after the retention window.
    pub keep_file: bool,
}

/// Point-in-time view of a running transcoder.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub key: PipelineKey,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub bytes_at_start: u64,
}

#[derive(Debug)]
struct ProcessEntry {
    id: u64,
    snapshot: ProcessSnapshot,
    cancel: CancellationToken,
}

/// Starts transcoders for download sessions.
#[derive(Debug)]
pub struct TranscodeOrchestrator {
    config: Arc<PipelineConfig>,
    runner: ProcessRunner,
    processes: Arc<DashMap<PipelineKey, ProcessEntry>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TranscodeOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        runner: ProcessRunner,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            runner,
            processes: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            tracker,
            cancel,
        }
    }

    /// Start the transcoder for `session` as soon as enough of it is on disk.
    ///
    /// # Errors
    ///
    /// Fails the request outright when the transcoder never got going:
    /// - [`Error::Timeout`] if the threshold is not reached within the
    ///   session timeout (the download is aborted).
    /// - the download's own error ([`Error::Aborted`], [`Error::Source`],
    ///   [`Error::Write`]) if it ends before the threshold.
    /// - [`Error::AlreadyStreaming`] if a transcode for this session already
    ///   started.
    ///
    /// A spawn failure is not returned here; it is the single error item of
    /// the returned stream.
    pub async fn start(
        &self,
        session: Arc<DownloadSession>,
        options: TranscodeOptions,
    ) -> Result<TranscodeStream> {
        let key = session.key().clone();
        let threshold = self.config.threshold_for(session.declared_size());
        let timeout = self.config.session_timeout();

        tracing::debug!(
            key = %key,
            threshold,
            declared_size = session.declared_size(),
            "Waiting for download threshold"
        );
        wait_for_start(&session, threshold, timeout).await?;

        if !session.try_begin_transcode() {
            return Err(Error::AlreadyStreaming(key.to_string()));
        }
        let Some(lease) = session.take_lease() else {
            // The writer failed between the threshold and the handoff and
            // already deleted the file.
            return Err(session.wait_for_completion().await.err().unwrap_or(Error::Aborted));
        };

        let progress = session.progress();
        let bytes_at_start = progress.bytes_written;
        tracing::info!(
            key = %key,
            bytes_at_start,
            threshold,
            declared_size = session.declared_size(),
            download_finished = progress.state.is_terminal(),
            "Starting transcode"
        );

        let (done_tx, done_rx) = watch::channel(None);
        let completion = TranscodeCompletion::new(done_rx);
        let cancel = self.cancel.child_token();

        let running = match self.runner.run(lease.path(), key.variant, cancel.clone()) {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(key = %key, "Failed to start transcoder: {e}");
                let file_removed = lease.release().await;
                if !session.is_finished() {
                    session.abort();
                }
                let _ = done_tx.send(Some(TranscodeOutcome {
                    key: key.clone(),
                    process: None,
                    file_removed,
                    bytes_at_start,
                    download_error: None,
                }));
                return Ok(TranscodeStream::failed(key, e, completion));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.processes.insert(
            key.clone(),
            ProcessEntry {
                id,
                snapshot: ProcessSnapshot {
                    key: key.clone(),
                    pid: running.pid(),
                    started_at: Utc::now(),
                    bytes_at_start,
                },
                cancel: cancel.clone(),
            },
        );

        let (stdout, exit, cancel) = running.into_parts();
        let stop_process = cancel.clone();
        let processes = Arc::clone(&self.processes);
        let cleanup_key = key.clone();
        self.tracker.spawn(async move {
            let exit = exit.wait();
            tokio::pin!(exit);

            // A download that fails under a live process leaves it reading a
            // file that will never grow.
            let mut download_error = None;
            let process = tokio::select! {
                process = &mut exit => process,
                Err(e) = session.wait_for_completion() => {
                    tracing::warn!(key = %cleanup_key, "Download failed during transcode: {e}");
                    download_error = Some(Arc::new(e));
                    stop_process.cancel();
                    exit.await
                }
            };

            let file_removed = if options.keep_file {
                let path = lease.keep();
                tracing::debug!(key = %cleanup_key, path = %path.display(), "Keeping temp file");
                false
            } else {
                lease.release().await
            };

            // Nothing reads the file any more; stop filling it.
            if file_removed && !session.is_finished() {
                session.abort();
            }

            processes.remove_if(&cleanup_key, |_, e| e.id == id);
            tracing::info!(
                key = %cleanup_key,
                exit = ?process.kind,
                file_removed,
                download_failed = download_error.is_some(),
                runtime_ms = process.runtime.as_millis() as u64,
                "Transcode ended"
            );

            let _ = done_tx.send(Some(TranscodeOutcome {
                key: cleanup_key,
                process: Some(process),
                file_removed,
                bytes_at_start,
                download_error,
            }));
        });

        Ok(TranscodeStream::live(key, stdout, cancel.drop_guard(), completion))
    }

    /// Signal termination to the transcoder for `key`.
    pub fn terminate(&self, key: &PipelineKey) -> bool {
        match self.processes.get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.processes.len()
    }

    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        self.processes
            .iter()
            .map(|e| e.value().snapshot.clone())
            .collect()
    }
}

/// Race threshold-or-finished against the session timeout. On timeout the
/// session is aborted.
pub(crate) async fn wait_for_start(
    session: &DownloadSession,
    threshold: u64,
    timeout: Duration,
) -> Result<PathBuf> {
    match tokio::time::timeout(timeout, session.wait_for_threshold(threshold)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                key = %session.key(),
                threshold,
                bytes_written = session.progress().bytes_written,
                "Download did not reach threshold in {timeout:?}"
            );
            session.abort();
            // Returns once the partial file is gone.
            let _ = session.wait_for_completion().await;
            Err(Error::Timeout { waited: timeout })
        }
    }
}
