//! Download sessions: source stream to temp file.
//!
//! A [`DownloadSession`] is created by [`DownloadManager::start`], which also
//! enforces admission control and coalesces requests for the same key. One
//! writer task per session copies chunks to disk and publishes progress on a
//! `watch` channel. `bytes_written` only advances after a chunk has been
//! written and flushed, so a reader of the file never sees less than the
//! counter claims.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use seedcast_core::{Error, PipelineKey, ResourceKey, Result};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::source::ByteSource;
use crate::store::{FileLease, TempFileStore};

// ---------------------------------------------------------------------------
// Request and progress types
// ---------------------------------------------------------------------------

/// What the caller knows about an inbound transfer.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub resource: ResourceKey,
    /// Total size announced out of band; 0 when unknown.
    pub declared_size: u64,
    /// Container extension for the temp file (e.g. `mkv`).
    pub extension: String,
}

impl DownloadRequest {
    pub fn new(resource: ResourceKey, declared_size: u64) -> Self {
        Self {
            resource,
            declared_size,
            extension: "bin".into(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

/// Lifecycle state of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Writing,
    /// All bytes written and synced to disk.
    Finished,
    SourceFailed(String),
    WriteFailed {
        kind: io::ErrorKind,
        message: String,
    },
    Aborted,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadState::Writing)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DownloadState::Writing => "writing",
            DownloadState::Finished => "finished",
            DownloadState::SourceFailed(_) => "source_failed",
            DownloadState::WriteFailed { .. } => "write_failed",
            DownloadState::Aborted => "aborted",
        }
    }

    /// The caller-facing error for a failed state.
    fn error(&self, path: &Path) -> Option<Error> {
        match self {
            DownloadState::Writing | DownloadState::Finished => None,
            DownloadState::SourceFailed(msg) => Some(Error::Source(msg.clone())),
            DownloadState::WriteFailed { kind, message } => {
                Some(Error::write(path, io::Error::new(*kind, message.clone())))
            }
            DownloadState::Aborted => Some(Error::Aborted),
        }
    }
}

/// Progress published by the writer task.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes taken from the source.
    pub bytes_received: u64,
    /// Bytes written and flushed to the file.
    pub bytes_written: u64,
    pub state: DownloadState,
}

/// Point-in-time view of a session, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub key: PipelineKey,
    pub path: PathBuf,
    pub declared_size: u64,
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub state: &'static str,
    pub transcode_started: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// DownloadSession
// ---------------------------------------------------------------------------

/// One inbound transfer being written to a temp file.
#[derive(Debug)]
pub struct DownloadSession {
    key: PipelineKey,
    path: PathBuf,
    declared_size: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    progress: watch::Receiver<DownloadProgress>,
    cancel: CancellationToken,
    lease: Mutex<Option<FileLease>>,
    transcode_started: AtomicBool,
}

impl DownloadSession {
    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn progress(&self) -> DownloadProgress {
        self.progress.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().state == DownloadState::Finished
    }

    /// Abort the transfer: stop reading the source, close the file, and
    /// delete it unless a transcode already owns it.
    ///
    /// Idempotent, and a no-op once the download has ended.
    pub fn abort(&self) {
        if !self.progress.borrow().state.is_terminal() {
            tracing::info!(key = %self.key, "Aborting download");
        }
        self.cancel.cancel();
    }

    /// Wait until the whole source has been written and synced.
    pub async fn wait_for_completion(&self) -> Result<PathBuf> {
        self.wait_until(|p| p.state.is_terminal()).await
    }

    /// Wait until at least `threshold` bytes are on disk, or the download
    /// finished with fewer.
    pub async fn wait_for_threshold(&self, threshold: u64) -> Result<PathBuf> {
        self.wait_until(|p| p.bytes_written >= threshold || p.state.is_terminal())
            .await
    }

    async fn wait_until(&self, ready: impl FnMut(&DownloadProgress) -> bool) -> Result<PathBuf> {
        let mut rx = self.progress.clone();
        let state = match rx.wait_for(ready).await {
            Ok(progress) => progress.state.clone(),
            // The writer always publishes a terminal state before it exits.
            Err(_) => DownloadState::Aborted,
        };
        match state.error(&self.path) {
            Some(err) => Err(err),
            None => Ok(self.path.clone()),
        }
    }

    /// Mark the transcode as started. Only the first caller gets `true`.
    pub(crate) fn try_begin_transcode(&self) -> bool {
        self.transcode_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take the file lease. Returns `None` once someone else has it.
    pub(crate) fn take_lease(&self) -> Option<FileLease> {
        self.lease.lock().take()
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let progress = self.progress();
        DownloadSnapshot {
            key: self.key.clone(),
            path: self.path.clone(),
            declared_size: self.declared_size,
            bytes_received: progress.bytes_received,
            bytes_written: progress.bytes_written,
            state: progress.state.label(),
            transcode_started: self.transcode_started.load(Ordering::Acquire),
            started_at: self.started_at,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// DownloadManager
// ---------------------------------------------------------------------------

/// Result of [`DownloadManager::start`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new transfer was started for this request's source.
    Started(Arc<DownloadSession>),
    /// A transfer for the key was already running; the new source was
    /// dropped unread.
    Joined(Arc<DownloadSession>),
}

impl Admission {
    pub fn session(&self) -> &Arc<DownloadSession> {
        match self {
            Admission::Started(s) | Admission::Joined(s) => s,
        }
    }

    pub fn into_session(self) -> Arc<DownloadSession> {
        match self {
            Admission::Started(s) | Admission::Joined(s) => s,
        }
    }
}

type Registry = Arc<DashMap<PipelineKey, Arc<DownloadSession>>>;

/// Registry of active downloads with admission control.
#[derive(Debug)]
pub struct DownloadManager {
    store: Arc<TempFileStore>,
    sessions: Registry,
    /// Serializes check-and-insert so the limit and coalescing hold under
    /// concurrent `start` calls.
    admission: Mutex<()>,
    max_concurrent: usize,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        store: Arc<TempFileStore>,
        max_concurrent: usize,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            sessions: Arc::new(DashMap::new()),
            admission: Mutex::new(()),
            max_concurrent,
            tracker,
            cancel,
        }
    }

    /// Start (or join) the download for `key`.
    ///
    /// Never waits: a full registry is rejected with [`Error::Capacity`] on
    /// the spot. Joining an existing session does not count against the
    /// limit.
    ///
    /// # Errors
    ///
    /// - [`Error::Capacity`] when `max_concurrent` downloads are active.
    /// - [`Error::AlreadyStreaming`] when a finished download's file for the
    ///   same key is still owned by a running transcode.
    /// - [`Error::Aborted`] after shutdown.
    pub fn start(
        &self,
        key: PipelineKey,
        request: &DownloadRequest,
        source: ByteSource,
    ) -> Result<Admission> {
        if self.cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let _guard = self.admission.lock();

        if let Some(existing) = self.sessions.get(&key) {
            tracing::debug!(key = %key, "Joining in-flight download");
            return Ok(Admission::Joined(Arc::clone(existing.value())));
        }

        let active = self.sessions.len();
        if active >= self.max_concurrent {
            tracing::warn!(
                key = %key,
                active,
                limit = self.max_concurrent,
                "Rejecting download: capacity reached"
            );
            return Err(Error::Capacity {
                limit: self.max_concurrent,
            });
        }

        let path = self.store.path_for(&key, &request.extension);
        let lease = self
            .store
            .lease(path.clone())
            .ok_or_else(|| Error::AlreadyStreaming(key.to_string()))?;

        let (tx, rx) = watch::channel(DownloadProgress {
            bytes_received: 0,
            bytes_written: 0,
            state: DownloadState::Writing,
        });
        let session = Arc::new(DownloadSession {
            key: key.clone(),
            path,
            declared_size: request.declared_size,
            started_at: Utc::now(),
            started: Instant::now(),
            progress: rx,
            cancel: self.cancel.child_token(),
            lease: Mutex::new(Some(lease)),
            transcode_started: AtomicBool::new(false),
        });
        self.sessions.insert(key.clone(), Arc::clone(&session));

        tracing::info!(
            key = %key,
            declared_size = request.declared_size,
            path = %session.path.display(),
            "Starting download"
        );

        self.tracker.spawn(write_loop(
            Arc::clone(&session),
            source,
            tx,
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
        ));

        Ok(Admission::Started(session))
    }

    pub fn get(&self, key: &PipelineKey) -> Option<Arc<DownloadSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Abort the active download for `key`. Returns `false` if none exists.
    pub fn abort(&self, key: &PipelineKey) -> bool {
        match self.get(key) {
            Some(session) => {
                session.abort();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshots(&self) -> Vec<DownloadSnapshot> {
        self.sessions.iter().map(|s| s.value().snapshot()).collect()
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn write_loop(
    session: Arc<DownloadSession>,
    mut source: ByteSource,
    tx: watch::Sender<DownloadProgress>,
    store: Arc<TempFileStore>,
    sessions: Registry,
) {
    let key = session.key.clone();
    let path = session.path.clone();

    let state = match open_file(&store, &path).await {
        Ok(file) => copy_source(&session, &mut source, file, &tx).await,
        Err(e) => DownloadState::WriteFailed {
            kind: e.kind(),
            message: e.to_string(),
        },
    };
    // Release the source before anyone observes the terminal state.
    drop(source);

    if state != DownloadState::Finished {
        if let Some(lease) = session.take_lease() {
            lease.release().await;
        }
    }

    // Leave the registry before publishing, so a caller woken by the
    // terminal state sees the freed slot.
    sessions.remove_if(&key, |_, s| Arc::ptr_eq(s, &session));

    let progress = tx.borrow().clone();
    match &state {
        DownloadState::Finished => tracing::info!(
            key = %key,
            bytes = progress.bytes_written,
            elapsed_ms = session.started.elapsed().as_millis() as u64,
            "Download finished"
        ),
        DownloadState::Aborted => tracing::info!(
            key = %key,
            bytes = progress.bytes_written,
            "Download aborted"
        ),
        DownloadState::SourceFailed(msg) => tracing::warn!(
            key = %key,
            bytes = progress.bytes_written,
            "Download source failed: {msg}"
        ),
        DownloadState::WriteFailed { message, .. } => tracing::warn!(
            key = %key,
            path = %path.display(),
            "Download write failed: {message}"
        ),
        DownloadState::Writing => {}
    }

    tx.send_modify(|p| p.state = state);
}

async fn open_file(store: &TempFileStore, path: &Path) -> io::Result<File> {
    store.ensure_root().await?;
    File::create(path).await
}

/// Copy chunks until the source ends, fails, or the session is cancelled.
async fn copy_source(
    session: &DownloadSession,
    source: &mut ByteSource,
    mut file: File,
    tx: &watch::Sender<DownloadProgress>,
) -> DownloadState {
    let mut received: u64 = 0;
    let mut written: u64 = 0;

    loop {
        let next = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return DownloadState::Aborted,
            next = source.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                received += chunk.len() as u64;
                tx.send_modify(|p| p.bytes_received = received);

                if let Err(e) = write_chunk(&mut file, &chunk).await {
                    return DownloadState::WriteFailed {
                        kind: e.kind(),
                        message: e.to_string(),
                    };
                }
                written += chunk.len() as u64;
                tx.send_modify(|p| p.bytes_written = written);
            }
            Some(Err(e)) => return DownloadState::SourceFailed(e.to_string()),
            None => {
                return match file.sync_all().await {
                    Ok(()) => DownloadState::Finished,
                    Err(e) => DownloadState::WriteFailed {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                };
            }
        }
    }
}

async fn write_chunk(file: &mut File, chunk: &[u8]) -> io::Result<()> {
    file.write_all(chunk).await?;
    // Hand the bytes to the OS so another process reading the path sees them.
    file.flush().await
}
