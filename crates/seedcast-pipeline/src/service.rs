//! The pipeline façade.

use std::path::PathBuf;
use std::sync::Arc;

use seedcast_av::{ProcessRunner, TranscodeInvoker};
use seedcast_core::config::PipelineConfig;
use seedcast_core::{PipelineKey, Result, Variant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::download::{DownloadManager, DownloadRequest, DownloadSnapshot};
use crate::orchestrator::{
    wait_for_start, ProcessSnapshot, TranscodeOptions, TranscodeOrchestrator,
};
use crate::source::ByteSource;
use crate::store::{SweepReport, TempFileStore};
use crate::stream::TranscodeStream;
use crate::sweeper::CleanupSweeper;

/// One pipeline instance: registries, temp store, and background tasks.
///
/// Construct one per host process (or per test) and call
/// [`destroy`](Self::destroy) to tear it down.
#[derive(Debug)]
pub struct PipelineService {
    config: Arc<PipelineConfig>,
    store: Arc<TempFileStore>,
    downloads: DownloadManager,
    orchestrator: TranscodeOrchestrator,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl PipelineService {
    /// Build the service and start the cleanup sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`seedcast_core::Error::Validation`] if the config is unusable.
    pub fn new(config: PipelineConfig, invoker: Arc<dyn TranscodeInvoker>) -> Result<Self> {
        config.validate_strict()?;
        for warning in config.validate() {
            tracing::warn!("Pipeline config: {warning}");
        }

        let config = Arc::new(config);
        let store = Arc::new(TempFileStore::new(config.temp_dir.clone()));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let runner = ProcessRunner::new(invoker)
            .with_kill_grace(config.kill_grace())
            .with_stderr_lines(config.stderr_tail_lines);
        let downloads = DownloadManager::new(
            Arc::clone(&store),
            config.max_concurrent_downloads,
            tracker.clone(),
            cancel.clone(),
        );
        let orchestrator = TranscodeOrchestrator::new(
            Arc::clone(&config),
            runner,
            tracker.clone(),
            cancel.clone(),
        );

        CleanupSweeper::new(Arc::clone(&store), config.sweep_interval(), config.retention())
            .start(&tracker, cancel.child_token());

        tracing::info!(
            temp_dir = %config.temp_dir.display(),
            max_concurrent_downloads = config.max_concurrent_downloads,
            threshold_min_bytes = config.threshold_min_bytes,
            "Pipeline service started"
        );

        Ok(Self {
            config,
            store,
            downloads,
            orchestrator,
            tracker,
            cancel,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &TempFileStore {
        &self.store
    }

    /// Download `source` completely and return the file path.
    ///
    /// The session timeout bounds only the wait for the start threshold,
    /// not the whole transfer. The file is left on disk for the caller;
    /// the sweeper reclaims it after the retention window.
    pub async fn download(&self, request: DownloadRequest, source: ByteSource) -> Result<PathBuf> {
        let key = PipelineKey::new(request.resource.clone(), Variant::Full);
        let session = self.downloads.start(key, &request, source)?.into_session();
        wait_for_start(
            &session,
            self.config.threshold_for(request.declared_size),
            self.config.session_timeout(),
        )
        .await?;
        session.wait_for_completion().await
    }

    /// Resolve as soon as the start threshold is on disk (or the transfer
    /// finished first). The download keeps running afterwards.
    pub async fn download_until_threshold(
        &self,
        request: DownloadRequest,
        source: ByteSource,
    ) -> Result<PathBuf> {
        let key = PipelineKey::new(request.resource.clone(), Variant::Full);
        let session = self.downloads.start(key, &request, source)?.into_session();
        wait_for_start(
            &session,
            self.config.threshold_for(request.declared_size),
            self.config.session_timeout(),
        )
        .await
    }

    /// Full re-encode pipeline.
    pub async fn transcode(
        &self,
        request: DownloadRequest,
        source: ByteSource,
    ) -> Result<TranscodeStream> {
        self.transcode_with(request, Variant::Full, TranscodeOptions::default(), source)
            .await
    }

    /// Audio-only remux pipeline: video copied, audio re-encoded.
    pub async fn remux_audio(
        &self,
        request: DownloadRequest,
        source: ByteSource,
    ) -> Result<TranscodeStream> {
        self.transcode_with(request, Variant::AudioRemux, TranscodeOptions::default(), source)
            .await
    }

    /// Start (or join) the download and stream the transcoder's output.
    ///
    /// Errors returned here mean nothing was streamed; errors after that
    /// arrive as items of the returned stream.
    pub async fn transcode_with(
        &self,
        request: DownloadRequest,
        variant: Variant,
        options: TranscodeOptions,
        source: ByteSource,
    ) -> Result<TranscodeStream> {
        let key = PipelineKey::new(request.resource.clone(), variant);
        let session = self.downloads.start(key, &request, source)?.into_session();
        self.orchestrator.start(session, options).await
    }

    /// Abort the in-flight download for `key`.
    pub fn abort_download(&self, key: &PipelineKey) -> bool {
        self.downloads.abort(key)
    }

    /// Terminate the transcoder for `key`.
    pub fn terminate_transcode(&self, key: &PipelineKey) -> bool {
        self.orchestrator.terminate(key)
    }

    pub fn active_downloads(&self) -> Vec<DownloadSnapshot> {
        self.downloads.snapshots()
    }

    pub fn active_processes(&self) -> Vec<ProcessSnapshot> {
        self.orchestrator.snapshots()
    }

    /// Run one orphan sweep now, outside the timer.
    pub async fn sweep_now(&self) -> SweepReport {
        self.store.sweep(self.config.retention()).await
    }

    /// Abort every download, terminate every transcoder, stop the sweeper,
    /// and wait until all of their files are cleaned up.
    ///
    /// Idempotent.
    pub async fn destroy(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(
                downloads = self.downloads.active_count(),
                processes = self.orchestrator.active_count(),
                "Shutting down pipeline service"
            );
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Pipeline service stopped");
    }
}
