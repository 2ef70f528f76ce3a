//! Shared harness for pipeline integration tests.
//!
//! [`ScriptInvoker`] stands in for ffmpeg: it runs a shell script with the
//! temp file path as `$1` and counts how often it was started. Sources are
//! fed through an mpsc channel so tests control exactly when bytes arrive.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use seedcast_av::{ToolCommand, TranscodeInvoker};
use seedcast_core::config::PipelineConfig;
use seedcast_core::{ResourceKey, Variant};
use seedcast_pipeline::{ByteSource, DownloadRequest, PipelineService, TranscodeStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct ScriptInvoker {
    program: PathBuf,
    script: String,
    starts: Arc<AtomicUsize>,
}

impl ScriptInvoker {
    pub fn new(script: &str) -> Self {
        Self {
            program: PathBuf::from("sh"),
            script: script.to_string(),
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// An invoker whose program does not exist.
    pub fn missing() -> Self {
        Self {
            program: PathBuf::from("/nonexistent/seedcast-transcoder"),
            script: String::new(),
            starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn starts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.starts)
    }
}

impl TranscodeInvoker for ScriptInvoker {
    fn command(&self, input: &Path, _variant: Variant) -> ToolCommand {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut cmd = ToolCommand::new(self.program.clone());
        cmd.args(["-c", self.script.as_str(), "sh"]);
        cmd.arg(input.to_string_lossy());
        cmd
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub service: PipelineService,
    pub starts: Arc<AtomicUsize>,
}

impl Harness {
    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("pipeline")
    }

    /// Files currently in the temp directory.
    pub fn temp_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.temp_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

/// Config scaled down for tests: 15 kB minimum threshold, short timeouts.
pub fn test_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        temp_dir: dir.join("pipeline"),
        threshold_min_bytes: 15_000,
        session_timeout_secs: 10,
        kill_grace_millis: 500,
        ..PipelineConfig::default()
    }
}

pub fn harness(invoker: ScriptInvoker) -> Harness {
    harness_with(invoker, |_| {})
}

pub fn harness_with(invoker: ScriptInvoker, tweak: impl FnOnce(&mut PipelineConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let starts = invoker.starts();
    let service = PipelineService::new(config, Arc::new(invoker)).unwrap();
    Harness {
        dir,
        service,
        starts,
    }
}

pub fn request(id: &str, declared_size: u64) -> DownloadRequest {
    DownloadRequest::new(ResourceKey::new(id, 0), declared_size).with_extension("mkv")
}

/// A source fed by the returned sender. Dropping the sender ends the source.
pub fn channel_source() -> (mpsc::Sender<io::Result<Bytes>>, ByteSource) {
    let (tx, rx) = mpsc::channel(16);
    (tx, Box::pin(ReceiverStream::new(rx)))
}

pub fn chunk(len: usize) -> io::Result<Bytes> {
    Ok(Bytes::from(vec![b'x'; len]))
}

/// Read the whole output stream, failing the test on stream errors.
pub async fn read_all(mut stream: TranscodeStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        out.extend_from_slice(&item.unwrap());
    }
    out
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
