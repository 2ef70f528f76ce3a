//! # seedcast-pipeline
//!
//! Streams a transcoded media file while the file itself is still arriving.
//!
//! A [`PipelineService`] accepts a [`ByteSource`] (typically a peer-to-peer
//! transfer in progress), writes it to a temp file, and starts the transcoder
//! against that file once an adaptive threshold of bytes is on disk. The
//! transcoder's stdout is returned as a [`TranscodeStream`].
//!
//! - [`store`]: temp paths, deletion, and the [`FileLease`] handoff token.
//! - [`download`]: download sessions, admission control, coalescing.
//! - [`orchestrator`]: threshold wait, one-shot process start, cleanup.
//! - [`sweeper`]: periodic orphan sweep.

pub mod download;
pub mod orchestrator;
pub mod service;
pub mod source;
pub mod store;
pub mod stream;
pub mod sweeper;

pub use download::{
    Admission, DownloadManager, DownloadProgress, DownloadRequest, DownloadSession,
    DownloadSnapshot, DownloadState,
};
pub use orchestrator::{ProcessSnapshot, TranscodeOptions, TranscodeOrchestrator};
pub use service::PipelineService;
pub use source::ByteSource;
pub use store::{FileLease, SweepReport, TempFileStore};
pub use stream::{TranscodeCompletion, TranscodeOutcome, TranscodeStream};
pub use sweeper::CleanupSweeper;
