//! Unified error type for the seedcast pipeline.
//!
//! Every failure a caller can observe funnels into [`Error`]. Hosts derive an
//! HTTP status with [`Error::http_status`] and decide whether to retry with
//! [`Error::is_retryable`].

use std::path::PathBuf;
use std::time::Duration;

/// Unified error type covering all failure modes in seedcast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The concurrent download limit is reached. The request was not queued.
    #[error("Capacity reached: {limit} concurrent downloads already active")]
    Capacity {
        /// The configured maximum.
        limit: usize,
    },

    /// The download did not reach its start threshold in time.
    #[error("Timed out after {waited:?} waiting for download threshold")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The download session was aborted before it produced a usable file.
    #[error("Download aborted")]
    Aborted,

    /// The upstream byte source failed.
    #[error("Source error: {0}")]
    Source(String),

    /// Writing the temp file failed (disk full, permissions, ...).
    #[error("Write error on {}: {source}", path.display())]
    Write {
        /// The temp file being written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The external transcoder could not be started.
    #[error("Failed to spawn {tool}: {message}")]
    Spawn {
        /// Name of the program that failed to start.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// The external transcoder exited unsuccessfully.
    #[error("{tool} exited with {status}")]
    Process {
        /// Name of the program.
        tool: String,
        /// Rendered exit status.
        status: String,
    },

    /// A transcode for this key and variant is already being streamed.
    #[error("Already streaming: {0}")]
    AlreadyStreaming(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool could not be located or queried.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Configuration or request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Capacity { .. } => 503,
            Error::Timeout { .. } => 504,
            Error::Aborted => 499,
            Error::Source(_) => 502,
            Error::Write { .. } => 507,
            Error::Spawn { .. } => 500,
            Error::Process { .. } => 502,
            Error::AlreadyStreaming(_) => 409,
            Error::Io { .. } => 500,
            Error::Tool { .. } => 502,
            Error::Validation(_) => 400,
            Error::Internal(_) => 500,
        }
    }

    /// Whether an immediate fresh request may succeed.
    ///
    /// Capacity rejections are deliberately not retryable: the caller should
    /// back off instead of hammering the admission check.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Source(_))
    }

    /// Convenience constructor for [`Error::Spawn`].
    pub fn spawn(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Spawn {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Write`].
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Write {
            path: path.into(),
            source,
        }
    }

    /// The [`std::io::ErrorKind`] a byte-stream consumer sees for this error.
    pub fn io_kind(&self) -> std::io::ErrorKind {
        use std::io::ErrorKind;
        match self {
            Error::Io { source } | Error::Write { source, .. } => source.kind(),
            Error::Source(_) => ErrorKind::UnexpectedEof,
            Error::Aborted => ErrorKind::Interrupted,
            Error::Timeout { .. } => ErrorKind::TimedOut,
            _ => ErrorKind::Other,
        }
    }

    /// Convert into an [`std::io::Error`] for delivery on a byte stream.
    pub fn into_io(self) -> std::io::Error {
        match self {
            Error::Io { source } => source,
            Error::Write { source, .. } => source,
            other => std::io::Error::other(other),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
