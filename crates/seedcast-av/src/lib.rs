//! # seedcast-av
//!
//! External transcoder invocation and supervision for the seedcast pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache the ffmpeg path.
//! - **Command building** ([`ToolCommand`]) -- async builder for one-shot
//!   executions and for long-running piped children.
//! - **Argument contract** ([`FfmpegInvoker`]) -- the two fixed transcoder
//!   invocations, behind the [`TranscodeInvoker`] seam.
//! - **Process supervision** ([`ProcessRunner`]) -- spawn, expose stdout,
//!   keep a bounded stderr tail, terminate on request.

pub mod command;
pub mod invoker;
pub mod runner;
pub mod stderr;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use invoker::{FfmpegInvoker, TranscodeInvoker};
pub use runner::{ExitKind, ProcessExit, ProcessOutcome, ProcessRunner, RunningProcess};
pub use stderr::StderrTail;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
