//! seedcast: stream a transcode of media that is still downloading.
//!
//! The binary wraps [`seedcast_pipeline::PipelineService`]; this library
//! crate exposes its config loader and file source for integration tests.

pub mod config;
pub mod source;
