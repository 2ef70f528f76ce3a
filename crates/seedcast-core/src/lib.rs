//! seedcast-core: shared keys, errors, and configuration.
//!
//! This crate is the foundational dependency for the other seedcast crates,
//! providing the resource key that names a media stream, the pipeline
//! variant enum, a unified error type, and the tunables for the pipeline.

pub mod config;
pub mod error;
pub mod key;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use key::{PipelineKey, ResourceKey, Variant};
