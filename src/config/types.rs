use seedcast_core::config::PipelineConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub source: SourceConfig,
}

/// How the `stream` command reads a local file to mimic a live transfer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Size of each chunk handed to the pipeline, in KiB.
    #[serde(default = "default_chunk_kib")]
    pub chunk_kib: usize,

    /// Read rate in KiB/s; unset means as fast as the disk allows.
    #[serde(default)]
    pub rate_kib: Option<u64>,
}

/// Largest accepted `chunk_kib`.
pub const MAX_CHUNK_KIB: usize = 16 * 1024;

impl SourceConfig {
    /// Chunk size in bytes.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_kib.saturating_mul(1024)
    }

    /// Read rate in bytes per second. `cli_kib` overrides the file; a rate
    /// too large to represent saturates, which is no limit in practice.
    pub fn rate_bytes(&self, cli_kib: Option<u64>) -> Option<u64> {
        cli_kib.or(self.rate_kib).map(|kib| kib.saturating_mul(1024))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            chunk_kib: default_chunk_kib(),
            rate_kib: None,
        }
    }
}

fn default_chunk_kib() -> usize {
    64
}
