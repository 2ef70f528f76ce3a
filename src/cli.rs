use clap::{Parser, Subcommand};
use seedcast_core::Variant;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "seedcast")]
#[command(author, version, about = "Stream a transcode of media while it is still downloading")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Feed a local file through the pipeline as if it were arriving from a peer
    Stream {
        /// Input media file
        #[arg(required = true)]
        input: PathBuf,

        /// Content id for the resource key (defaults to the file name)
        #[arg(long)]
        content_id: Option<String>,

        /// Stream index within the content
        #[arg(long, default_value = "0")]
        stream_index: u32,

        /// Pipeline variant: full or audio
        #[arg(long, default_value = "full", value_parser = parse_variant)]
        variant: Variant,

        /// Limit the simulated transfer to this many KiB/s
        #[arg(long)]
        rate_kib: Option<u64>,

        /// Write the output here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Leave the temp file on disk after the transcoder exits
        #[arg(long)]
        keep_file: bool,
    },

    /// Delete stale files from the temp directory
    Sweep,

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

fn parse_variant(s: &str) -> Result<Variant, String> {
    s.parse().map_err(|e: seedcast_core::Error| e.to_string())
}
