//! Pipeline configuration types.
//!
//! Every field defaults sensibly so an empty TOML table is a valid config.
//! Durations are stored as whole seconds (or milliseconds where noted) to keep
//! config files readable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::Error;

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Pipeline tunables
// ---------------------------------------------------------------------------

/// Admission, threshold, timeout and cleanup settings for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory for temp files. Created on first use.
    pub temp_dir: PathBuf,
    /// Maximum number of concurrently active downloads.
    pub max_concurrent_downloads: usize,
    /// Upper bound for the early-start threshold, in bytes.
    pub threshold_min_bytes: u64,
    /// How long a caller waits for the threshold (or completion).
    pub session_timeout_secs: u64,
    /// Temp files older than this are removed by the sweeper.
    pub retention_secs: u64,
    /// Interval between orphan sweeps.
    pub sweep_interval_secs: u64,
    /// Grace period between SIGTERM and a forced kill.
    pub kill_grace_millis: u64,
    /// Number of stderr lines retained per transcoder process.
    pub stderr_tail_lines: usize,
    pub encode: EncodeSettings,
    pub tools: ToolsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("seedcast"),
            max_concurrent_downloads: 3,
            threshold_min_bytes: 15 * MIB,
            session_timeout_secs: 120,
            retention_secs: 6 * 60 * 60,
            sweep_interval_secs: 15 * 60,
            kill_grace_millis: 2_000,
            stderr_tail_lines: 64,
            encode: EncodeSettings::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Early-start threshold for a download of `declared_size` bytes.
    ///
    /// `min(threshold_min_bytes, floor(declared_size / 10))`, never below one
    /// byte. An unknown size (0) falls back to `threshold_min_bytes`.
    pub fn threshold_for(&self, declared_size: u64) -> u64 {
        let min_bytes = self.threshold_min_bytes.max(1);
        if declared_size == 0 {
            return min_bytes;
        }
        min_bytes.min(declared_size / 10).max(1)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.threshold_min_bytes == 0 {
            warnings.push("threshold_min_bytes is 0; transcoding starts on the first byte".into());
        }
        if self.retention_secs < self.sweep_interval_secs {
            warnings.push(format!(
                "retention_secs ({}) is shorter than sweep_interval_secs ({}); files may live up to one interval past retention",
                self.retention_secs, self.sweep_interval_secs
            ));
        }
        if self.retention_secs < self.session_timeout_secs {
            warnings.push(
                "retention_secs is shorter than session_timeout_secs; the sweeper may remove files of live sessions".into(),
            );
        }
        if self.stderr_tail_lines == 0 {
            warnings.push("stderr_tail_lines is 0; transcoder diagnostics are discarded".into());
        }
        if !self.encode.follow_growing_input {
            warnings.push(
                "encode.follow_growing_input is disabled; the transcoder stops at the first end-of-file".into(),
            );
        } else if self.encode.read_timeout_secs == 0 {
            warnings.push(
                "encode.read_timeout_secs is 0; a followed transcode only ends when terminated".into(),
            );
        }

        warnings
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate_strict(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Validation(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Validation(
                "sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.session_timeout_secs == 0 {
            return Err(Error::Validation(
                "session_timeout_secs must be at least 1".into(),
            ));
        }
        if self.encode.max_width == 0 || self.encode.max_height == 0 {
            return Err(Error::Validation(
                "encode.max_width and encode.max_height must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoder settings
// ---------------------------------------------------------------------------

/// Settings rendered into the transcoder argument list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    /// Output width bound for the full re-encode.
    pub max_width: u32,
    /// Output height bound for the full re-encode.
    pub max_height: u32,
    pub video_crf: u32,
    pub video_preset: String,
    /// Bitrate cap for the full re-encode (ffmpeg notation, e.g. `6M`).
    pub max_video_bitrate: String,
    pub audio_bitrate: String,
    /// Keep reading past end-of-file while the download is still appending.
    pub follow_growing_input: bool,
    /// Seconds without new input before the transcoder gives up on a
    /// followed file.
    ///
    /// A followed file never reports end-of-file, so this is also how long
    /// the transcoder idles after the download finishes before it flushes
    /// and exits. Lower values end streams sooner but cut off a peer that
    /// stalls for longer than this. 0 disables the timeout, and a followed
    /// stream then never ends on its own.
    pub read_timeout_secs: u64,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            video_crf: 23,
            video_preset: "veryfast".into(),
            max_video_bitrate: "6M".into(),
            audio_bitrate: "192k".into(),
            follow_growing_input: true,
            read_timeout_secs: 10,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_concurrent_downloads, 3);
        assert_eq!(cfg.threshold_min_bytes, 15 * MIB);
        assert_eq!(cfg.encode.max_width, 1920);
        assert_eq!(cfg.encode.video_preset, "veryfast");
        assert!(cfg.encode.follow_growing_input);
        assert_eq!(cfg.encode.read_timeout_secs, 10);
        assert!(cfg.tools.ffmpeg_path.is_none());
        assert!(cfg.temp_dir.ends_with("seedcast"));
    }

    #[test]
    fn default_config_no_warnings() {
        let cfg = PipelineConfig::default();
        let warnings = cfg.validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        assert!(cfg.validate_strict().is_ok());
    }

    #[test]
    fn threshold_is_ten_percent_below_minimum() {
        let cfg = PipelineConfig {
            threshold_min_bytes: 15 * MIB,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.threshold_for(100 * MIB), 10 * MIB);
        assert_eq!(cfg.threshold_for(5 * MIB), MIB / 2);
    }

    #[test]
    fn threshold_is_capped_by_minimum() {
        let cfg = PipelineConfig {
            threshold_min_bytes: 15 * MIB,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.threshold_for(10 * 1024 * MIB), 15 * MIB);
    }

    #[test]
    fn threshold_never_zero() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.threshold_for(5), 1);
        assert_eq!(cfg.threshold_for(0), cfg.threshold_min_bytes);

        let zero_min = PipelineConfig {
            threshold_min_bytes: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(zero_min.threshold_for(1_000), 1);
    }

    #[test]
    fn threshold_is_monotonic_in_size() {
        let cfg = PipelineConfig::default();
        let mut last = 0;
        for size in [1u64, 10, 1_000, MIB, 50 * MIB, 150 * MIB, 10 * 1024 * MIB] {
            let t = cfg.threshold_for(size);
            assert!(t >= last, "threshold decreased at size {size}");
            last = t;
        }
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = PipelineConfig {
            max_concurrent_downloads: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate_strict(), Err(Error::Validation(_))));
    }

    #[test]
    fn short_retention_warns() {
        let cfg = PipelineConfig {
            retention_secs: 10,
            ..PipelineConfig::default()
        };
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("sweep_interval_secs")));
        assert!(warnings.iter().any(|w| w.contains("session_timeout_secs")));
    }

    #[test]
    fn unbounded_follow_warns() {
        let mut cfg = PipelineConfig::default();
        cfg.encode.read_timeout_secs = 0;
        assert!(cfg.validate().iter().any(|w| w.contains("read_timeout_secs")));

        cfg.encode.follow_growing_input = false;
        assert!(!cfg.validate().iter().any(|w| w.contains("read_timeout_secs")));
    }

    #[test]
    fn parse_partial_json_uses_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"max_concurrent_downloads": 5, "encode": {"max_height": 720}}"#)
                .unwrap();
        assert_eq!(cfg.max_concurrent_downloads, 5);
        assert_eq!(cfg.encode.max_height, 720);
        assert_eq!(cfg.encode.max_width, 1920);
        assert_eq!(cfg.sweep_interval_secs, 15 * 60);
    }
}
