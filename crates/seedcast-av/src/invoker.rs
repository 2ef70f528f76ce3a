//! The transcoder argument contract.
//!
//! Both variants read a named file (container metadata needs random access,
//! so stdin is not an option) and write fragmented MP4 to stdout so the
//! consumer can start reading before the input is complete.

use std::path::{Path, PathBuf};

use seedcast_core::config::EncodeSettings;
use seedcast_core::Variant;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Builds the command that transcodes `input` for a pipeline variant.
pub trait TranscodeInvoker: Send + Sync {
    fn command(&self, input: &Path, variant: Variant) -> ToolCommand;
}

/// ffmpeg implementation of [`TranscodeInvoker`].
#[derive(Debug, Clone)]
pub struct FfmpegInvoker {
    ffmpeg: PathBuf,
    settings: EncodeSettings,
}

impl FfmpegInvoker {
    pub fn new(ffmpeg: PathBuf, settings: EncodeSettings) -> Self {
        Self { ffmpeg, settings }
    }

    /// Build an invoker from the ffmpeg found by the registry.
    pub fn from_registry(
        tools: &ToolRegistry,
        settings: EncodeSettings,
    ) -> seedcast_core::Result<Self> {
        let ffmpeg = tools.require("ffmpeg")?;
        Ok(Self::new(ffmpeg.path.clone(), settings))
    }

    fn input_args(&self, cmd: &mut ToolCommand, input: &Path) {
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "warning"]);
        // Tolerate truncated and corrupt reads, and synthesize timestamps
        // across the gaps they leave.
        cmd.args(["-fflags", "+genpts+discardcorrupt", "-err_detect", "ignore_err"]);
        if self.settings.follow_growing_input {
            // File protocol options; must precede -i. With -follow the input
            // never hits EOF, so -rw_timeout is what ends the read.
            let rw_timeout_us = self.settings.read_timeout_secs.saturating_mul(1_000_000);
            cmd.args(["-follow", "1", "-rw_timeout"]);
            cmd.arg(rw_timeout_us.to_string());
        }
        cmd.arg("-i");
        cmd.arg(format!("file:{}", input.to_string_lossy()));
    }

    fn full_args(&self, cmd: &mut ToolCommand) {
        let s = &self.settings;
        cmd.args(["-map", "0:v:0", "-map", "0:a:0?"]);
        cmd.args(["-c:v", "libx264", "-profile:v", "high", "-pix_fmt", "yuv420p"]);
        cmd.args(["-preset", &s.video_preset]);
        cmd.args(["-crf", &s.video_crf.to_string()]);
        cmd.args(["-maxrate", &s.max_video_bitrate, "-bufsize", &s.max_video_bitrate]);
        cmd.arg("-vf");
        cmd.arg(format!(
            "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
            s.max_width, s.max_height
        ));
        cmd.args(["-c:a", "aac", "-b:a", &s.audio_bitrate, "-ac", "2"]);
    }

    fn audio_remux_args(&self, cmd: &mut ToolCommand) {
        cmd.args(["-map", "0:v:0", "-map", "0:a:0"]);
        cmd.args(["-c:v", "copy"]);
        cmd.args(["-c:a", "aac", "-b:a", &self.settings.audio_bitrate, "-ac", "2"]);
    }

    fn output_args(&self, cmd: &mut ToolCommand) {
        cmd.args(["-avoid_negative_ts", "make_zero", "-max_muxing_queue_size", "1024"]);
        cmd.args(["-movflags", "frag_keyframe+empty_moov+default_base_moof"]);
        cmd.args(["-f", "mp4", "pipe:1"]);
    }
}

impl TranscodeInvoker for FfmpegInvoker {
    fn command(&self, input: &Path, variant: Variant) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        self.input_args(&mut cmd, input);
        match variant {
            Variant::Full => self.full_args(&mut cmd),
            Variant::AudioRemux => self.audio_remux_args(&mut cmd),
        }
        self.output_args(&mut cmd);
        cmd
    }
}
