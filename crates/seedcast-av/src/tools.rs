//! Locating the transcoder binary.
//!
//! ffmpeg is the only external tool. [`ToolRegistry::discover`] resolves it
//! once at startup, preferring the configured path over `PATH`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use seedcast_core::config::ToolsConfig;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;

pub const FFMPEG: &str = "ffmpeg";

/// `-version` must answer within this.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// A resolved executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub path: PathBuf,
}

/// Availability report from [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    ffmpeg: Option<ToolConfig>,
}

impl ToolRegistry {
    /// Resolve ffmpeg. A configured path that does not exist is reported
    /// and `PATH` is searched instead; a tool found nowhere is left unset.
    pub fn discover(config: &ToolsConfig) -> Self {
        let path = match config.ffmpeg_path.as_deref() {
            Some(p) if p.exists() => Some(p.to_path_buf()),
            Some(p) => {
                tracing::warn!(
                    configured = %p.display(),
                    "Configured {FFMPEG} does not exist; searching PATH"
                );
                which::which(FFMPEG).ok()
            }
            None => which::which(FFMPEG).ok(),
        };
        match &path {
            Some(p) => tracing::debug!(path = %p.display(), "Using {FFMPEG}"),
            None => tracing::debug!("{FFMPEG} not found"),
        }

        Self {
            ffmpeg: path.map(|path| ToolConfig {
                name: FFMPEG.to_string(),
                path,
            }),
        }
    }

    /// Use ffmpeg at `path` without looking for it.
    pub fn with_ffmpeg(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg = Some(ToolConfig {
            name: FFMPEG.to_string(),
            path: path.into(),
        });
        self
    }

    /// # Errors
    ///
    /// [`seedcast_core::Error::Tool`] when `name` is unknown or was not found.
    pub fn require(&self, name: &str) -> seedcast_core::Result<&ToolConfig> {
        let found = match name {
            FFMPEG => self.ffmpeg.as_ref(),
            _ => None,
        };
        found.ok_or_else(|| {
            seedcast_core::Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    pub async fn check_all(&self) -> Vec<ToolInfo> {
        let info = match &self.ffmpeg {
            Some(tool) => ToolInfo {
                name: tool.name.clone(),
                available: true,
                version: version_line(&tool.path).await,
                path: Some(tool.path.clone()),
            },
            None => ToolInfo {
                name: FFMPEG.to_string(),
                available: false,
                version: None,
                path: None,
            },
        };
        vec![info]
    }
}

async fn version_line(path: &Path) -> Option<String> {
    let out = ToolCommand::new(path.to_path_buf())
        .arg("-version")
        .timeout(VERSION_TIMEOUT)
        .execute()
        .await
        .ok()?;
    out.stdout.lines().next().map(str::to_owned)
}
