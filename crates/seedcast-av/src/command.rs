//! Builder for external tool commands.
//!
//! One builder serves both ways a tool is run: [`ToolCommand::execute`] for
//! short captured invocations with a timeout, and [`ToolCommand::spawn_piped`]
//! for long-running children whose stdout is consumed as a stream.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};

/// Default command timeout for captured executions: 30 seconds.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a captured run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// stdout, decoded lossily.
    pub stdout: String,
    /// stderr, decoded lossily.
    pub stderr: String,
}

/// Program path plus argument list for ffmpeg or a stand-in.
///
/// ```no_run
/// use seedcast_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn version() -> seedcast_core::Result<()> {
/// let version = ToolCommand::new(PathBuf::from("ffmpeg"))
///     .arg("-version")
///     .execute()
///     .await?;
/// assert!(version.stdout.starts_with("ffmpeg"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.args.push(arg.into());
        }
        self
    }

    /// Upper bound for [`execute`](Self::execute). Piped children are not
    /// subject to it.
    pub fn timeout(&mut self, limit: Duration) -> &mut Self {
        self.timeout = limit;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Short program name for logs and errors (`/usr/bin/ffmpeg` -> `ffmpeg`).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run to completion and capture both output streams.
    ///
    /// # Errors
    ///
    /// - [`seedcast_core::Error::Spawn`] if the process cannot be started.
    /// - [`seedcast_core::Error::Tool`] on timeout (the child is killed), on
    ///   an I/O error while waiting, or on a non-zero exit (message includes
    ///   stderr).
    pub async fn execute(&self) -> seedcast_core::Result<ToolOutput> {
        let tool = self.program_name();
        let child = self
            .build()
            .spawn()
            .map_err(|e| seedcast_core::Error::spawn(tool.clone(), e.to_string()))?;

        // On timeout the child is dropped with the future; kill_on_drop reaps it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(seedcast_core::Error::tool(tool, format!("wait failed: {e}")));
            }
            Err(_) => {
                return Err(seedcast_core::Error::tool(
                    tool,
                    format!("timed out after {:?}", self.timeout),
                ));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(seedcast_core::Error::tool(
                tool,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    /// Start a long-running child. stdin is null; stdout and stderr are
    /// piped for the caller to take.
    ///
    /// The child is killed if its handle is dropped.
    pub fn spawn_piped(&self) -> seedcast_core::Result<Child> {
        self.build()
            .spawn()
            .map_err(|e| seedcast_core::Error::spawn(self.program_name(), e.to_string()))
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
