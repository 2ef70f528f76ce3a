//! Spawning and supervising the transcoder process.
//!
//! [`ProcessRunner::run`] starts the transcoder against a file path and hands
//! back its stdout. A supervisor task owns the child: it waits for exit or for
//! the cancellation token, keeps a bounded stderr tail, and reports a single
//! [`ProcessOutcome`] through [`ProcessExit`].

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use seedcast_core::Variant;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::invoker::TranscodeInvoker;
use crate::stderr::{self, StderrTail};

/// Default wait between SIGTERM and a forced kill.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Default number of retained stderr lines.
const DEFAULT_TAIL_LINES: usize = 64;

/// How long to wait for stderr to hit EOF after the child is gone.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// How a transcoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited with status 0.
    Success,
    /// Exited unsuccessfully. `code` is `None` when a signal we did not send
    /// ended the process.
    Failed { code: Option<i32> },
    /// Ended because termination was requested.
    Terminated,
    /// The exit status could not be collected.
    WaitError(String),
}

impl ExitKind {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ExitKind::Success
        } else {
            ExitKind::Failed {
                code: status.code(),
            }
        }
    }
}

/// Terminal report of one transcoder run.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub kind: ExitKind,
    /// Most recent stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
    pub runtime: Duration,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        self.kind == ExitKind::Success
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.kind {
            ExitKind::Success => Some(0),
            ExitKind::Failed { code } => code,
            _ => None,
        }
    }
}

/// Resolves once the supervised process has ended.
#[derive(Debug)]
pub struct ProcessExit {
    rx: oneshot::Receiver<ProcessOutcome>,
}

impl ProcessExit {
    pub async fn wait(self) -> ProcessOutcome {
        self.rx.await.unwrap_or_else(|_| ProcessOutcome {
            kind: ExitKind::WaitError("supervisor task ended without a report".into()),
            stderr_tail: Vec::new(),
            runtime: Duration::ZERO,
        })
    }
}

/// A started transcoder.
#[derive(Debug)]
pub struct RunningProcess {
    stdout: ChildStdout,
    exit: ProcessExit,
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop. Calling this after exit is a no-op.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn into_parts(self) -> (ChildStdout, ProcessExit, CancellationToken) {
        (self.stdout, self.exit, self.cancel)
    }
}

/// Spawns transcoder processes built by a [`TranscodeInvoker`].
#[derive(Clone)]
pub struct ProcessRunner {
    invoker: Arc<dyn TranscodeInvoker>,
    kill_grace: Duration,
    tail_lines: usize,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("kill_grace", &self.kill_grace)
            .field("tail_lines", &self.tail_lines)
            .finish_non_exhaustive()
    }
}

impl ProcessRunner {
    pub fn new(invoker: Arc<dyn TranscodeInvoker>) -> Self {
        Self {
            invoker,
            kill_grace: DEFAULT_KILL_GRACE,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Builder: set the wait between SIGTERM and a forced kill.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Builder: set how many stderr lines are retained.
    pub fn with_stderr_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    /// Start the transcoder for `input`.
    ///
    /// Cancelling `cancel` (or calling [`RunningProcess::terminate`]) stops
    /// the process: SIGTERM first, then a forced kill after the grace period.
    ///
    /// # Errors
    ///
    /// Returns [`seedcast_core::Error::Spawn`] if the process cannot start.
    pub fn run(
        &self,
        input: &Path,
        variant: Variant,
        cancel: CancellationToken,
    ) -> seedcast_core::Result<RunningProcess> {
        let cmd = self.invoker.command(input, variant);
        let tool = cmd.program_name();
        tracing::debug!(%variant, input = %input.display(), args = ?cmd.get_args(), "Spawning {tool}");

        let mut child = cmd.spawn_piped()?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| seedcast_core::Error::spawn(tool.clone(), "stdout was not captured"))?;
        let stderr = child.stderr.take();

        tracing::info!(%variant, pid = ?pid, input = %input.display(), "Started {tool}");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(supervise(Supervised {
            child,
            stderr,
            cancel: cancel.clone(),
            grace: self.kill_grace,
            tail_lines: self.tail_lines,
            tool,
            started: Instant::now(),
            tx,
        }));

        Ok(RunningProcess {
            stdout,
            exit: ProcessExit { rx },
            cancel,
            pid,
        })
    }
}

struct Supervised {
    child: Child,
    stderr: Option<ChildStderr>,
    cancel: CancellationToken,
    grace: Duration,
    tail_lines: usize,
    tool: String,
    started: Instant,
    tx: oneshot::Sender<ProcessOutcome>,
}

async fn supervise(job: Supervised) {
    let Supervised {
        mut child,
        stderr,
        cancel,
        grace,
        tail_lines,
        tool,
        started,
        tx,
    } = job;

    let tail = Arc::new(Mutex::new(StderrTail::new(tail_lines)));
    let stderr_task = stderr.map(|s| tokio::spawn(stderr::collect(s, Arc::clone(&tail))));

    let kind = tokio::select! {
        res = child.wait() => match res {
            Ok(status) => ExitKind::from_status(status),
            Err(e) => ExitKind::WaitError(e.to_string()),
        },
        _ = cancel.cancelled() => {
            terminate(&mut child, grace, &tool).await;
            ExitKind::Terminated
        }
    };

    if let Some(task) = stderr_task {
        if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
            tracing::debug!("{tool}: stderr still open after exit; keeping partial tail");
        }
    }

    let outcome = ProcessOutcome {
        kind,
        stderr_tail: tail.lock().lines(),
        runtime: started.elapsed(),
    };

    match &outcome.kind {
        ExitKind::Success => {
            tracing::info!(runtime_ms = outcome.runtime.as_millis() as u64, "{tool} finished");
        }
        ExitKind::Failed { code: Some(code) } => {
            // Partial output may already be in the consumer's hands, so a
            // failed exit is reported, not raised.
            tracing::warn!(
                code = *code,
                stderr = %outcome.stderr_tail.join("\n"),
                "{tool} exited with non-zero status"
            );
        }
        ExitKind::Failed { code: None } => {
            tracing::info!("{tool} was ended by a signal");
        }
        ExitKind::Terminated => {
            tracing::info!(runtime_ms = outcome.runtime.as_millis() as u64, "{tool} terminated on request");
        }
        ExitKind::WaitError(e) => {
            tracing::warn!("{tool}: failed to collect exit status: {e}");
        }
    }

    let _ = tx.send(outcome);
}

/// SIGTERM, wait up to `grace`, then kill.
async fn terminate(child: &mut Child, grace: Duration, tool: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                        return;
                    }
                    tracing::debug!("{tool} ignored SIGTERM for {grace:?}; killing");
                }
                Err(e) => tracing::debug!("{tool}: SIGTERM failed: {e}"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        tracing::debug!("{tool}: kill failed: {e}");
    }
}
