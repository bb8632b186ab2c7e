//! Daemon process supervision.
//!
//! A [`DaemonExecutor`] launches the daemon and hands back a future that runs
//! it to completion; the [`ProcessSupervisor`] owns the cancellation side of
//! that future and decides whether a launch is needed at all.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::BoxFuture;

/// Errors from launching or running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("daemon exited with {0}")]
    Exited(ExitStatus),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can launch the daemon.
///
/// `launch` must start the process before returning, so that launch failures
/// surface synchronously. The returned future runs until the process exits
/// or `cancel` fires (or its sender is dropped), at which point it must stop
/// the process.
pub trait DaemonExecutor: Send + Sync {
    /// Human-readable name (e.g. "binary", "fake").
    fn name(&self) -> &str;

    fn launch(
        &self,
        args: Vec<String>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<BoxFuture<'static, Result<(), ProcessError>>, ProcessError>;
}

/// Runs the daemon executable as a child process.
///
/// Its stdout and stderr are forwarded line by line to `tracing` at debug
/// level under the `onionkeeper::daemon` target.
#[derive(Debug, Clone)]
pub struct DaemonBinary {
    program: String,
}

impl DaemonBinary {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl DaemonExecutor for DaemonBinary {
    fn name(&self) -> &str {
        "binary"
    }

    fn launch(
        &self,
        args: Vec<String>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<BoxFuture<'static, Result<(), ProcessError>>, ProcessError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        info!(program = %self.program, pid = ?child.id(), "Daemon launched");
        forward_output(child.stdout.take(), "stdout");
        forward_output(child.stderr.take(), "stderr");

        Ok(Box::pin(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel => None,
            };
            match exited {
                Some(status) => {
                    let status = status?;
                    if status.success() {
                        Ok(())
                    } else {
                        Err(ProcessError::Exited(status))
                    }
                }
                None => {
                    debug!("Stopping daemon");
                    child.kill().await?;
                    Ok(())
                }
            }
        }))
    }
}

fn forward_output<R>(stream: Option<R>, stream_name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "onionkeeper::daemon", stream = stream_name, "{line}");
        }
    });
}

struct RunningDaemon {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Launches the daemon at most once and stops it on request.
pub struct ProcessSupervisor {
    executor: Arc<dyn DaemonExecutor>,
    lock_file: PathBuf,
    running: Option<RunningDaemon>,
}

impl ProcessSupervisor {
    /// `lock_file` is the file the daemon holds in its data directory while
    /// it runs.
    pub fn new(executor: Arc<dyn DaemonExecutor>, lock_file: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            lock_file: lock_file.into(),
            running: None,
        }
    }

    /// Launch the daemon with `args` unless it is already running.
    ///
    /// Returns `Ok(false)` when nothing was launched. A context left over from
    /// a daemon that no longer holds its lock file is cancelled first.
    pub fn start(&mut self, args: Vec<String>) -> Result<bool, ProcessError> {
        if self.is_running() {
            debug!(executor = self.executor.name(), "Daemon already running");
            return Ok(false);
        }
        if self.stop() {
            debug!("Cancelled stale daemon context");
        }

        let (cancel, cancelled) = oneshot::channel();
        let run = self.executor.launch(args, cancelled)?;
        let task = tokio::spawn(async move {
            match run.await {
                Ok(()) => info!("Daemon stopped"),
                Err(e) => warn!(error = %e, "Daemon terminated abnormally"),
            }
        });
        self.running = Some(RunningDaemon { cancel, task });
        Ok(true)
    }

    /// Cancel the running daemon and hand back its task, which finishes once
    /// the process has exited. `None` if there was no daemon.
    pub fn cancel(&mut self) -> Option<JoinHandle<()>> {
        let daemon = self.running.take()?;
        // The task may already have finished.
        let _ = daemon.cancel.send(());
        Some(daemon.task)
    }

    /// Cancel the running daemon without waiting for it. Returns `false` if
    /// there was none.
    pub fn stop(&mut self) -> bool {
        self.cancel().is_some()
    }

    /// Whether a launched daemon's future is still running.
    pub fn is_active(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|daemon| !daemon.task.is_finished())
    }

    /// Whether the daemon is active and holds its lock file.
    pub fn is_running(&self) -> bool {
        self.is_active() && self.lock_file.exists()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
