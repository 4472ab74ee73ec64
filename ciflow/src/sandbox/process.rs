//! Child process supervision shared by every execution context.

use super::env::StepEnvironment;
use crate::cancellation::CancellationToken;
use crate::errors::CiflowError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of output kept for error messages.
const TAIL_LINES: usize = 20;

/// How long output readers may keep draining after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A command to run inside an execution context.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    /// Label used in logs, e.g. `stage/step`.
    pub label: &'a str,
    /// Shell script passed to `sh -c`.
    pub script: &'a str,
    /// The step's complete environment.
    pub env: &'a StepEnvironment,
    /// Working directory relative to the context root.
    pub workdir: Option<&'a Path>,
    /// Bound on the command.
    pub timeout: Duration,
    /// Interrupts the command when fired.
    pub cancel: &'a CancellationToken,
    /// Log output at debug level instead of info.
    pub quiet: bool,
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The process exited with this code.
    Exited(i32),
    /// The process was killed after exceeding its timeout.
    TimedOut,
    /// The process was killed because the run was cancelled.
    Cancelled,
}

/// Result of one command.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// How the command ended.
    pub status: ExecStatus,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Last lines of combined output.
    pub tail: Vec<String>,
}

impl ExecOutcome {
    /// Returns true if the command exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == ExecStatus::Exited(0)
    }

    /// The exit code, if the process exited on its own.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExecStatus::Exited(code) => Some(code),
            ExecStatus::TimedOut | ExecStatus::Cancelled => None,
        }
    }

    /// Duration in milliseconds, for events.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Shell exit code convention for signal deaths.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

type Tail = Arc<Mutex<VecDeque<String>>>;

fn pump<R>(reader: R, label: String, tail: Tail, quiet: bool, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if quiet {
                        debug!(target: "ciflow::step", step = %label, stream, "{}", line);
                    } else {
                        info!(target: "ciflow::step", step = %label, stream, "{}", line);
                    }
                    let mut tail = tail.lock();
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(step = %label, error = %e, "Stopped reading {}", stream);
                    break;
                }
            }
        }
    })
}

async fn kill(child: &mut Child, label: &str) {
    if let Err(e) = child.kill().await {
        warn!(step = %label, error = %e, "Failed to kill child process");
    }
}

/// Spawns `cmd` and supervises it until exit, timeout or cancellation.
///
/// The caller configures program, arguments, environment and working
/// directory; stdio and kill-on-drop are set here.
pub(crate) async fn run_child(
    mut cmd: Command,
    request: &ExecRequest<'_>,
    context: &str,
) -> Result<ExecOutcome, CiflowError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if request.cancel.is_cancelled() {
        return Ok(ExecOutcome {
            status: ExecStatus::Cancelled,
            duration: Duration::ZERO,
            tail: Vec::new(),
        });
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| CiflowError::context(context, format!("failed to spawn '{}': {e}", request.label)))?;

    let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(pump(out, request.label.to_string(), tail.clone(), request.quiet, "stdout"));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(pump(err, request.label.to_string(), tail.clone(), request.quiet, "stderr"));
    }

    let status = tokio::select! {
        waited = child.wait() => match waited {
            Ok(status) => ExecStatus::Exited(exit_code_of(status)),
            Err(e) => {
                for reader in &readers {
                    reader.abort();
                }
                return Err(CiflowError::context(context, format!("waiting on '{}' failed: {e}", request.label)));
            }
        },
        () = tokio::time::sleep(request.timeout) => {
            warn!(step = %request.label, timeout_secs = request.timeout.as_secs(), "Step timed out, killing it");
            kill(&mut child, request.label).await;
            ExecStatus::TimedOut
        }
        () = request.cancel.cancelled() => {
            warn!(step = %request.label, "Run cancelled, killing step");
            kill(&mut child, request.label).await;
            ExecStatus::Cancelled
        }
    };

    // Background grandchildren can hold the pipes open; don't wait on them forever.
    for mut reader in readers {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let tail = tail.lock().iter().cloned().collect();
    Ok(ExecOutcome {
        status,
        duration: started.elapsed(),
        tail,
    })
}
