//! Supervised extractor runs.
//!
//! One call to [`ProcessSupervisor::run`] spawns one child, captures its output
//! into bounded buffers, and returns exactly one [`ProcessOutcome`]. When the
//! deadline passes, the child's process group gets SIGTERM and, after the
//! grace window, SIGKILL.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::extractor::ExtractorCommand;

/// Per-stream capture cap.
pub const OUTPUT_CAPTURE_LIMIT: usize = 100 * 1024 * 1024;
/// Time between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for pipe readers after the child is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;

/// Result of one supervised run.
#[derive(Debug)]
pub enum ProcessOutcome {
    Success {
        stdout: String,
        stderr: String,
    },
    Failure {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        elapsed: Duration,
    },
    SpawnFailed(std::io::Error),
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Success { .. } => "success",
            ProcessOutcome::Failure { .. } => "failure",
            ProcessOutcome::TimedOut { .. } => "timed_out",
            ProcessOutcome::SpawnFailed(_) => "spawn_failed",
        }
    }
}

/// Bounded output buffer; bytes past the limit are counted, not stored.
#[derive(Debug, Default)]
struct BoundedCapture {
    buf: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl BoundedCapture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += (chunk.len() - take) as u64;
    }
}

type SharedCapture = Arc<Mutex<BoundedCapture>>;

/// Spawns and supervises extractor processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace: Duration,
    capture_limit: usize,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(TERMINATE_GRACE, OUTPUT_CAPTURE_LIMIT)
    }
}

impl ProcessSupervisor {
    pub fn new(grace: Duration, capture_limit: usize) -> Self {
        Self {
            grace,
            capture_limit,
        }
    }

    /// Run `cmd` until it exits or `deadline` passes.
    pub async fn run(&self, cmd: &ExtractorCommand, deadline: Instant) -> ProcessOutcome {
        let started = Instant::now();
        if started >= deadline {
            return ProcessOutcome::TimedOut {
                elapsed: Duration::ZERO,
            };
        }

        let mut command = Command::new(cmd.program());
        command
            .args(cmd.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    program = %cmd.program().display(),
                    error = %e,
                    "failed to spawn extractor"
                );
                return ProcessOutcome::SpawnFailed(e);
            }
        };
        let pid = child.id();
        tracing::debug!(pid = ?pid, "extractor spawned");

        let stdout = Arc::new(Mutex::new(BoundedCapture::new(self.capture_limit)));
        let stderr = Arc::new(Mutex::new(BoundedCapture::new(self.capture_limit)));
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_capture(out, "stdout", stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_capture(err, "stderr", stderr.clone()));
        }

        let waited = tokio::select! {
            biased;
            status = child.wait() => Some(status),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        let outcome = match waited {
            None => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    pid = ?pid,
                    elapsed_ms = %elapsed.as_millis(),
                    "extractor exceeded deadline; terminating"
                );
                self.terminate(&mut child, pid).await;
                drain_readers(readers).await;
                return ProcessOutcome::TimedOut { elapsed };
            }
            Some(Err(e)) => {
                tracing::error!(pid = ?pid, error = %e, "failed to wait for extractor");
                let _ = child.kill().await;
                drain_readers(readers).await;
                ProcessOutcome::Failure {
                    exit_code: None,
                    signal: None,
                    stdout: take_capture(&stdout, "stdout"),
                    stderr: format!("{}\nwait failed: {e}", take_capture(&stderr, "stderr")),
                }
            }
            Some(Ok(status)) => {
                drain_readers(readers).await;
                let stdout = take_capture(&stdout, "stdout");
                let stderr = take_capture(&stderr, "stderr");
                if status.success() {
                    ProcessOutcome::Success { stdout, stderr }
                } else {
                    ProcessOutcome::Failure {
                        exit_code: status.code(),
                        signal: exit_signal(&status),
                        stdout,
                        stderr,
                    }
                }
            }
        };
        tracing::debug!(
            pid = ?pid,
            outcome = outcome.label(),
            elapsed_ms = %started.elapsed().as_millis(),
            "extractor finished"
        );
        outcome
    }

    /// Graceful stop, escalating to a forced kill after the grace window.
    ///
    /// The group always gets SIGKILL at the end: the child may honour SIGTERM
    /// while a grandchild in its group ignores it.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        if !request_graceful_stop(child, pid) {
            let _ = child.start_kill();
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => {
                tracing::info!(pid = ?pid, "extractor stopped after SIGTERM");
                force_kill_group(pid);
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?pid,
                    grace_ms = %self.grace.as_millis(),
                    "extractor ignored SIGTERM; killing"
                );
                force_kill_group(pid);
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = ?pid, error = %e, "failed to kill extractor");
                }
            }
        }
    }
}

fn spawn_capture<R>(mut reader: R, stream: &'static str, capture: SharedCapture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = &chunk[..n];
                    for line in String::from_utf8_lossy(data)
                        .split(['\n', '\r'])
                        .map(str::trim_end)
                        .filter(|line| !line.is_empty())
                    {
                        tracing::debug!(stream, line, "extractor output");
                    }
                    if let Ok(mut guard) = capture.lock() {
                        guard.push(data);
                    }
                }
                Err(e) => {
                    tracing::warn!(stream, error = %e, "extractor pipe read failed");
                    break;
                }
            }
        }
    })
}

/// Wait briefly for pipe readers; a grandchild may hold a pipe open.
async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    for mut handle in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }
}

fn take_capture(capture: &SharedCapture, stream: &'static str) -> String {
    let Ok(mut guard) = capture.lock() else {
        return String::new();
    };
    if guard.dropped > 0 {
        tracing::warn!(
            stream,
            kept = guard.buf.len(),
            dropped = guard.dropped,
            "extractor output exceeded capture limit"
        );
    }
    String::from_utf8_lossy(&std::mem::take(&mut guard.buf)).into_owned()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()).filter(|pid| *pid > 0) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid = raw, signal = ?signal, error = %e, "signal delivery failed");
            false
        }
    }
}

#[cfg(unix)]
fn request_graceful_stop(_child: &mut Child, pid: Option<u32>) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(not(unix))]
fn request_graceful_stop(_child: &mut Child, _pid: Option<u32>) -> bool {
    false
}

#[cfg(unix)]
fn force_kill_group(pid: Option<u32>) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn force_kill_group(_pid: Option<u32>) {}
