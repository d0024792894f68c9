//! Child process execution with a timeout and bounded output capture.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::TaskResult;

/// Maximum characters of stdout/stderr kept in a task result.
pub const MAX_OUTPUT_CHARS: usize = 10_000;

/// Per-stream cap on bytes read from a child. Exceeding it kills the child.
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Truncates to at most [`MAX_OUTPUT_CHARS`] characters.
pub fn truncate_output(s: &str) -> String {
    match s.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => s[..cut].to_string(),
        None => s.to_string(),
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub(crate) struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub max_capture: usize,
}

impl ProcessSpec {
    /// `sh -c <script>`.
    pub fn shell(script: &str, timeout: Duration, max_capture: usize) -> Self {
        ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            envs: Vec::new(),
            stdin: None,
            timeout,
            max_capture,
        }
    }

    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process run ended.
///
/// Every variant that got as far as reading output carries whatever was
/// captured, so a killed process still leaves a diagnostic.
#[derive(Debug)]
pub(crate) enum ProcessOutcome {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        stdout: String,
        stderr: String,
    },
    OutputLimit {
        stream: &'static str,
        stdout: String,
        stderr: String,
    },
    SpawnFailed(io::Error),
    Io(io::Error),
}

impl ProcessOutcome {
    /// Converts to a result with output truncated for storage.
    pub fn into_task_result(self, spec: &ProcessSpec) -> TaskResult {
        match self {
            ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
            } => {
                let stdout = truncate_output(&stdout);
                let stderr = truncate_output(&stderr);
                if status.success() {
                    TaskResult::Success {
                        output: None,
                        stdout,
                        stderr,
                        exit_code: status.code(),
                    }
                } else {
                    let error = match status.code() {
                        Some(code) => format!("command exited with code {code}"),
                        None => "command terminated by signal".to_string(),
                    };
                    TaskResult::Failure {
                        error,
                        stdout,
                        stderr,
                        exit_code: status.code(),
                        timed_out: false,
                    }
                }
            }
            ProcessOutcome::TimedOut { stdout, stderr } => TaskResult::Failure {
                error: format!("command timed out after {}s", spec.timeout.as_secs_f64()),
                stdout: truncate_output(&stdout),
                stderr: truncate_output(&stderr),
                exit_code: None,
                timed_out: true,
            },
            ProcessOutcome::OutputLimit {
                stream,
                stdout,
                stderr,
            } => TaskResult::Failure {
                error: format!(
                    "{stream} exceeded {} bytes; process killed",
                    spec.max_capture
                ),
                stdout: truncate_output(&stdout),
                stderr: truncate_output(&stderr),
                exit_code: None,
                timed_out: false,
            },
            ProcessOutcome::SpawnFailed(e) => {
                TaskResult::failure(format!("failed to start {}: {e}", spec.program))
            }
            ProcessOutcome::Io(e) => TaskResult::failure(format!("I/O error: {e}")),
        }
    }
}

enum CaptureError {
    Io(io::Error),
    Limit(&'static str),
}

/// Reads `reader` to EOF into `buf`, keeping at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    buf: &mut Vec<u8>,
    limit: usize,
    stream: &'static str,
) -> Result<(), CaptureError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await.map_err(CaptureError::Io)?;
        if n == 0 {
            return Ok(());
        }
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            return Err(CaptureError::Limit(stream));
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Kills the child and everything it started.
///
/// The child leads its own process group, so signalling the group reaches
/// grandchildren (`npm` spawning `node`, a backgrounded `sleep`) that would
/// otherwise outlive the task.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pgid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            debug!(pgid, error = %e, "Failed to signal process group");
        }
    }
    // Reaps the direct child; also the only kill available off unix.
    let _ = child.kill().await;
}

/// Runs a process to completion or until it is killed.
pub(crate) async fn run(spec: &ProcessSpec) -> ProcessOutcome {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessOutcome::SpawnFailed(e),
    };
    debug!(command = %spec.describe(), pid = ?child.id(), "Spawned process");

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.stdin.clone()) {
        tokio::spawn(async move {
            // The child may exit without reading; a broken pipe is fine.
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        kill_process_tree(&mut child).await;
        return ProcessOutcome::Io(io::Error::other("child pipes unavailable"));
    };

    let limit = spec.max_capture;
    let mut out = Vec::new();
    let mut err = Vec::new();
    let outcome = tokio::time::timeout(spec.timeout, async {
        tokio::try_join!(
            read_capped(stdout, &mut out, limit, "stdout"),
            read_capped(stderr, &mut err, limit, "stderr"),
        )?;
        child.wait().await.map_err(CaptureError::Io)
    })
    .await;

    match outcome {
        Ok(Ok(status)) => ProcessOutcome::Exited {
            status,
            stdout: lossy(&out),
            stderr: lossy(&err),
        },
        Ok(Err(CaptureError::Limit(stream))) => {
            warn!(command = %spec.describe(), stream, "Output limit exceeded, killing process");
            kill_process_tree(&mut child).await;
            ProcessOutcome::OutputLimit {
                stream,
                stdout: lossy(&out),
                stderr: lossy(&err),
            }
        }
        Ok(Err(CaptureError::Io(e))) => {
            kill_process_tree(&mut child).await;
            ProcessOutcome::Io(e)
        }
        Err(_) => {
            warn!(
                command = %spec.describe(),
                timeout_secs = spec.timeout.as_secs(),
                "Process timed out, killing"
            );
            kill_process_tree(&mut child).await;
            ProcessOutcome::TimedOut {
                stdout: lossy(&out),
                stderr: lossy(&err),
            }
        }
    }
}
