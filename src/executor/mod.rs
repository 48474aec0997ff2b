//! Subprocess Executor. Launches whitelisted commands, streams output to a
//! progress sink, enforces timeouts, and classifies failures.
//!
//! Each child is made its own process-group leader on Unix so a timeout or
//! cancellation can SIGTERM the whole group, with a grace period before a
//! hard kill.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::model::{BackendId, ProgressChunk, ProgressSink};

const STDERR_TAIL_LIMIT: usize = 4096;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 8192;

/// Options for a single subprocess invocation.
pub struct ExecOptions {
    pub timeout: Duration,
    pub progress_sink: Option<ProgressSink>,
    pub working_dir: Option<String>,
    pub cancel: CancellationToken,
    /// `[id] ` prefix applied to every forwarded progress chunk during
    /// parallel fan-out; empty for single-backend calls.
    pub progress_tag: String,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            progress_sink: None,
            working_dir: None,
            cancel: CancellationToken::new(),
            progress_tag: String::new(),
        }
    }
}

/// Executes whitelisted subprocesses. The whitelist is fixed at
/// construction time from the registry's descriptors; no code path can
/// spawn a command absent from it.
pub struct SubprocessExecutor {
    whitelist: HashSet<String>,
}

impl SubprocessExecutor {
    pub fn new(whitelist: Vec<String>) -> Self {
        Self {
            whitelist: whitelist.into_iter().collect(),
        }
    }

    /// Run `command_name argv...` to completion, joining stdout chunks into
    /// one string. `argv` is passed to `Command::args` verbatim, never
    /// interpolated into a shell string.
    pub async fn run(
        &self,
        backend: &BackendId,
        command_name: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<String, OrchestratorError> {
        if !self.whitelist.contains(command_name) {
            return Err(OrchestratorError::UnsupportedBackend(backend.clone()));
        }

        let mut cmd = Command::new(command_name);
        cmd.args(argv);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: pre_exec runs in the forked child before exec; calling
            // setpgid(0, 0) here is async-signal-safe and makes the child
            // its own process-group leader so a later SIGTERM can target
            // the whole group rather than just the one pid.
            unsafe {
                cmd.pre_exec(|| {
                    nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                        .map_err(std::io::Error::from)
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| OrchestratorError::Transient {
                backend: backend.clone(),
                reason: format!("spawn failed: {err}"),
            })?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let mut out_buf: Vec<u8> = Vec::new();
        let mut err_buf: Vec<u8> = Vec::new();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick fires immediately

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        let run_result = 'read_loop: loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            tokio::select! {
                biased;

                _ = options.cancel.cancelled() => {
                    break 'read_loop Err(OrchestratorError::Cancelled);
                }

                _ = &mut deadline => {
                    break 'read_loop Err(OrchestratorError::Timeout(options.timeout));
                }

                read = stdout.read(&mut chunk) => {
                    match read {
                        Ok(0) => break 'read_loop Ok(()),
                        Ok(n) => {
                            out_buf.extend_from_slice(&chunk[..n]);
                            if let Some(sink) = &options.progress_sink {
                                sink(ProgressChunk {
                                    tag: options.progress_tag.clone(),
                                    bytes: chunk[..n].to_vec(),
                                    is_heartbeat: false,
                                    total_bytes_so_far: out_buf.len() as u64,
                                });
                            }
                        }
                        Err(err) => {
                            break 'read_loop Err(OrchestratorError::Transient {
                                backend: backend.clone(),
                                reason: format!("stdout read failed: {err}"),
                            });
                        }
                    }
                }

                stderr_read = stderr.read(&mut chunk), if err_buf.len() < STDERR_TAIL_LIMIT => {
                    if let Ok(n) = stderr_read {
                        if n > 0 {
                            err_buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(sink) = &options.progress_sink {
                        sink(ProgressChunk {
                            tag: options.progress_tag.clone(),
                            bytes: Vec::new(),
                            is_heartbeat: true,
                            total_bytes_so_far: out_buf.len() as u64,
                        });
                    }
                }
            }
        };

        if let Err(early_err) = run_result {
            terminate(&mut child).await;
            return Err(early_err);
        }

        let status = child
            .wait()
            .await
            .map_err(|err| OrchestratorError::Transient {
                backend: backend.clone(),
                reason: format!("wait failed: {err}"),
            })?;

        let stderr_tail = tail_utf8(&err_buf, STDERR_TAIL_LIMIT);

        if !status.success() {
            if let Some(reason) = classify_quota_exhaustion(&stderr_tail) {
                return Err(OrchestratorError::QuotaExceeded {
                    backend: backend.clone(),
                    reason,
                });
            }
            if let Some(reason) = classify_permission_denial(&stderr_tail) {
                return Err(OrchestratorError::PermissionError {
                    backend: backend.clone(),
                    reason,
                });
            }
            return Err(OrchestratorError::BackendFailure {
                backend: backend.clone(),
                exit_code: status.code(),
                stderr_tail,
            });
        }

        if out_buf.is_empty() {
            return Err(OrchestratorError::EmptyResponse);
        }

        Ok(String::from_utf8_lossy(&out_buf).into_owned())
    }
}

/// SIGTERM to the process group, a grace period, then a hard kill.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = nix::unistd::Pid::from_raw(-(pid as i32));
            let _ = nix::sys::signal::kill(pgid, nix::sys::signal::Signal::SIGTERM);
        }
        tokio::select! {
            _ = tokio::time::sleep(KILL_GRACE_PERIOD) => {}
            _ = child.wait() => return,
        }
    }
    let _ = child.kill().await;
}

fn tail_utf8(buf: &[u8], limit: usize) -> String {
    let start = buf.len().saturating_sub(limit);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

const QUOTA_PATTERNS: &[&str] = &[
    "quota exceeded",
    "rate limit",
    "rate-limited",
    "too many requests",
    "resource exhausted",
    "429",
];

const PERMISSION_PATTERNS: &[&str] = &[
    "permission denied",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "authentication failed",
    "access denied",
    "401",
    "403",
];

/// Classifies a captured stderr tail as quota exhaustion, if it matches one
/// of a fixed set of substrings known to appear in backend CLI output.
fn classify_quota_exhaustion(stderr_tail: &str) -> Option<String> {
    let lower = stderr_tail.to_lowercase();
    QUOTA_PATTERNS
        .iter()
        .find(|pattern| lower.contains(*pattern))
        .map(|pattern| format!("stderr matched quota pattern '{pattern}'"))
}

/// Classifies a captured stderr tail as a permission/auth denial.
fn classify_permission_denial(stderr_tail: &str) -> Option<String> {
    let lower = stderr_tail.to_lowercase();
    PERMISSION_PATTERNS
        .iter()
        .find(|pattern| lower.contains(*pattern))
        .map(|pattern| format!("stderr matched permission pattern '{pattern}'"))
}
