//! Child process execution with hard time bounds.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CancelHandle, CommandRequest, CommandResult};
use crate::output::{CapturedOutput, OutputSanitizer};

/// Default time granted to a killed process group to let its pipes drain.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8192;

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns and supervises one command at a time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Runner {
    sanitizer: OutputSanitizer,
    kill_grace: Duration,
}

impl Runner {
    pub(crate) fn new(sanitizer: OutputSanitizer, kill_grace: Duration) -> Self {
        Self {
            sanitizer,
            kill_grace,
        }
    }

    /// Run `request` with exactly `env` as its environment.
    pub(crate) async fn run(
        &self,
        request: &CommandRequest,
        env: BTreeMap<String, String>,
        cancel: &CancelHandle,
    ) -> CommandResult {
        let started = Instant::now();
        let mut command = Command::new(&request.command);
        command
            .args(&request.arguments)
            .env_clear()
            .envs(env)
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    context = %request.session_context,
                    command = %request.command,
                    error = %e,
                    "failed to start command"
                );
                return CommandResult::spawn_failed(format!(
                    "failed to start {}: {e}",
                    request.command
                ));
            }
        };
        let pid = child.id();
        debug!(context = %request.session_context, ?pid, command = %request.command, "command started");

        let limit = self.sanitizer.max_bytes();
        let stdout = spawn_reader(child.stdout.take(), limit);
        let stderr = spawn_reader(child.stderr.take(), limit);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let exit_code = match &outcome {
            Outcome::Exited(Ok(status)) => Some(exit_code(status)),
            Outcome::Exited(Err(_)) => None,
            Outcome::TimedOut | Outcome::Cancelled => {
                terminate(pid, &mut child).await;
                None
            }
        };

        let stdout = self.collect(stdout, pid).await;
        let stderr = self.collect(stderr, pid).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Outcome::Exited(Ok(_)) => CommandResult::completed(
                exit_code.unwrap_or(-1),
                self.sanitizer.render(&stdout),
                &self.sanitizer.render(&stderr),
            ),
            Outcome::Exited(Err(e)) => CommandResult::failure(
                &crate::error::CommandError::ExecutionFailed {
                    exit_code: -1,
                    detail: format!("lost track of child process: {e}"),
                },
                Some(self.sanitizer.render(&stdout)),
                -1,
            ),
            Outcome::TimedOut => {
                warn!(
                    context = %request.session_context,
                    timeout_secs = request.timeout.as_secs_f64(),
                    "command timed out; process group killed"
                );
                CommandResult::timed_out(request.timeout, Some(self.sanitizer.render(&stdout)))
            }
            Outcome::Cancelled => {
                info!(context = %request.session_context, "command cancelled by caller");
                CommandResult::cancelled(Some(self.sanitizer.render(&stdout)))
            }
        };

        info!(
            context = %request.session_context,
            command = %request.command,
            success = result.success,
            exit_code = result.exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "command finished"
        );
        result
    }

    /// Wait briefly for a reader; stragglers holding the pipe open are killed.
    async fn collect(
        &self,
        reader: JoinHandle<CapturedOutput>,
        pid: Option<u32>,
    ) -> CapturedOutput {
        let abort = reader.abort_handle();
        match tokio::time::timeout(self.kill_grace, reader).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                warn!(error = %e, "output reader failed");
                CapturedOutput::default()
            }
            Err(_) => {
                debug!(?pid, "output still open after exit; killing process group");
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                abort.abort();
                CapturedOutput::default()
            }
        }
    }
}

fn spawn_reader<R>(stream: Option<R>, limit: usize) -> JoinHandle<CapturedOutput>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match stream {
            Some(stream) => read_bounded(stream, limit).await,
            None => CapturedOutput::default(),
        }
    })
}

/// Read to EOF, keeping at most `limit` bytes but counting all of them.
pub(crate) async fn read_bounded<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> CapturedOutput {
    let mut captured = CapturedOutput::default();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                captured.total += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "output stream closed with error");
                break;
            }
        }
    }
    captured
}

/// Kill the whole process group, then reap the leader.
pub(crate) async fn terminate(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        kill_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!(?pid, error = %e, "child already gone");
    }
}

#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The child was
    // started with process_group(0), so -pgid names only its group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) {}

fn exit_code(status: &ExitStatus) -> i32 {
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
