//! Command channel backed by a separate helper process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::exec::{terminate, DEFAULT_KILL_GRACE};
use super::protocol::{parse_frame, write_frame, HelperRequest, HelperResponse, PROTOCOL_VERSION};
use super::{CancelHandle, CommandChannel, CommandRequest, CommandResult, CommandValidator};
use crate::error::{BrokerError, CommandError};
use crate::Result;

/// Default bound on a liveness probe.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// How to start the helper process.
#[derive(Debug, Clone)]
pub struct HelperOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub ping_timeout: Duration,
    /// Time allowed for the helper to answer a cancel before it is killed.
    pub kill_grace: Duration,
}

impl HelperOptions {
    /// Run `program helper`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["helper".to_string()],
            ping_timeout: DEFAULT_PING_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Use the running executable as the helper.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// Runs every request in a freshly started helper process.
///
/// The helper is this crate's own binary in `helper` mode (or any program
/// speaking [`protocol`](super::protocol)). Failing to start or talk to it
/// is a `ConnectionFailed` error; everything after the request is delivered
/// comes back as a [`CommandResult`].
#[derive(Debug, Clone)]
pub struct HelperChannel {
    options: HelperOptions,
    validator: CommandValidator,
}

impl HelperChannel {
    pub fn new(options: HelperOptions) -> Self {
        Self {
            options,
            validator: CommandValidator::default(),
        }
    }

    pub fn with_validator(mut self, validator: CommandValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn options(&self) -> &HelperOptions {
        &self.options
    }

    fn connect(&self) -> Result<Connection> {
        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            connection_failed(format!(
                "cannot start helper {}: {e}",
                self.options.program.display()
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connection_failed("helper stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connection_failed("helper stdout unavailable"))?;

        let pid = child.id();
        debug!(?pid, program = %self.options.program.display(), "helper started");
        Ok(Connection {
            pid,
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        })
    }
}

enum Waited {
    Response(Result<HelperResponse>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CommandChannel for HelperChannel {
    async fn execute_cancellable(
        &self,
        request: CommandRequest,
        cancel: &CancelHandle,
    ) -> Result<CommandResult> {
        self.validator.validate(&request)?;
        let timeout = request.timeout;
        let context = request.session_context;
        let grace = self.options.kill_grace;

        let mut conn = self.connect()?;
        if let Err(e) = conn.send(&HelperRequest::Execute { request }).await {
            conn.kill().await;
            return Err(e);
        }

        let waited = tokio::select! {
            response = conn.receive() => Waited::Response(response),
            _ = tokio::time::sleep(timeout + grace) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Response(Ok(HelperResponse::Result { result })) => {
                conn.close(grace).await;
                Ok(result)
            }
            Waited::Response(Ok(HelperResponse::Error { message })) => {
                conn.close(grace).await;
                match message.strip_prefix("invalid request: ") {
                    Some(reason) => Err(BrokerError::InvalidRequest(reason.to_string())),
                    None => Err(connection_failed(format!("helper error: {message}"))),
                }
            }
            Waited::Response(Ok(HelperResponse::Pong { .. })) => {
                conn.kill().await;
                Err(connection_failed("helper answered execute with pong"))
            }
            Waited::Response(Err(e)) => {
                conn.kill().await;
                Err(e)
            }
            Waited::TimedOut => {
                warn!(%context, "helper did not answer within the timeout; interrupting");
                Ok(match conn.interrupt(grace).await {
                    Some(result) if result.is_timeout() => result,
                    other => CommandResult::timed_out(timeout, other.and_then(|r| r.output)),
                })
            }
            Waited::Cancelled => {
                info!(%context, "cancelling helper command");
                Ok(match conn.interrupt(grace).await {
                    Some(result) if result.is_cancelled() => result,
                    other => CommandResult::cancelled(other.and_then(|r| r.output)),
                })
            }
        }
    }

    async fn ping(&self) -> bool {
        let mut conn = match self.connect() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "helper ping failed");
                return false;
            }
        };

        let outcome = tokio::time::timeout(self.options.ping_timeout, async {
            conn.send(&HelperRequest::Ping).await?;
            conn.receive().await
        })
        .await;

        let alive = matches!(
            outcome,
            Ok(Ok(HelperResponse::Pong { version })) if version == PROTOCOL_VERSION
        );
        if !alive {
            warn!(?outcome, "helper did not answer ping");
        }
        conn.close(self.options.kill_grace).await;
        alive
    }
}

/// One helper process and its protocol pipes.
struct Connection {
    pid: Option<u32>,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Connection {
    async fn send(&mut self, frame: &HelperRequest) -> Result<()> {
        write_frame(&mut self.stdin, frame)
            .await
            .map_err(|e| connection_failed(format!("cannot write to helper: {e}")))
    }

    async fn receive(&mut self) -> Result<HelperResponse> {
        match self.lines.next_line().await {
            Ok(Some(line)) => parse_frame(&line)
                .map_err(|e| connection_failed(format!("malformed helper response: {e}"))),
            Ok(None) => Err(connection_failed("helper exited without responding")),
            Err(e) => Err(connection_failed(format!("cannot read from helper: {e}"))),
        }
    }

    /// Ask the helper to stop its command and collect whatever it reports.
    async fn interrupt(mut self, grace: Duration) -> Option<CommandResult> {
        if let Err(e) = self.send(&HelperRequest::Cancel).await {
            debug!(error = %e, "helper gone before cancel");
        }
        let reply = tokio::time::timeout(grace, self.receive()).await;
        self.kill().await;
        match reply {
            Ok(Ok(HelperResponse::Result { result })) => Some(result),
            _ => None,
        }
    }

    /// Close the request pipe and let the helper exit on its own.
    async fn close(self, grace: Duration) {
        let Connection {
            pid,
            mut child,
            stdin,
            lines,
        } = self;
        drop(stdin);
        drop(lines);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            debug!(?pid, "helper lingering after close; killing");
            terminate(pid, &mut child).await;
        }
    }

    async fn kill(mut self) {
        terminate(self.pid, &mut self.child).await;
    }
}

fn connection_failed(reason: impl Into<String>) -> BrokerError {
    CommandError::ConnectionFailed(reason.into()).into()
}
