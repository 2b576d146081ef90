//! Helper-side protocol server.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

use super::protocol::{parse_frame, write_frame, HelperRequest, HelperResponse, PROTOCOL_VERSION};
use super::{CancelHandle, CommandChannel};
use crate::Result;

/// Serve protocol frames from `reader` until it closes.
///
/// Requests are handled one at a time. While an `execute` runs, the reader
/// is still watched: a `cancel` frame or end of input cancels the command.
pub async fn serve<R, W>(channel: Arc<dyn CommandChannel>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match parse_frame::<HelperRequest>(&line) {
            Ok(HelperRequest::Ping) => HelperResponse::Pong {
                version: PROTOCOL_VERSION,
            },
            Ok(HelperRequest::Cancel) => {
                debug!("cancel received with nothing in flight");
                continue;
            }
            Ok(HelperRequest::Execute { request }) => {
                let context = request.session_context;
                debug!(%context, command = %request.command, "execute received");

                let cancel = CancelHandle::new();
                let execution = channel.execute_cancellable(request, &cancel);
                tokio::pin!(execution);

                loop {
                    tokio::select! {
                        outcome = &mut execution => {
                            break match outcome {
                                Ok(result) => HelperResponse::Result { result },
                                Err(e) => HelperResponse::Error { message: e.to_string() },
                            };
                        }
                        next = lines.next_line(), if !cancel.is_cancelled() => match next {
                            Ok(Some(frame)) => match parse_frame::<HelperRequest>(&frame) {
                                Ok(HelperRequest::Cancel) => {
                                    info!(%context, "cancel requested by client");
                                    cancel.cancel();
                                }
                                _ => warn!(%context, "ignoring frame received during execution"),
                            },
                            Ok(None) | Err(_) => {
                                info!(%context, "client went away; cancelling");
                                cancel.cancel();
                            }
                        },
                    }
                }
            }
            Err(e) => HelperResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };

        write_frame(&mut writer, &response).await?;
    }

    debug!("helper input closed");
    Ok(())
}

/// Serve on this process's stdin and stdout.
///
/// Stdout is reserved for protocol frames; logging must go to stderr.
pub async fn serve_stdio(channel: Arc<dyn CommandChannel>) -> Result<()> {
    info!(version = PROTOCOL_VERSION, "helper serving on stdio");
    serve(
        channel,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncWriteExt};

    use crate::channel::{CommandRequest, CommandResult};
    use crate::error::BrokerError;

    /// Sleeps for the request's timeout unless cancelled first.
    struct FakeChannel;

    #[async_trait]
    impl CommandChannel for FakeChannel {
        async fn execute_cancellable(
            &self,
            request: CommandRequest,
            cancel: &CancelHandle,
        ) -> Result<CommandResult> {
            if request.command == "fail" {
                return Err(BrokerError::InvalidRequest("fail".into()));
            }
            tokio::select! {
                _ = tokio::time::sleep(request.timeout) => {
                    Ok(CommandResult::completed(0, request.command, ""))
                }
                _ = cancel.cancelled() => Ok(CommandResult::cancelled(None)),
            }
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    async fn exchange(input: &str) -> Vec<HelperResponse> {
        let (mut client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        let serve_task = serve(Arc::new(FakeChannel), BufReader::new(server_read), server_write);
        let read_task = async {
            use tokio::io::AsyncReadExt;
            client.read_to_end(&mut output).await.unwrap();
        };
        let (served, _) = tokio::join!(serve_task, read_task);
        served.unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| parse_frame(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let responses = exchange("{\"type\":\"ping\"}\n").await;
        assert_eq!(
            responses,
            vec![HelperResponse::Pong {
                version: PROTOCOL_VERSION
            }]
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error() {
        let responses = exchange("not json\n{\"type\":\"ping\"}\n").await;
        assert!(matches!(responses[0], HelperResponse::Error { .. }));
        assert!(matches!(responses[1], HelperResponse::Pong { .. }));
    }

    #[tokio::test]
    async fn test_channel_error_is_reported() {
        let request = CommandRequest::new("fail").working_dir("/");
        let frame = serde_json::to_string(&HelperRequest::Execute { request }).unwrap();
        let responses = exchange(&format!("{frame}\n")).await;
        assert!(matches!(
            &responses[0],
            HelperResponse::Error { message } if message.contains("invalid request")
        ));
    }

    #[tokio::test]
    async fn test_eof_during_execute_cancels() {
        let request = CommandRequest::new("slow")
            .working_dir("/")
            .timeout(Duration::from_secs(30));
        let frame = serde_json::to_string(&HelperRequest::Execute { request }).unwrap();

        let responses = tokio::time::timeout(Duration::from_secs(5), exchange(&format!("{frame}\n")))
            .await
            .unwrap();
        match &responses[0] {
            HelperResponse::Result { result } => assert!(result.is_cancelled()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_frame_during_execute() {
        let request = CommandRequest::new("slow")
            .working_dir("/")
            .timeout(Duration::from_secs(30));
        let execute = serde_json::to_string(&HelperRequest::Execute { request }).unwrap();
        let input = format!("{execute}\n{{\"type\":\"cancel\"}}\n{{\"type\":\"ping\"}}\n");

        let responses = tokio::time::timeout(Duration::from_secs(5), exchange(&input))
            .await
            .unwrap();
        match &responses[0] {
            HelperResponse::Result { result } => assert!(result.is_cancelled()),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(matches!(responses[1], HelperResponse::Pong { .. }));
    }
}
