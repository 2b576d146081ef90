//! Wire protocol between the broker and its helper process.
//!
//! Frames are single-line JSON objects tagged by `type`, exchanged over the
//! helper's stdin (requests) and stdout (responses):
//!
//! ```text
//! -> {"type":"ping"}
//! <- {"type":"pong","version":1}
//! -> {"type":"execute","request":{...}}
//! <- {"type":"result","result":{"success":true,...}}
//! ```
//!
//! A `cancel` frame sent while an `execute` is in flight stops it; closing
//! stdin has the same effect.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{CommandRequest, CommandResult};

pub const PROTOCOL_VERSION: u32 = 1;

/// Frames sent to the helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    Ping,
    Execute { request: CommandRequest },
    Cancel,
}

/// Frames sent back by the helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperResponse {
    Pong { version: u32 },
    Result { result: CommandResult },
    /// The request could not be carried out at all.
    Error { message: String },
}

/// Write one frame followed by a newline and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Parse one frame from a line.
pub fn parse_frame<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_frame_shape() {
        let json = serde_json::to_string(&HelperRequest::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let pong: HelperResponse = parse_frame(r#"{"type":"pong","version":1}"#).unwrap();
        assert_eq!(pong, HelperResponse::Pong { version: 1 });
    }

    #[test]
    fn test_execute_frame_carries_request() {
        let request = CommandRequest::new("true").working_dir("/");
        let json = serde_json::to_string(&HelperRequest::Execute {
            request: request.clone(),
        })
        .unwrap();
        assert!(json.starts_with(r#"{"type":"execute","request":{"#));

        let back: HelperRequest = parse_frame(&json).unwrap();
        assert_eq!(back, HelperRequest::Execute { request });
    }

    #[test]
    fn test_unknown_frame_rejected() {
        assert!(parse_frame::<HelperRequest>(r#"{"type":"format_disk"}"#).is_err());
    }

    #[tokio::test]
    async fn test_write_frame_is_newline_terminated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &HelperRequest::Cancel).await.unwrap();
        assert_eq!(buf, b"{\"type\":\"cancel\"}\n");
    }
}
