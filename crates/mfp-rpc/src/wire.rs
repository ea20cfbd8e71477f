//! Wire format and framing.
//!
//! Every write on the pipe is one frame: a 4-byte big-endian length prefix
//! followed by the UTF-8 JSON of a `WireMessage`.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//!
//! {"type": "Request", "request_id": 12, "payload": {"method": "call", "params": {...}},
//!  "response": null, "origin": 1}
//! {"type": "payload", "payload": <any JSON value>}
//! ```

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::request::{Payload, RequestId, Response};

/// One message on the pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// A call or a response to one. `origin` is the role of the endpoint that
    /// submitted the call, so a reply can be told apart from a fresh call.
    #[serde(rename = "Request")]
    Request {
        request_id: RequestId,
        payload: Payload,
        response: Option<Response>,
        origin: u8,
    },
    /// Fire-and-forget value for the out-of-band handler.
    #[serde(rename = "payload")]
    Payload { payload: Value },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| RpcError::Json {
            message: format!("Failed to parse wire message: {}", e),
            source: Some(e),
        })
    }
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge {
            size: payload.len(),
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered frame reader.
///
/// Partial frames stay in the internal buffer between calls, so
/// `next_frame()` can be raced against a timeout without losing bytes.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(TransportConfig::READ_CHUNK_SIZE),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `None` on clean EOF (peer closed the pipe between frames).
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(Some(frame));
            }

            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::Io {
                    message: format!(
                        "pipe closed with {} bytes of an unfinished frame",
                        self.buf.len()
                    ),
                    source: None,
                });
            }
        }
    }

    fn split_frame(&mut self) -> Result<Option<Bytes>> {
        let header = TransportConfig::FRAME_HEADER_LEN;
        if self.buf.len() < header {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&self.buf[..header]);
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > TransportConfig::MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge {
                size: len,
                max: TransportConfig::MAX_FRAME_SIZE,
            });
        }

        if self.buf.len() < header + len {
            self.buf.reserve(header + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(header);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Status;
    use serde_json::json;

    #[test]
    fn test_request_message_shape() {
        let msg = WireMessage::Request {
            request_id: 3,
            payload: Payload::call("call", json!({"func": "getparam"})),
            response: None,
            origin: 1,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "Request");
        assert_eq!(value["request_id"], 3);
        assert_eq!(value["response"], Value::Null);
        assert_eq!(value["origin"], 1);
        assert_eq!(value["payload"]["method"], "call");
    }

    #[test]
    fn test_payload_message_shape() {
        let msg = WireMessage::Payload {
            payload: json!("quit"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "payload", "payload": "quit"})
        );
    }

    #[test]
    fn test_answered_request_decodes() {
        let raw = json!({
            "type": "Request",
            "request_id": 9,
            "payload": {"method": "create", "params": {}},
            "response": [5, null],
            "origin": 0
        });
        let msg = WireMessage::decode(raw.to_string().as_bytes()).unwrap();
        match msg {
            WireMessage::Request { response, .. } => {
                assert_eq!(response, Some(Response::new(Status::Created(5), Value::Null)));
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_is_json_error() {
        let result = WireMessage::decode(b"not json");
        assert!(matches!(result, Err(RpcError::Json { .. })));
    }

    #[tokio::test]
    async fn test_frames_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").await.unwrap();
        write_frame(&mut buf, b"second").await.unwrap();

        let mut reader = FrameReader::new(std::io::Cursor::new(buf));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"first"[..]);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), &b"second"[..]);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").await.unwrap();
        buf.truncate(8);

        let mut reader = FrameReader::new(std::io::Cursor::new(buf));
        assert!(reader.next_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let huge = (TransportConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = huge.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);

        let mut reader = FrameReader::new(std::io::Cursor::new(buf));
        let result = reader.next_frame().await;
        assert!(matches!(result, Err(RpcError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_frame_survives_cancelled_read() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx);

        // Only the header arrives before the first read is abandoned.
        tx.write_all(&5u32.to_be_bytes()).await.unwrap();
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reader.next_frame(),
        )
        .await;
        assert!(first.is_err());

        tx.write_all(b"hello").await.unwrap();
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, &b"hello"[..]);
    }
}
