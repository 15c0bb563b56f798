//! Wire frames for the TCP transport.
//!
//! ```text
//! [u32 BE frame length] [u32 BE header length] [JSON header] [payload bytes]
//! ```
//!
//! The frame length counts everything after itself. Decoded payloads are
//! written as JSON; encoded payloads are written as is.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{MeshError, Result};
use crate::protocol::{Payload, Qualifier, ServiceMessage};

/// Default upper bound for one frame (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Client to server, no reply.
    Fire,
    /// Client to server, exactly one `Next` back.
    Request,
    /// Client to server, any number of `Next` then `Complete`.
    Subscribe,
    /// Server to client, one response element.
    Next,
    /// Server to client, end of a subscription.
    Complete,
    /// Client to server, stop producing for a subscription.
    Cancel,
}

impl FrameKind {
    pub fn carries_message(self) -> bool {
        !matches!(self, FrameKind::Complete | FrameKind::Cancel)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    kind: FrameKind,
    stream_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    qualifier: Option<Qualifier>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

/// One unit on the wire, belonging to the exchange `stream_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u64,
    pub message: Option<ServiceMessage>,
}

impl Frame {
    pub fn with_message(kind: FrameKind, stream_id: u64, message: ServiceMessage) -> Self {
        Self {
            kind,
            stream_id,
            message: Some(message),
        }
    }

    pub fn signal(kind: FrameKind, stream_id: u64) -> Self {
        Self {
            kind,
            stream_id,
            message: None,
        }
    }

    /// Serializes the frame including its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (qualifier, headers, payload) = match &self.message {
            Some(message) => {
                let payload = match message.data() {
                    Payload::Empty => Vec::new(),
                    Payload::Encoded(bytes) => bytes.clone(),
                    Payload::Value(value) => serde_json::to_vec(value)?,
                };
                (
                    Some(message.qualifier().clone()),
                    message.headers().clone(),
                    payload,
                )
            }
            None => (None, HashMap::new(), Vec::new()),
        };

        let header = serde_json::to_vec(&FrameHeader {
            kind: self.kind,
            stream_id: self.stream_id,
            qualifier,
            headers,
        })?;

        let frame_len = 4 + header.len() + payload.len();
        let mut buf = Vec::with_capacity(4 + frame_len);
        buf.extend_from_slice(&(frame_len as u32).to_be_bytes());
        buf.extend_from_slice(&(header.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Like [`encode`](Self::encode), but rejects frames the peer would
    /// refuse to read.
    pub fn encode_within(&self, max_frame_size: usize) -> Result<Vec<u8>> {
        let bytes = self.encode()?;
        let frame_len = bytes.len() - 4;
        if frame_len > max_frame_size {
            return Err(MeshError::Codec(format!(
                "Frame too large: {} bytes (max {} bytes)",
                frame_len, max_frame_size
            )));
        }
        Ok(bytes)
    }

    /// Parses a frame body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(MeshError::Codec(format!("frame too short: {} bytes", body.len())));
        }
        let header_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let rest = &body[4..];
        if header_len > rest.len() {
            return Err(MeshError::Codec(format!(
                "frame header length {} exceeds frame body {}",
                header_len,
                rest.len()
            )));
        }

        let header: FrameHeader = serde_json::from_slice(&rest[..header_len])?;
        let payload = &rest[header_len..];

        let message = match (header.kind.carries_message(), header.qualifier) {
            (true, Some(qualifier)) => {
                let data = if payload.is_empty() {
                    Payload::Empty
                } else {
                    Payload::Encoded(payload.to_vec())
                };
                Some(
                    ServiceMessage::new(qualifier)
                        .with_headers(header.headers)
                        .with_payload(data),
                )
            }
            (true, None) => {
                return Err(MeshError::Codec(format!(
                    "{:?} frame {} without qualifier",
                    header.kind, header.stream_id
                )))
            }
            (false, _) => None,
        };

        Ok(Self {
            kind: header.kind,
            stream_id: header.stream_id,
            message,
        })
    }
}

/// Writes one frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    write_encoded(writer, &frame.encode()?).await
}

/// Writes an already encoded frame and flushes.
pub async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .await
        .map_err(|e| MeshError::Connection(format!("Failed to write frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| MeshError::Connection(format!("Failed to flush frame: {}", e)))?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the connection between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(MeshError::Connection(format!("Failed to read frame length: {}", e)));
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(MeshError::Codec(format!(
            "Frame too large: {} bytes (max {} bytes)",
            len, max_frame_size
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| MeshError::Connection(format!("Failed to read frame body: {}", e)))?;

    Frame::decode(&body).map(Some)
}
