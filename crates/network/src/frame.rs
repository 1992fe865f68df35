//! Wire frames and the length-prefixed codec.
//!
//! Every logical message travels as a sequence of frames sharing a stream id:
//! zero or more data chunks followed by one frame with `done = true` (which
//! may instead carry an error from the sender). Frames are JSON objects,
//! length-prefixed on the wire with a big-endian `u32`.

use crate::config::MAX_FRAME_BYTES;
use crate::error::{NetworkError, NetworkResult};
use clique_core::Node;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HmacSha256 = Hmac<Sha256>;

/// Error carried by a stream that failed on the sending side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable failure description.
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Stream header: which logical message a frame belongs to and whether the
/// stream is finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Stream id shared by all frames of one logical message.
    pub stream: String,
    /// Whether this frame ends the stream.
    pub done: bool,
    /// Present when the sender aborted the stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

/// Payload bytes, serialized in the `{"type":"Buffer","data":[..]}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BufferJson", into = "BufferJson")]
pub struct Payload(pub Vec<u8>);

#[derive(Serialize, Deserialize)]
struct BufferJson {
    #[serde(rename = "type")]
    kind: String,
    data: Vec<u8>,
}

impl From<BufferJson> for Payload {
    fn from(json: BufferJson) -> Self {
        Payload(json.data)
    }
}

impl From<Payload> for BufferJson {
    fn from(payload: Payload) -> Self {
        Self {
            kind: "Buffer".to_string(),
            data: payload.0,
        }
    }
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Target handler id, or the originating tag when the frame is a reply.
    pub id: String,
    /// Fresh identifier the caller uses to match replies. `None` on casts.
    pub tag: Option<String>,
    /// Identity of the sending node.
    pub from: Node,
    /// Stream membership and completion.
    pub stream: StreamHeader,
    /// Chunk bytes, `None` on the final frame.
    pub data: Option<Payload>,
    /// HMAC-SHA256 over the frame's JSON minus this field, hex-encoded.
    /// Present iff the cluster runs with a cookie.
    #[serde(rename = "checkSum", skip_serializing_if = "Option::is_none")]
    pub check_sum: Option<String>,
}

impl Frame {
    /// Builds a data chunk frame.
    pub fn chunk(
        id: impl Into<String>,
        tag: Option<String>,
        from: Node,
        stream: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            tag,
            from,
            stream: StreamHeader {
                stream: stream.into(),
                done: false,
                error: None,
            },
            data: Some(Payload(data)),
            check_sum: None,
        }
    }

    /// Builds the final frame of a stream.
    pub fn done(
        id: impl Into<String>,
        tag: Option<String>,
        from: Node,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tag,
            from,
            stream: StreamHeader {
                stream: stream.into(),
                done: true,
                error: None,
            },
            data: None,
            check_sum: None,
        }
    }

    /// Builds a final frame carrying a sender-side error.
    pub fn failed(
        id: impl Into<String>,
        tag: Option<String>,
        from: Node,
        stream: impl Into<String>,
        error: ErrorPayload,
    ) -> Self {
        Self {
            id: id.into(),
            tag,
            from,
            stream: StreamHeader {
                stream: stream.into(),
                done: true,
                error: Some(error),
            },
            data: None,
            check_sum: None,
        }
    }

    fn mac(cookie: &str, bytes: &[u8]) -> NetworkResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(cookie.as_bytes())
            .map_err(|e| NetworkError::codec(format!("hmac key: {e}")))?;
        mac.update(bytes);
        Ok(mac)
    }

    /// Computes and attaches the checksum for `cookie`.
    pub fn sign(&mut self, cookie: &str) -> NetworkResult<()> {
        self.check_sum = None;
        let bytes = serde_json::to_vec(self).map_err(NetworkError::codec)?;
        let mac = Self::mac(cookie, &bytes)?;
        self.check_sum = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(())
    }

    /// Verifies the attached checksum against `cookie`. A frame with no
    /// checksum never verifies.
    pub fn verify(&self, cookie: &str) -> bool {
        let Some(sum) = &self.check_sum else {
            return false;
        };
        let Ok(expected) = hex::decode(sum) else {
            return false;
        };
        let mut unsigned = self.clone();
        unsigned.check_sum = None;
        let Ok(bytes) = serde_json::to_vec(&unsigned) else {
            return false;
        };
        match Self::mac(cookie, &bytes) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    /// Serializes the frame for the wire.
    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(NetworkError::codec)
    }

    /// Parses a frame from wire bytes.
    pub fn decode(bytes: &[u8]) -> NetworkResult<Frame> {
        serde_json::from_slice(bytes).map_err(NetworkError::codec)
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> NetworkResult<()> {
    let bytes = frame.encode()?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(NetworkError::Codec {
            reason: format!("frame of {} bytes exceeds limit", bytes.len()),
        });
    }
    let len = (bytes.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(NetworkError::codec)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(NetworkError::codec)?;
    writer.flush().await.map_err(NetworkError::codec)?;
    Ok(())
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> NetworkResult<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::codec(e)),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::Codec {
            reason: format!("announced frame of {len} bytes exceeds limit"),
        });
    }
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(NetworkError::codec)?;
    Frame::decode(&bytes).map(Some)
}
