//! Wire message model.
//!
//! The server speaks two message flavors over one WebSocket:
//!
//! - **Text**: JSON envelopes for RPC calls, RPC responses, and
//!   subscription registration.
//! - **Binary**: rendered image frames with a fixed little-endian header
//!   followed by the compressed raster payload.
//!
//! ## Frame layout
//!
//! ```text
//! view_id:    i64  (8)
//! sequence:   u64  (8)
//! width:      u32  (4)
//! height:     u32  (4)
//! encoding:   u8   (1)
//! payload:    [u8] (variable)
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Orientation, ViewKind};
use crate::error::DecodeError;

/// Request id reserved for the session-negotiation hello.
pub const HELLO_REQUEST_ID: u64 = 0;

// ── Text envelopes ───────────────────────────────────────────────

/// Negotiation payload sent once per logical view after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub application: String,
    pub dataset_ref: String,
    pub orientation: Orientation,
    pub view_kind: ViewKind,
    pub view_id: i64,
    pub interactive_quality: u8,
    pub width: u32,
    pub height: u32,
}

/// Messages sent client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Session negotiation for one view. Answered with a [`ServerRpc`]
    /// carrying [`HELLO_REQUEST_ID`].
    Hello(HelloPayload),
    /// Remote method invocation.
    Call {
        id: u64,
        method: String,
        args: Vec<Value>,
    },
    /// Fire-and-forget registration for a server-pushed topic.
    Subscribe { topic: String },
}

/// RPC response sent server → client, correlated by request id.
///
/// Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRpc {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── FrameEncoding ────────────────────────────────────────────────

/// Compression applied to a frame payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEncoding {
    /// Tightly-packed RGBA rows, no compression.
    Raw = 0,
    /// zstd-compressed RGBA rows.
    Zstd = 1,
}

impl TryFrom<u8> for FrameEncoding {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameEncoding::Raw),
            1 => Ok(FrameEncoding::Zstd),
            other => Err(DecodeError::Unsupported(other)),
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// One server-produced image update for a given view.
///
/// Frames for the same view are ordered by `sequence`; a decrease is a
/// stale or duplicate frame and is dropped by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub view_id: i64,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub encoding: FrameEncoding,
    /// Compressed raster bytes. Decoded lazily on the consuming side.
    pub payload: Bytes,
}

impl Frame {
    /// Encoded header size on the wire.
    pub const HEADER_SIZE: usize = 25;

    /// Serialize to a binary WebSocket message body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.view_id.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&[self.encoding as u8]);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize from a binary WebSocket message body.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(DecodeError::Malformed(format!(
                "frame header too short: {} < {}",
                data.len(),
                Self::HEADER_SIZE
            )));
        }
        let view_id = i64::from_le_bytes(data[0..8].try_into().unwrap());
        let sequence = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let width = u32::from_le_bytes(data[16..20].try_into().unwrap());
        let height = u32::from_le_bytes(data[20..24].try_into().unwrap());
        let encoding = FrameEncoding::try_from(data[24])?;
        Ok(Self {
            view_id,
            sequence,
            width,
            height,
            encoding,
            payload: Bytes::copy_from_slice(&data[Self::HEADER_SIZE..]),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
