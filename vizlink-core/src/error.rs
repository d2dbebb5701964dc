//! Error taxonomy for the session client.
//!
//! Three independent families, matching the three failure surfaces:
//! connecting, invoking remote methods, and decoding frames. All fallible
//! operations return `Result` — no panics on bad input or bad peers.

use std::time::Duration;
use thiserror::Error;

// ── ConnectError ─────────────────────────────────────────────────

/// Failure to establish (or negotiate) a connection.
///
/// Any failure releases whatever was partially established; a handle is
/// never returned in an unusable state.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The network layer reported an error while dialing or upgrading.
    #[error("network error: {0}")]
    Network(#[from] tokio_tungstenite::tungstenite::Error),

    /// The configuration was invalid or the server refused the session.
    ///
    /// Raised *before* any network I/O when validation fails.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// The connect attempt exceeded its configured deadline.
    #[error("connect timeout after {0:?}")]
    Timeout(Duration),
}

// ── RpcError ─────────────────────────────────────────────────────

/// Failure of a single remote method invocation.
///
/// RPC errors go to the specific caller only; they never change session
/// state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// The session is not `Ready`; the call was rejected before any
    /// network I/O. Calls are never silently queued.
    #[error("session not ready")]
    NotReady,

    /// The server executed the method and returned an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// No response arrived within the call deadline.
    #[error("rpc timeout after {0:?}")]
    Timeout(Duration),

    /// The underlying connection went away mid-call.
    #[error("connection channel closed")]
    ChannelClosed,
}

// ── DecodeError ──────────────────────────────────────────────────

/// Failure to decode a single frame.
///
/// Decode errors are recovered locally: the frame is dropped and logged,
/// never propagated to the caller — a corrupt frame must not end the
/// stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// The payload or header could not be parsed into a raster.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The frame declared an encoding this client does not understand.
    #[error("unsupported encoding: {0:#x}")]
    Unsupported(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = ConnectError::Rejected("application must not be empty".into());
        assert!(e.to_string().contains("rejected"));

        let e = RpcError::Timeout(Duration::from_secs(30));
        assert!(e.to_string().contains("30"));

        let e = DecodeError::Unsupported(0x7F);
        assert!(e.to_string().contains("0x7f"));
    }

    #[test]
    fn rpc_error_equality() {
        assert_eq!(RpcError::NotReady, RpcError::NotReady);
        assert_ne!(RpcError::NotReady, RpcError::ChannelClosed);
    }
}
