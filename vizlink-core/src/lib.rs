//! # vizlink-core
//!
//! Client library for remote visualization sessions: connect to a
//! rendering server over WebSocket, negotiate a session, receive the
//! server-rendered image stream, and forward interaction as remote
//! calls.
//!
//! This crate contains:
//! - **Config**: `SessionConfig`, `Orientation`, `ViewKind` — what to render and where
//! - **Wire**: text envelopes (`ClientMessage`, `ServerRpc`) and the binary `Frame` format
//! - **Transport**: `Transport` — WebSocket connection split into writer/reader tasks
//! - **Rpc**: `RpcGateway` — request/response correlation with deadlines
//! - **Decoder**: `StreamDecoder` — per-view latest-frame delivery with stale-frame drops
//! - **State**: `SessionState` — the validated session lifecycle machine
//! - **Session**: `Session` — one view's lifecycle, frames, and interaction
//! - **Registry**: `SessionRegistry` — many views multiplexed over one connection
//! - **Error**: typed, `thiserror`-based error hierarchy

pub mod config;
pub mod decoder;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod state;
pub mod transport;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::{DEFAULT_CONNECT_TIMEOUT, Orientation, SessionConfig, ViewKind};
pub use decoder::{DecoderStatsSnapshot, Raster, StreamDecoder, ViewSubscription, decode_frame};
pub use error::{ConnectError, DecodeError, RpcError};
pub use registry::{FourView, SessionRegistry};
pub use rpc::{DEFAULT_CALL_TIMEOUT, RpcGateway};
pub use session::{
    DEFAULT_VIEW, METHOD_IMAGE_PUSH, METHOD_MOUSE_INTERACTION, METHOD_MOUSE_ZOOM_WHEEL,
    METHOD_SIZE_UPDATE, Session, TOPIC_IMAGE_PUSH,
};
pub use state::{InvalidTransition, SessionState};
pub use transport::{Transport, TransportCloser, TransportEvent};
pub use wire::{ClientMessage, Frame, FrameEncoding, HELLO_REQUEST_ID, HelloPayload, ServerRpc};
