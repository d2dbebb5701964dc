//! WebSocket transport connector.
//!
//! [`Transport::connect`] dials the configured endpoint within a bounded
//! timeout and splits the socket into two background tasks: a writer fed
//! by an mpsc channel of [`ClientMessage`]s, and a reader that converts
//! incoming messages into [`TransportEvent`]s. The caller observes the
//! connection only through those two channels plus an explicit, idempotent
//! close signal.
//!
//! Text messages carry JSON RPC envelopes, binary messages carry frames.
//! A message that fails to parse is logged and dropped — one corrupt
//! message must not terminate the stream.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::config::validate_endpoint;
use crate::error::{ConnectError, DecodeError};
use crate::wire::{ClientMessage, Frame, ServerRpc};

/// Depth of the outbound and event channels.
const CHANNEL_DEPTH: usize = 64;

/// Sender half used to push messages toward the server.
pub type TransportSender = mpsc::Sender<ClientMessage>;

/// Receiver half yielding connection events.
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

// ── TransportEvent ───────────────────────────────────────────────

/// Everything the connection can tell its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// An RPC response arrived.
    Rpc(ServerRpc),
    /// A binary frame arrived.
    Frame(Frame),
    /// A binary message whose header could not be decoded. The frame is
    /// already dropped; the owner only accounts for it.
    Malformed(DecodeError),
    /// The connection reported an error. It may still be usable; a
    /// subsequent [`TransportEvent::Frame`] signals recovery.
    Error(String),
    /// The connection is gone. Terminal.
    Closed,
}

// ── TransportCloser ──────────────────────────────────────────────

/// Explicit close signal for a [`Transport`].
///
/// Safe to trigger from any state, any number of times.
#[derive(Debug)]
pub struct TransportCloser(watch::Sender<bool>);

impl TransportCloser {
    /// Ask both background tasks to shut down. Idempotent.
    pub fn close(&self) {
        let _ = self.0.send(true);
    }
}

// ── Transport ────────────────────────────────────────────────────

/// An established connection to the rendering server.
///
/// Split into `(sender, events, closer)` before use; the pieces can live
/// in different tasks. Dropping all three tears the socket down.
#[derive(Debug)]
pub struct Transport {
    outbound: TransportSender,
    events: EventReceiver,
    closer: TransportCloser,
}

impl Transport {
    /// Dial `endpoint` and perform the WebSocket upgrade, bounded by
    /// `timeout`.
    ///
    /// Fails with [`ConnectError::Rejected`] (invalid endpoint, no I/O
    /// attempted), [`ConnectError::Timeout`], or [`ConnectError::Network`].
    /// On any failure all partially-established resources are released.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self, ConnectError> {
        validate_endpoint(endpoint)?;

        debug!(endpoint, "connecting");
        let (socket, _response) = tokio::time::timeout(timeout, connect_async(endpoint))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;
        debug!(endpoint, "websocket established");

        Ok(Self::spawn(socket))
    }

    /// Wrap an already-upgraded socket in the writer/reader task pair.
    fn spawn<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(CHANNEL_DEPTH);
        let (event_tx, events) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Writer task: channel -> socket.
        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = writer_shutdown.changed() => {
                        if changed.is_err() || *writer_shutdown.borrow() {
                            break;
                        }
                    }
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let text = match serde_json::to_string(&msg) {
                            Ok(t) => t,
                            Err(e) => {
                                warn!("unserializable outbound message: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::text(text)).await {
                            debug!("write failed: {e}");
                            break;
                        }
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        // Reader task: socket -> events.
        let mut reader_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = reader_shutdown.changed() => {
                        if changed.is_err() || *reader_shutdown.borrow() {
                            let _ = event_tx.send(TransportEvent::Closed).await;
                            break;
                        }
                    }
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(msg)) => {
                                if let Some(event) = classify(msg) {
                                    if event_tx.send(event).await.is_err() {
                                        break; // owner went away
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                // Surface the error but keep reading; the
                                // stream ending is reported separately.
                                if event_tx
                                    .send(TransportEvent::Error(e.to_string()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            None => {
                                let _ = event_tx.send(TransportEvent::Closed).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            outbound,
            events,
            closer: TransportCloser(shutdown_tx),
        }
    }

    /// Split into the three independently-owned pieces.
    pub fn split(self) -> (TransportSender, EventReceiver, TransportCloser) {
        (self.outbound, self.events, self.closer)
    }

    /// Clone of the outbound sender.
    pub fn sender(&self) -> TransportSender {
        self.outbound.clone()
    }

    /// Receive the next connection event.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Signal shutdown. Idempotent.
    pub fn close(&self) {
        self.closer.close();
    }

}

/// Map one WebSocket message to a transport event, if it carries one.
fn classify(msg: Message) -> Option<TransportEvent> {
    match msg {
        Message::Text(text) => match serde_json::from_str::<ServerRpc>(text.as_str()) {
            Ok(rpc) => Some(TransportEvent::Rpc(rpc)),
            Err(e) => {
                warn!("unparseable text message dropped: {e}");
                None
            }
        },
        Message::Binary(data) => match Frame::decode(&data) {
            Ok(frame) => Some(TransportEvent::Frame(frame)),
            Err(e) => {
                debug!("undecodable frame dropped: {e}");
                Some(TransportEvent::Malformed(e))
            }
        },
        Message::Close(_) => Some(TransportEvent::Closed),
        // Pings are answered by the library; pongs carry no payload we use.
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────
