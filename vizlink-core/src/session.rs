//! One rendering session bound to one logical view.
//!
//! A session owns its configuration, a connection-derived handle, and one
//! decoder subscription while connected. Frames flow in through a pump
//! task and out through the `on_frame` callback (or a lazy
//! [`ViewSubscription`]); interaction flows out as remote calls through
//! the gateway; lifecycle events flow back into the state machine and out
//! through `on_state_change`.
//!
//! Handler registration is single-slot: registering a handler replaces
//! the previous one, so handlers never accumulate across reconnects.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::decoder::{DecoderStatsSnapshot, Raster, StreamDecoder, ViewSubscription};
use crate::error::{ConnectError, DecodeError, RpcError};
use crate::rpc::RpcGateway;
use crate::state::SessionState;
use crate::transport::{EventReceiver, Transport, TransportCloser, TransportEvent, TransportSender};
use crate::wire::{ClientMessage, Frame, HELLO_REQUEST_ID, HelloPayload, ServerRpc};

// ── Remote method surface ────────────────────────────────────────

/// Mouse drag / button interaction events.
pub const METHOD_MOUSE_INTERACTION: &str = "viewport.mouse.interaction";
/// Wheel zoom events.
pub const METHOD_MOUSE_ZOOM_WHEEL: &str = "viewport.mouse.zoom.wheel";
/// Viewport resize, triggers a remote re-render.
pub const METHOD_SIZE_UPDATE: &str = "viewport.size.update";
/// Ask the server to push a fresh image.
pub const METHOD_IMAGE_PUSH: &str = "viewport.image.push";
/// Server-pushed frame topic registered during negotiation.
pub const TOPIC_IMAGE_PUSH: &str = "viewport.image.push.subscription";

/// View id used by a standalone session ("the whole window").
pub const DEFAULT_VIEW: i64 = -1;

/// Decoded-frame callback. One owned slot per session.
pub type FrameHandler = Box<dyn FnMut(&Raster) + Send>;
/// State-change callback, with the human-readable last error if any.
pub type StateHandler = Box<dyn FnMut(SessionState, Option<&str>) + Send>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── SessionShared ────────────────────────────────────────────────

/// State shared between the public [`Session`] surface, its pump task,
/// and (for registry-managed sessions) the registry's dispatcher.
pub(crate) struct SessionShared {
    id: Uuid,
    config: SessionConfig,
    view_id: i64,
    state_tx: watch::Sender<SessionState>,
    ready_tx: watch::Sender<bool>,
    last_error: StdMutex<Option<String>>,
    frame_handler: StdMutex<Option<FrameHandler>>,
    state_handler: StdMutex<Option<StateHandler>>,
    decoder: StdMutex<StreamDecoder>,
    /// Last requested viewport size; sent with the next negotiation.
    dims: StdMutex<(u32, u32)>,
}

impl SessionShared {
    fn new(config: SessionConfig, view_id: i64) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (ready_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            config,
            view_id,
            state_tx,
            ready_tx,
            last_error: StdMutex::new(None),
            frame_handler: StdMutex::new(None),
            state_handler: StdMutex::new(None),
            decoder: StdMutex::new(StreamDecoder::new()),
            dims: StdMutex::new((0, 0)),
        }
    }

    pub(crate) fn view_id(&self) -> i64 {
        self.view_id
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_error(&self, message: impl Into<String>) {
        *lock(&self.last_error) = Some(message.into());
    }

    /// Publish a new state and notify the handler slot (only on change).
    fn publish(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        let _ = self.ready_tx.send_replace(next.is_ready());
        if previous != next {
            debug!(session = %self.id, view = self.view_id, "{previous} -> {next}");
            let message = lock(&self.last_error).clone();
            if let Some(handler) = lock(&self.state_handler).as_mut() {
                handler(next, message.as_deref());
            }
        }
    }

    /// Apply a validated transition; publish on success.
    fn transition(
        &self,
        apply: impl FnOnce(&mut SessionState) -> Result<(), crate::state::InvalidTransition>,
    ) -> Result<(), crate::state::InvalidTransition> {
        let mut next = self.state();
        apply(&mut next)?;
        self.publish(next);
        Ok(())
    }

    fn hello(&self) -> HelloPayload {
        let (width, height) = *lock(&self.dims);
        HelloPayload {
            application: self.config.application.clone(),
            dataset_ref: self.config.dataset_ref.clone(),
            orientation: self.config.orientation,
            view_kind: self.config.view_kind,
            view_id: self.view_id,
            interactive_quality: self.config.interactive_quality,
            width,
            height,
        }
    }

    // ── Event handling (pump / registry entry points) ────────────

    /// An incoming frame for this session's view.
    ///
    /// Only gates and buffers: the frame lands in the per-view
    /// single-slot buffer and this returns immediately. Decoding and the
    /// `on_frame` callback run in the session's own delivery task, so a
    /// slow consumer never stalls whoever is pumping the connection.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        let accepted = lock(&self.decoder).offer(frame);
        if !accepted {
            return;
        }

        // First frame completes negotiation; any frame recovers a
        // degraded session.
        match self.state() {
            SessionState::Negotiating | SessionState::Degraded => {
                *lock(&self.last_error) = None;
                let _ = self.transition(SessionState::mark_ready);
            }
            _ => {}
        }
    }

    /// A binary message arrived whose frame header would not decode.
    pub(crate) fn handle_malformed(&self, error: &DecodeError) {
        lock(&self.decoder).stats().count_malformed();
        warn!(session = %self.id, "undecodable frame dropped: {error}");
    }

    /// The transport reported an error; the connection may still work.
    pub(crate) fn handle_error(&self, message: &str) {
        self.set_error(message);
        if self.state() == SessionState::Ready {
            let _ = self.transition(SessionState::degrade);
        } else {
            debug!(session = %self.id, "transport error outside Ready: {message}");
        }
    }

    /// An RPC response arrived; hello acks complete negotiation.
    pub(crate) async fn handle_rpc(&self, gateway: &RpcGateway, response: ServerRpc) {
        if response.id == HELLO_REQUEST_ID {
            match response.error {
                Some(message) => {
                    self.set_error(message);
                    let _ = self.transition(SessionState::fail);
                }
                None => {
                    if self.state() == SessionState::Negotiating {
                        let _ = self.transition(SessionState::mark_ready);
                    }
                }
            }
            return;
        }
        gateway.complete(response).await;
    }

    /// The connection is gone (or the caller disconnected).
    ///
    /// Releases the decoder subscription and fails outstanding calls
    /// exactly once; safe to call repeatedly.
    pub(crate) async fn handle_closed(&self, gateway: Option<&RpcGateway>) {
        if self.state() == SessionState::Closed {
            return;
        }
        lock(&self.decoder).unsubscribe(self.view_id);
        if let Some(gateway) = gateway {
            gateway.fail_all(RpcError::ChannelClosed).await;
        }
        self.publish(SessionState::Closed);
    }
}

// ── SessionLink ──────────────────────────────────────────────────

/// Connection-derived handles held only while connected.
struct SessionLink {
    sender: TransportSender,
    gateway: Arc<RpcGateway>,
    /// `None` for registry-managed sessions: the registry owns the
    /// shared connection and this session must not close it.
    closer: Option<TransportCloser>,
    pump: Option<JoinHandle<()>>,
}

impl SessionLink {
    fn teardown(&self) {
        if let Some(closer) = &self.closer {
            closer.close();
        }
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// One remote rendering session.
pub struct Session {
    shared: Arc<SessionShared>,
    link: Mutex<Option<SessionLink>>,
    /// Decodes buffered frames and runs the `on_frame` slot, one task
    /// per connected life, isolated from the connection pump.
    delivery: Mutex<Option<JoinHandle<()>>>,
    /// Registry-managed sessions share the registry's connection.
    attached: bool,
}

impl Session {
    /// Create an unconnected session owning its own connection.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(config, DEFAULT_VIEW)),
            link: Mutex::new(None),
            delivery: Mutex::new(None),
            attached: false,
        }
    }

    /// Create a session multiplexed onto a registry-owned connection.
    pub(crate) fn attached(
        config: SessionConfig,
        view_id: i64,
        sender: TransportSender,
        gateway: Arc<RpcGateway>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(config, view_id)),
            link: Mutex::new(Some(SessionLink {
                sender,
                gateway,
                closer: None,
                pump: None,
            })),
            delivery: Mutex::new(None),
            attached: true,
        }
    }

    pub(crate) fn shared(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    // ── Introspection ────────────────────────────────────────────

    /// Opaque session id.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// The view id frames are multiplexed by.
    pub fn view_id(&self) -> i64 {
        self.shared.view_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Human-readable message from the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Watch the state without registering a callback.
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Frame counters for this session's decoder.
    pub fn stats(&self) -> DecoderStatsSnapshot {
        lock(&self.shared.decoder).stats().snapshot()
    }

    // ── Handlers (single-slot, replacement semantics) ────────────

    /// Register the decoded-frame callback, replacing any previous one.
    pub fn on_frame(&self, handler: impl FnMut(&Raster) + Send + 'static) {
        *lock(&self.shared.frame_handler) = Some(Box::new(handler));
    }

    /// Register the state-change callback, replacing any previous one.
    pub fn on_state_change(&self, handler: impl FnMut(SessionState, Option<&str>) + Send + 'static) {
        *lock(&self.shared.state_handler) = Some(Box::new(handler));
    }

    /// Lazy pull-based alternative to [`Session::on_frame`]: decode the
    /// latest frame on demand.
    pub fn subscribe_frames(&self) -> ViewSubscription {
        lock(&self.shared.decoder).subscribe(self.shared.view_id)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect (or reconnect) and negotiate the rendering session.
    ///
    /// Validates the configuration first — invalid configuration is
    /// rejected without any network I/O. Reconnecting from `Degraded`,
    /// `Closed`, or `Failed` discards stale handles and re-negotiates
    /// from scratch; the session never reconnects on its own.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.shared.config.validate()?;
        self.shared
            .transition(SessionState::begin_connect)
            .map_err(|e| ConnectError::Rejected(e.to_string()))?;

        let mut link_guard = self.link.lock().await;

        // Discard handles from a previous life.
        if !self.attached {
            if let Some(stale) = link_guard.take() {
                stale.teardown();
            }
        }
        let frames = {
            let mut decoder = lock(&self.shared.decoder);
            decoder.reset(self.shared.view_id);
            decoder.subscribe(self.shared.view_id)
        };
        {
            let mut delivery = self.delivery.lock().await;
            if let Some(stale) = delivery.take() {
                stale.abort();
            }
            *delivery = Some(tokio::spawn(run_delivery(
                Arc::clone(&self.shared),
                frames,
            )));
        }

        if self.attached {
            return self.negotiate_attached(&link_guard).await;
        }

        let transport =
            match Transport::connect(&self.shared.config.endpoint, self.shared.config.connect_timeout)
                .await
            {
                Ok(t) => t,
                Err(e) => {
                    self.shared.set_error(e.to_string());
                    let _ = self.shared.transition(SessionState::fail);
                    return Err(e);
                }
            };

        let (sender, events, closer) = transport.split();
        let gateway = Arc::new(RpcGateway::new(
            sender.clone(),
            self.shared.ready_tx.subscribe(),
        ));

        if let Err(e) = self.negotiate(&sender).await {
            closer.close();
            self.shared.set_error(e.to_string());
            let _ = self.shared.transition(SessionState::fail);
            return Err(e);
        }

        let pump = tokio::spawn(run_pump(
            Arc::clone(&self.shared),
            Arc::clone(&gateway),
            events,
        ));
        *link_guard = Some(SessionLink {
            sender,
            gateway,
            closer: Some(closer),
            pump: Some(pump),
        });

        info!(session = %self.shared.id, view = self.shared.view_id, "negotiating");
        Ok(())
    }

    /// Send the hello + frame-topic registration, enter `Negotiating`.
    async fn negotiate(&self, sender: &TransportSender) -> Result<(), ConnectError> {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let hello = ClientMessage::Hello(self.shared.hello());
        sender
            .send(hello)
            .await
            .map_err(|_| ConnectError::Network(WsError::ConnectionClosed))?;
        sender
            .send(ClientMessage::Subscribe {
                topic: TOPIC_IMAGE_PUSH.to_string(),
            })
            .await
            .map_err(|_| ConnectError::Network(WsError::ConnectionClosed))?;

        // Fails when the session was torn down underneath us (the shared
        // connection died mid-registration); the caller must not believe
        // it is connecting.
        self.shared
            .transition(SessionState::negotiated)
            .map_err(|e| ConnectError::Rejected(e.to_string()))?;
        Ok(())
    }

    async fn negotiate_attached(
        &self,
        link_guard: &Option<SessionLink>,
    ) -> Result<(), ConnectError> {
        let Some(link) = link_guard.as_ref() else {
            self.shared.set_error("shared connection is gone");
            let _ = self.shared.transition(SessionState::fail);
            return Err(ConnectError::Rejected("shared connection is gone".into()));
        };
        match self.negotiate(&link.sender).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.set_error(e.to_string());
                let _ = self.shared.transition(SessionState::fail);
                Err(e)
            }
        }
    }

    /// Tear the session down.
    ///
    /// The only cancellation primitive: safe from any state including
    /// mid-connect, and idempotent — resources are released exactly
    /// once, and `Closed` is published at most once per teardown.
    pub async fn disconnect(&self) {
        // Same lock order as connect: link before delivery.
        let link = self.link.lock().await.take();
        if let Some(delivery) = self.delivery.lock().await.take() {
            delivery.abort();
        }
        match link {
            Some(link) => {
                link.teardown();
                // A registry-managed session shares its gateway with the
                // other views; failing its pending calls here would fail
                // theirs too.
                let own_gateway = (!self.attached).then_some(link.gateway.as_ref());
                self.shared.handle_closed(own_gateway).await;
            }
            None => self.shared.handle_closed(None).await,
        }
    }

    // ── Remote operations ────────────────────────────────────────

    /// Invoke a server-defined method. Fails fast with
    /// [`RpcError::NotReady`] unless the session is `Ready`.
    pub async fn invoke_remote(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let gateway = self.ready_gateway().await?;
        gateway.invoke(method, args).await
    }

    /// Ask the server to push a fresh image for this view.
    pub async fn render(&self) -> Result<Value, RpcError> {
        let gateway = self.ready_gateway().await?;
        gateway
            .invoke(METHOD_IMAGE_PUSH, vec![json!({ "view": self.shared.view_id })])
            .await
    }

    /// Record the viewport size; when connected, also request a remote
    /// re-render at the new size. When not connected the size is kept
    /// and sent with the next negotiation — nothing is queued.
    pub async fn resize(&self, width: u32, height: u32) -> Result<(), RpcError> {
        *lock(&self.shared.dims) = (width, height);
        let Ok(gateway) = self.ready_gateway().await else {
            return Ok(());
        };
        gateway
            .notify(
                METHOD_SIZE_UPDATE,
                vec![json!(self.shared.view_id), json!(width), json!(height)],
            )
            .await
    }

    /// Forward a mouse interaction event.
    pub async fn send_interaction(&self, event: Value) -> Result<(), RpcError> {
        let gateway = self.ready_gateway().await?;
        gateway.notify(METHOD_MOUSE_INTERACTION, vec![event]).await
    }

    /// Forward a wheel zoom event.
    pub async fn zoom_wheel(&self, delta: f64) -> Result<(), RpcError> {
        let gateway = self.ready_gateway().await?;
        gateway
            .notify(METHOD_MOUSE_ZOOM_WHEEL, vec![json!(delta)])
            .await
    }

    async fn ready_gateway(&self) -> Result<Arc<RpcGateway>, RpcError> {
        if !self.shared.state().is_ready() {
            return Err(RpcError::NotReady);
        }
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| Arc::clone(&link.gateway))
            .ok_or(RpcError::NotReady)
    }
}

// ── Pump ─────────────────────────────────────────────────────────

/// Drive transport events into the session until the connection ends.
async fn run_pump(shared: Arc<SessionShared>, gateway: Arc<RpcGateway>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Rpc(response) => shared.handle_rpc(&gateway, response).await,
            TransportEvent::Frame(frame) => shared.handle_frame(frame),
            TransportEvent::Malformed(error) => shared.handle_malformed(&error),
            TransportEvent::Error(message) => shared.handle_error(&message),
            TransportEvent::Closed => break,
        }
    }
    shared.handle_closed(Some(&gateway)).await;
}

/// Decode buffered frames and run the `on_frame` slot.
///
/// One per connected session, consuming its single-slot buffer: a slow
/// handler here only backs up its own view, never the connection pump
/// or sibling views. Ends when the view is unsubscribed.
async fn run_delivery(shared: Arc<SessionShared>, mut frames: ViewSubscription) {
    while let Some(raster) = frames.next_raster().await {
        if let Some(handler) = lock(&shared.frame_handler).as_mut() {
            handler(&raster);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
