//! Multi-view multiplexing over one shared connection.
//!
//! The registry owns a single transport and fans incoming frames out to
//! registered sessions by view id. Sessions attached through the
//! registry never close the shared connection themselves; only
//! [`SessionRegistry::shutdown`] does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{DEFAULT_CONNECT_TIMEOUT, Orientation, SessionConfig, ViewKind};
use crate::error::{ConnectError, RpcError};
use crate::rpc::RpcGateway;
use crate::session::{Session, SessionShared};
use crate::state::SessionState;
use crate::transport::{EventReceiver, Transport, TransportCloser, TransportEvent, TransportSender};
use crate::wire::HELLO_REQUEST_ID;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Router = Arc<StdMutex<HashMap<i64, Arc<SessionShared>>>>;

/// Connection-derived handles held while the shared link is up.
struct RegistryLink {
    sender: TransportSender,
    gateway: Arc<RpcGateway>,
    /// `None` only for channel-backed test links.
    closer: Option<TransportCloser>,
    pump: JoinHandle<()>,
    _ready_tx: watch::Sender<bool>,
}

/// Registry of named sessions multiplexed onto one connection.
///
/// Keys are caller-chosen (e.g. `"axial"`). Registering under an
/// existing key tears the old session down completely before the new
/// one begins connecting. View ids are assigned 1, 2, 3, … in
/// registration order; frames for ids nobody holds are dropped and
/// counted.
pub struct SessionRegistry {
    endpoint: String,
    connect_timeout: Duration,
    link: Mutex<Option<RegistryLink>>,
    router: Router,
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
    next_view: AtomicI64,
    dropped: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            link: Mutex::new(None),
            router: Arc::new(StdMutex::new(HashMap::new())),
            sessions: StdMutex::new(HashMap::new()),
            next_view: AtomicI64::new(1),
            dropped: Arc::new(AtomicU64::new(0)),
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Register a session under `key` and start connecting it.
    ///
    /// Dials the shared connection on first use. A session already
    /// registered under `key` is fully torn down (its `Closed`
    /// notification fires) before the replacement starts.
    pub async fn register(
        &self,
        key: &str,
        config: SessionConfig,
    ) -> Result<Arc<Session>, ConnectError> {
        let (sender, gateway) = self.ensure_connected().await?;

        let previous = lock(&self.sessions).remove(key);
        if let Some(previous) = previous {
            lock(&self.router).remove(&previous.view_id());
            previous.disconnect().await;
        }

        let view_id = self.next_view.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::attached(config, view_id, sender, gateway));
        lock(&self.router).insert(view_id, session.shared());

        if let Err(e) = session.connect().await {
            lock(&self.router).remove(&view_id);
            return Err(e);
        }

        info!(key, view = view_id, "session registered");
        lock(&self.sessions).insert(key.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Tear down and forget the session under `key`, if any.
    pub async fn unregister(&self, key: &str) {
        let session = lock(&self.sessions).remove(key);
        if let Some(session) = session {
            lock(&self.router).remove(&session.view_id());
            session.disconnect().await;
            debug!(key, view = session.view_id(), "session unregistered");
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(key).map(Arc::clone)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.sessions).keys().cloned().collect()
    }

    /// Frames dropped because no session held their view id.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Binary messages dropped because their frame header would not
    /// decode (they carry no routable view id).
    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Register the standard four-view layout: three MPR slices plus a
    /// volume rendering, under the keys `"axial"`, `"sagittal"`,
    /// `"coronal"`, and `"volume"`.
    pub async fn register_four_view(&self, base: SessionConfig) -> Result<FourView, ConnectError> {
        let mpr = |orientation: Orientation| {
            let mut config = base.clone();
            config.view_kind = ViewKind::Mpr;
            config.orientation = orientation;
            config
        };
        let axial = self.register("axial", mpr(Orientation::Axial)).await?;
        let sagittal = self.register("sagittal", mpr(Orientation::Sagittal)).await?;
        let coronal = self.register("coronal", mpr(Orientation::Coronal)).await?;

        let mut volume_config = base;
        volume_config.view_kind = ViewKind::VolumeRender;
        volume_config.orientation = Orientation::None;
        let volume = self.register("volume", volume_config).await?;

        Ok(FourView {
            axial,
            sagittal,
            coronal,
            volume,
        })
    }

    /// Tear down every session and close the shared connection.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> =
            lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.disconnect().await;
        }
        lock(&self.router).clear();
        if let Some(link) = self.link.lock().await.take() {
            if let Some(closer) = &link.closer {
                closer.close();
            }
            // The pump exits on the resulting Closed event.
        }
    }

    /// Dial the shared connection if it is not up, redialing if a
    /// previous one died.
    async fn ensure_connected(
        &self,
    ) -> Result<(TransportSender, Arc<RpcGateway>), ConnectError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if !link.pump.is_finished() {
                return Ok((link.sender.clone(), Arc::clone(&link.gateway)));
            }
        }
        if let Some(stale) = guard.take() {
            if let Some(closer) = &stale.closer {
                closer.close();
            }
            stale.pump.abort();
        }

        let transport = Transport::connect(&self.endpoint, self.connect_timeout).await?;
        let (sender, events, closer) = transport.split();
        let (ready_tx, ready_rx) = watch::channel(true);
        let gateway = Arc::new(RpcGateway::new(sender.clone(), ready_rx));
        let pump = tokio::spawn(run_registry_pump(
            Arc::clone(&self.router),
            Arc::clone(&self.dropped),
            Arc::clone(&self.malformed),
            Arc::clone(&gateway),
            events,
        ));
        *guard = Some(RegistryLink {
            sender: sender.clone(),
            gateway: Arc::clone(&gateway),
            closer: Some(closer),
            pump,
            _ready_tx: ready_tx,
        });
        info!(endpoint = %self.endpoint, "shared connection established");
        Ok((sender, gateway))
    }

    /// Wire the registry onto pre-built channels instead of a socket.
    #[cfg(test)]
    async fn attach_test_link(
        &self,
        sender: TransportSender,
        events: EventReceiver,
    ) -> Arc<RpcGateway> {
        let (ready_tx, ready_rx) = watch::channel(true);
        let gateway = Arc::new(RpcGateway::new(sender.clone(), ready_rx));
        let pump = tokio::spawn(run_registry_pump(
            Arc::clone(&self.router),
            Arc::clone(&self.dropped),
            Arc::clone(&self.malformed),
            Arc::clone(&gateway),
            events,
        ));
        *self.link.lock().await = Some(RegistryLink {
            sender,
            gateway: Arc::clone(&gateway),
            closer: None,
            pump,
            _ready_tx: ready_tx,
        });
        gateway
    }
}

/// The standard four-view layout returned by
/// [`SessionRegistry::register_four_view`].
pub struct FourView {
    pub axial: Arc<Session>,
    pub sagittal: Arc<Session>,
    pub coronal: Arc<Session>,
    pub volume: Arc<Session>,
}

impl FourView {
    /// All four sessions in layout order.
    pub fn all(&self) -> [&Arc<Session>; 4] {
        [&self.axial, &self.sagittal, &self.coronal, &self.volume]
    }
}

/// Drive shared-connection events into the registered sessions.
async fn run_registry_pump(
    router: Router,
    dropped: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    gateway: Arc<RpcGateway>,
    mut events: EventReceiver,
) {
    while let Some(event) = events.recv().await {
        match event {
            // Negotiation acks carry the shared id; every session still
            // negotiating is waiting on one.
            TransportEvent::Rpc(response) if response.id == HELLO_REQUEST_ID => {
                let negotiating: Vec<Arc<SessionShared>> = lock(&router)
                    .values()
                    .filter(|shared| shared.state() == SessionState::Negotiating)
                    .map(Arc::clone)
                    .collect();
                for shared in negotiating {
                    shared.handle_rpc(&gateway, response.clone()).await;
                }
            }
            TransportEvent::Rpc(response) => gateway.complete(response).await,
            TransportEvent::Frame(frame) => {
                let target = lock(&router).get(&frame.view_id).map(Arc::clone);
                match target {
                    Some(shared) => shared.handle_frame(frame),
                    None => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(view = frame.view_id, "frame for unregistered view dropped");
                    }
                }
            }
            TransportEvent::Malformed(error) => {
                malformed.fetch_add(1, Ordering::Relaxed);
                debug!("undecodable frame dropped: {error}");
            }
            TransportEvent::Error(message) => {
                let registered: Vec<Arc<SessionShared>> =
                    lock(&router).values().map(Arc::clone).collect();
                for shared in registered {
                    shared.handle_error(&message);
                }
            }
            TransportEvent::Closed => break,
        }
    }

    gateway.fail_all(RpcError::ChannelClosed).await;
    let registered: Vec<Arc<SessionShared>> =
        { lock(&router).drain().map(|(_, shared)| shared).collect() };
    for shared in registered {
        shared.handle_closed(None).await;
    }
}
