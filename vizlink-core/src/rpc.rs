//! RPC gateway.
//!
//! Wraps the transport's outbound channel to expose typed remote
//! procedure calls correlated by request id. Ids are allocated from an
//! atomic counter and never reused. The gateway does no queueing and no
//! ordering across calls — callers that need ordering await one call
//! before issuing the next.
//!
//! Responses arrive out-of-band: whoever pumps the connection feeds them
//! back through [`RpcGateway::complete`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::debug;

use crate::error::RpcError;
use crate::transport::TransportSender;
use crate::wire::{ClientMessage, ServerRpc};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Resolver = oneshot::Sender<Result<Value, RpcError>>;

/// Typed remote calls and topic subscriptions over one connection.
pub struct RpcGateway {
    outbound: TransportSender,
    /// Outstanding calls keyed by request id. Exactly one resolution each.
    pending: Mutex<HashMap<u64, Resolver>>,
    /// Next request id. Starts above [`crate::wire::HELLO_REQUEST_ID`].
    next_id: AtomicU64,
    /// Link readiness; calls fail fast with `NotReady` while false.
    ready: watch::Receiver<bool>,
    call_timeout: Duration,
}

impl RpcGateway {
    /// Create a gateway over `outbound`, gated by `ready`.
    pub fn new(outbound: TransportSender, ready: watch::Receiver<bool>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ready,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Invoke a remote method and await its result.
    ///
    /// Fails fast with [`RpcError::NotReady`] while the link is not ready
    /// — nothing touches the network in that case. A response that never
    /// arrives resolves to [`RpcError::Timeout`] and the id is retired.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if !*self.ready.borrow() {
            return Err(RpcError::NotReady);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let call = ClientMessage::Call {
            id,
            method: method.to_string(),
            args,
        };
        if self.outbound.send(call).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::ChannelClosed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Resolver dropped without an answer: the link died.
            Ok(Err(_)) => Err(RpcError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RpcError::Timeout(self.call_timeout))
            }
        }
    }

    /// Invoke a remote method without tracking a response.
    ///
    /// Used for high-frequency interaction events (mouse, resize) where
    /// awaiting every ack would serialize the stream.
    pub async fn notify(&self, method: &str, args: Vec<Value>) -> Result<(), RpcError> {
        if !*self.ready.borrow() {
            return Err(RpcError::NotReady);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = ClientMessage::Call {
            id,
            method: method.to_string(),
            args,
        };
        self.outbound
            .send(call)
            .await
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// Fire-and-forget registration for a server-pushed topic.
    pub async fn subscribe(&self, topic: &str) -> Result<(), RpcError> {
        self.outbound
            .send(ClientMessage::Subscribe {
                topic: topic.to_string(),
            })
            .await
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// Resolve one outstanding call from a server response.
    ///
    /// Responses for unknown ids (timed out, or notify-style calls) are
    /// dropped with a diagnostic.
    pub async fn complete(&self, response: ServerRpc) {
        let Some(resolver) = self.pending.lock().await.remove(&response.id) else {
            debug!(id = response.id, "response for unknown request id dropped");
            return;
        };
        let outcome = match response.error {
            Some(message) => Err(RpcError::Remote(message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = resolver.send(outcome);
    }

    /// Fail every outstanding call with `error`. Called on teardown.
    pub async fn fail_all(&self, error: RpcError) {
        let resolvers: Vec<Resolver> = self.pending.lock().await.drain().map(|(_, r)| r).collect();
        for resolver in resolvers {
            let _ = resolver.send(Err(error.clone()));
        }
    }

    /// Number of in-flight calls.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn gateway(
        ready: bool,
    ) -> (RpcGateway, mpsc::Receiver<ClientMessage>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = watch::channel(ready);
        (RpcGateway::new(tx, ready_rx), rx, ready_tx)
    }

    #[tokio::test]
    async fn invoke_not_ready_fails_fast_without_io() {
        let (gw, mut rx, _ready) = gateway(false);
        let err = gw.invoke("render", vec![]).await.unwrap_err();
        assert_eq!(err, RpcError::NotReady);
        // Nothing was sent.
        assert!(rx.try_recv().is_err());
        assert_eq!(gw.pending_count().await, 0);
    }

    #[tokio::test]
    async fn invoke_resolves_with_result() {
        let (gw, mut rx, _ready) = gateway(true);
        let invoke = gw.invoke("echo", vec![json!(2)]);
        tokio::pin!(invoke);

        // Drive the call until it hits the wire, then answer it.
        let msg = tokio::select! {
            m = rx.recv() => m.unwrap(),
            _ = &mut invoke => panic!("resolved before response"),
        };
        let ClientMessage::Call { id, method, args } = msg else {
            panic!("expected call");
        };
        assert_eq!(method, "echo");
        assert_eq!(args, vec![json!(2)]);
        assert_eq!(id, 1);
        gw.complete(ServerRpc {
            id,
            result: Some(json!({"ok": true})),
            error: None,
        })
        .await;

        let value = invoke.await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(gw.pending_count().await, 0);
    }

    #[tokio::test]
    async fn invoke_maps_server_error() {
        let (gw, mut rx, _ready) = gateway(true);
        let invoke = gw.invoke("bad", vec![]);
        tokio::pin!(invoke);

        let msg = tokio::select! {
            m = rx.recv() => m.unwrap(),
            _ = &mut invoke => panic!("resolved before response"),
        };
        let ClientMessage::Call { id, .. } = msg else {
            panic!("expected call");
        };
        gw.complete(ServerRpc {
            id,
            result: None,
            error: Some("no such method".into()),
        })
        .await;

        assert_eq!(
            invoke.await.unwrap_err(),
            RpcError::Remote("no such method".into())
        );
    }

    #[tokio::test]
    async fn invoke_times_out_and_retires_id() {
        let (tx, _rx) = mpsc::channel(16);
        let (_ready_tx, ready_rx) = watch::channel(true);
        let gw = RpcGateway::new(tx, ready_rx).with_call_timeout(Duration::from_millis(20));

        let err = gw.invoke("slow", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(gw.pending_count().await, 0);

        // A late response for the retired id is dropped silently.
        gw.complete(ServerRpc {
            id: 1,
            result: Some(json!(null)),
            error: None,
        })
        .await;
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let (gw, mut rx, _ready) = gateway(true);
        gw.notify("a", vec![]).await.unwrap();
        gw.notify("b", vec![]).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let (ClientMessage::Call { id: id1, .. }, ClientMessage::Call { id: id2, .. }) =
            (first, second)
        else {
            panic!("expected calls");
        };
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn fail_all_resolves_everything() {
        let (gw, mut rx, _ready) = gateway(true);
        let invoke = gw.invoke("stuck", vec![]);
        tokio::pin!(invoke);

        tokio::select! {
            _ = rx.recv() => {}
            _ = &mut invoke => panic!("resolved early"),
        };
        gw.fail_all(RpcError::ChannelClosed).await;
        assert_eq!(invoke.await.unwrap_err(), RpcError::ChannelClosed);
    }

    #[tokio::test]
    async fn subscribe_is_fire_and_forget() {
        let (gw, mut rx, _ready) = gateway(false); // works even before ready
        gw.subscribe("viewport.image.push.subscription").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                topic: "viewport.image.push.subscription".into()
            }
        );
    }
}
