//! Integration tests — full session lifecycle, frame delivery, and
//! error scenarios against a real WebSocket server on localhost.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use vizlink_core::{
    Frame, FrameEncoding, RpcError, Session, SessionConfig, SessionRegistry, SessionState,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Bind a listener on an OS-assigned port and return its ws:// endpoint.
async fn ephemeral_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

/// Next text message from the client, parsed as JSON. Skips pings.
async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match ws.next().await.expect("socket closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

fn ack(id: u64) -> Message {
    Message::text(json!({ "id": id, "result": "ok" }).to_string())
}

fn frame_msg(view_id: i64, sequence: u64) -> Message {
    let frame = Frame {
        view_id,
        sequence,
        width: 2,
        height: 2,
        encoding: FrameEncoding::Raw,
        payload: vec![0xAA; 2 * 2 * 4].into(),
    };
    Message::binary(frame.encode())
}

/// Wait until the session settles in `want`.
async fn wait_for_state(session: &Session, want: SessionState) {
    let mut rx = session.state_receiver();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want}, still {}", session.state()));
}

/// Poll until `cond` holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Session lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_session_lifecycle_to_ready() {
    let (listener, endpoint) = ephemeral_server().await;
    let session = Session::new(SessionConfig::new("cone", &endpoint));
    let mut frames = session.subscribe_frames();

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;

        let hello = next_json(&mut ws).await;
        assert_eq!(hello["kind"], "hello");
        assert_eq!(hello["application"], "cone");
        assert_eq!(hello["view_id"], -1);

        let subscribe = next_json(&mut ws).await;
        assert_eq!(subscribe["kind"], "subscribe");
        assert_eq!(subscribe["topic"], "viewport.image.push.subscription");

        ws.send(ack(0)).await.unwrap();
        ws.send(frame_msg(-1, 1)).await.unwrap();

        // Answer one render call.
        let call = next_json(&mut ws).await;
        assert_eq!(call["kind"], "call");
        assert_eq!(call["method"], "viewport.image.push");
        let id = call["id"].as_u64().unwrap();
        ws.send(Message::text(
            json!({ "id": id, "result": { "size": [2, 2] } }).to_string(),
        ))
        .await
        .unwrap();
        ws
    });

    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Ready).await;

    let raster = tokio::time::timeout(Duration::from_secs(5), frames.next_raster())
        .await
        .unwrap()
        .unwrap();
    assert_eq!((raster.width, raster.height), (2, 2));
    assert_eq!(raster.data.len(), 16);

    let result = session.render().await.unwrap();
    assert_eq!(result["size"], json!([2, 2]));

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);

    let ws = server.await.unwrap();
    drop(ws);
}

#[tokio::test]
async fn test_reconnect_after_connection_loss() {
    let (listener, endpoint) = ephemeral_server().await;
    let session = Session::new(SessionConfig::new("cone", &endpoint));
    let (drop_tx, drop_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        // First life.
        let mut ws = accept_ws(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        ws.send(ack(0)).await.unwrap();
        drop_rx.await.unwrap();
        drop(ws);

        // Second life.
        let mut ws = accept_ws(&listener).await;
        let hello = next_json(&mut ws).await;
        assert_eq!(hello["kind"], "hello");
        next_json(&mut ws).await;
        ws.send(ack(0)).await.unwrap();
        ws
    });

    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Ready).await;

    // Server drops the connection; the session closes but keeps its
    // configuration for an explicit reconnect.
    drop_tx.send(()).unwrap();
    wait_for_state(&session, SessionState::Closed).await;

    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Ready).await;

    let ws = server.await.unwrap();
    drop(ws);
    session.disconnect().await;
}

#[tokio::test]
async fn test_hello_rejection_fails_session() {
    let (listener, endpoint) = ephemeral_server().await;
    let session = Session::new(SessionConfig::new("bogus", &endpoint));

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        ws.send(Message::text(
            json!({ "id": 0, "error": "unknown application" }).to_string(),
        ))
        .await
        .unwrap();
        // Stay open until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    session.connect().await.unwrap();
    wait_for_state(&session, SessionState::Failed).await;
    assert_eq!(session.last_error().as_deref(), Some("unknown application"));
    assert_eq!(
        session.render().await.unwrap_err(),
        RpcError::NotReady,
        "failed session must fail fast"
    );

    session.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_calls_fail_fast_before_ready() {
    let (listener, endpoint) = ephemeral_server().await;
    let session = Session::new(SessionConfig::new("cone", &endpoint));

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        // Never ack; the session stays Negotiating.
        while let Some(Ok(_)) = ws.next().await {}
    });

    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Negotiating);
    assert_eq!(session.render().await.unwrap_err(), RpcError::NotReady);

    session.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_stale_frames_are_dropped() {
    let (listener, endpoint) = ephemeral_server().await;
    let session = Session::new(SessionConfig::new("cone", &endpoint));

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        ws.send(ack(0)).await.unwrap();
        // Out-of-order delivery: 2, then stale 1, then 3.
        ws.send(frame_msg(-1, 2)).await.unwrap();
        ws.send(frame_msg(-1, 1)).await.unwrap();
        ws.send(frame_msg(-1, 3)).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    session.connect().await.unwrap();
    wait_until(|| session.stats().accepted == 2).await;
    assert_eq!(session.stats().stale, 1);

    session.disconnect().await;
    server.await.unwrap();
}

// ── Registry over one shared connection ──────────────────────────

#[tokio::test]
async fn test_registry_multiplexes_views() {
    let (listener, endpoint) = ephemeral_server().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;

        let hello = next_json(&mut ws).await;
        assert_eq!(hello["view_id"], 1);
        next_json(&mut ws).await; // subscribe

        let hello = next_json(&mut ws).await;
        assert_eq!(hello["view_id"], 2);
        next_json(&mut ws).await; // subscribe

        ws.send(ack(0)).await.unwrap();
        ws.send(frame_msg(2, 1)).await.unwrap();
        ws.send(frame_msg(99, 1)).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let registry = SessionRegistry::new(&endpoint);
    let axial = registry
        .register("axial", SessionConfig::new("mpr", &endpoint))
        .await
        .unwrap();
    let volume = registry
        .register("volume", SessionConfig::new("volume", &endpoint))
        .await
        .unwrap();

    wait_for_state(&axial, SessionState::Ready).await;
    wait_for_state(&volume, SessionState::Ready).await;

    wait_until(|| volume.stats().accepted == 1).await;
    wait_until(|| registry.dropped_frames() == 1).await;
    assert_eq!(axial.stats().accepted, 0);

    registry.shutdown().await;
    assert_eq!(axial.state(), SessionState::Closed);
    assert_eq!(volume.state(), SessionState::Closed);
    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused_reports_network_error() {
    // Nothing listens on this port.
    let session = Session::new(SessionConfig::new("cone", "ws://127.0.0.1:1/ws"));
    let err = session.connect().await.unwrap_err();
    assert!(
        matches!(
            err,
            vizlink_core::ConnectError::Network(_) | vizlink_core::ConnectError::Timeout(_)
        ),
        "unexpected error: {err}"
    );
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.last_error().is_some());
}
