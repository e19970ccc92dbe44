//! Integration tests for the realtime channel.
//!
//! These tests start an actual WebSocket server in-process and drive the
//! channel's public API against it: authenticated handshake, event
//! delivery both ways, heartbeat and reconnection behavior.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use fleettrack_channel::{BackoffPolicy, ChannelConfig, ChannelError, ChannelState, RealtimeChannel};
use fleettrack_protocol::{decode_envelope, events, Envelope, LocationReport};
use fleettrack_core::VehicleStatus;

/// Behavior knobs for the in-process test server.
#[derive(Debug, Clone)]
struct ServerBehavior {
    /// Answer application-level pings with pong envelopes.
    auto_pong: bool,
    /// Reject every handshake with this HTTP status.
    reject_with: Option<u16>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            auto_pong: true,
            reject_with: None,
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    /// Text frames received from any client, in arrival order.
    inbound_rx: mpsc::UnboundedReceiver<String>,
    /// Broadcasts a text frame to every connected client.
    outbound_tx: broadcast::Sender<String>,
    /// Authorization header observed per handshake.
    auth_rx: mpsc::UnboundedReceiver<Option<String>>,
    /// Number of handshake attempts so far.
    connections: Arc<AtomicUsize>,
}

/// Start a WebSocket server on an ephemeral port.
async fn start_server(behavior: ServerBehavior) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, _) = broadcast::channel::<String>(64);
    let (auth_tx, auth_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));

    let accept_outbound = outbound_tx.clone();
    let accept_connections = connections.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            accept_connections.fetch_add(1, Ordering::SeqCst);

            let behavior = behavior.clone();
            let inbound_tx = inbound_tx.clone();
            let auth_tx = auth_tx.clone();
            let mut outbound_rx = accept_outbound.subscribe();

            tokio::spawn(async move {
                let reject_with = behavior.reject_with;
                let ws = tokio_tungstenite::accept_hdr_async(
                    stream,
                    move |req: &Request, resp: Response| {
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        let _ = auth_tx.send(auth);

                        if let Some(status) = reject_with {
                            let mut err = ErrorResponse::new(None);
                            *err.status_mut() = StatusCode::from_u16(status).unwrap();
                            return Err(err);
                        }
                        Ok(resp)
                    },
                )
                .await;

                let ws = match ws {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut ws_tx, mut ws_rx) = ws.split();

                loop {
                    tokio::select! {
                        msg = ws_rx.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if behavior.auto_pong {
                                        if let Ok(envelope) = decode_envelope(&text) {
                                            if envelope.event == events::PING {
                                                let pong = r#"{"event":"pong","data":{"timestamp":0}}"#;
                                                let _ = ws_tx.send(Message::Text(pong.to_string())).await;
                                            }
                                        }
                                    }
                                    let _ = inbound_tx.send(text);
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = ws_tx.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) => break,
                            }
                        }
                        out = outbound_rx.recv() => {
                            match out {
                                Ok(text) => {
                                    if ws_tx.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                                Err(broadcast::error::RecvError::Lagged(_)) => {}
                            }
                        }
                    }
                }
            });
        }
    });

    TestServer {
        addr,
        inbound_rx,
        outbound_tx,
        auth_rx,
        connections,
    }
}

fn config_for(addr: SocketAddr) -> ChannelConfig {
    ChannelConfig {
        connect_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        },
        ..ChannelConfig::new(format!("ws://{}/tracking/stream", addr))
    }
}

/// Wait for the next frame received by the server, with a margin.
async fn recv_frame(server: &mut TestServer) -> String {
    timeout(Duration::from_secs(5), server.inbound_rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("server channel closed")
}

#[tokio::test]
async fn test_connect_sends_bearer_token() {
    let mut server = start_server(ServerBehavior::default()).await;
    let channel = RealtimeChannel::new(config_for(server.addr));

    channel.connect("token-123").await.expect("connect");
    assert_eq!(channel.state(), ChannelState::Connected);

    let auth = timeout(Duration::from_secs(5), server.auth_rx.recv())
        .await
        .expect("timed out waiting for handshake")
        .expect("server channel closed");
    assert_eq!(auth.as_deref(), Some("Bearer token-123"));
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let server = start_server(ServerBehavior::default()).await;
    let channel = RealtimeChannel::new(config_for(server.addr));

    channel.connect("token").await.expect("first connect");
    channel.connect("token").await.expect("second connect");

    // A second connect while connected must not open another session.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_auth_rejection_is_typed_and_not_retried() {
    let server = start_server(ServerBehavior {
        reject_with: Some(401),
        ..ServerBehavior::default()
    })
    .await;
    let channel = RealtimeChannel::new(config_for(server.addr));

    let result = channel.connect("expired-token").await;
    assert!(matches!(result, Err(ChannelError::AuthRejected)));

    // The channel parks in backoff for a caller-driven token refresh; it
    // must not burn the retry budget on a token that cannot work.
    assert!(matches!(channel.state(), ChannelState::Backoff { attempt: 0, .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_delivers_envelope() {
    let mut server = start_server(ServerBehavior::default()).await;
    let channel = RealtimeChannel::new(config_for(server.addr));
    channel.connect("token").await.expect("connect");

    let report = LocationReport {
        vehicle_id: "vehicle-1".to_string(),
        latitude: 52.1,
        longitude: 4.9,
        speed: Some(12.0),
        heading: None,
        status: VehicleStatus::OnTrip,
        timestamp: 1_700_000_000_000,
    };
    channel
        .send(events::UPDATE_VEHICLE_LOCATION, &report)
        .expect("send");

    let frame = recv_frame(&mut server).await;
    let envelope = decode_envelope(&frame).unwrap();
    assert_eq!(envelope.event, events::UPDATE_VEHICLE_LOCATION);
    let received: LocationReport = envelope.payload().unwrap();
    assert_eq!(received, report);
}

#[tokio::test]
async fn test_inbound_events_reach_subscribed_handlers() {
    let server = start_server(ServerBehavior::default()).await;
    let channel = RealtimeChannel::new(config_for(server.addr));

    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    channel.subscribe(events::LOCATION_UPDATE, move |data| {
        let _ = update_tx.send(data);
    });

    channel.connect("token").await.expect("connect");

    let frame = serde_json::json!({
        "event": "locationUpdate",
        "data": {
            "vehicleId": "vehicle-1",
            "coords": {"latitude": 52.1, "longitude": 4.9},
            "status": "on_trip",
            "emittedAt": 1_700_000_000_000i64
        }
    });
    server.outbound_tx.send(frame.to_string()).unwrap();

    let data = timeout(Duration::from_secs(5), update_rx.recv())
        .await
        .expect("timed out waiting for dispatch")
        .expect("handler channel closed");
    assert_eq!(data["vehicleId"], "vehicle-1");
    assert_eq!(data["coords"]["latitude"], 52.1);
}

#[tokio::test]
async fn test_heartbeat_ping_keeps_session_alive() {
    let mut server = start_server(ServerBehavior::default()).await;

    let config = ChannelConfig {
        heartbeat_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(300),
        ..config_for(server.addr)
    };
    let channel = RealtimeChannel::new(config);
    channel.connect("token").await.expect("connect");

    // The channel emits an application-level ping on its own schedule.
    let frame = recv_frame(&mut server).await;
    let envelope = decode_envelope(&frame).unwrap();
    assert_eq!(envelope.event, events::PING);

    // The server answers pongs, so several heartbeat cycles later the
    // session is still up.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(channel.state(), ChannelState::Connected);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_pong_forces_reconnect() {
    let server = start_server(ServerBehavior {
        auto_pong: false,
        ..ServerBehavior::default()
    })
    .await;

    let config = ChannelConfig {
        heartbeat_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(100),
        ..config_for(server.addr)
    };
    let channel = RealtimeChannel::new(config);
    channel.connect("token").await.expect("connect");

    // No pong ever arrives: the channel must declare the link dead and
    // reconnect, which shows up as a second handshake on the server.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if server.connections.load(Ordering::SeqCst) >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel never reconnected"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_connection_refused_exhausts_budget() {
    // Grab an ephemeral port, then close the listener so connects are
    // refused immediately.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ChannelConfig {
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: 3,
        },
        ..ChannelConfig::new(format!("ws://{}/tracking/stream", addr))
    };
    let channel = RealtimeChannel::new(config);

    let result = channel.connect("token").await;
    assert!(matches!(
        result,
        Err(ChannelError::ConnectionFailed { attempts: 3 })
    ));
    assert_eq!(channel.state(), ChannelState::Failed);
}

#[tokio::test]
async fn test_disconnect_is_immediate() {
    let server = start_server(ServerBehavior::default()).await;
    let channel = RealtimeChannel::new(config_for(server.addr));
    channel.connect("token").await.expect("connect");

    channel.disconnect();
    assert_eq!(channel.state(), ChannelState::Disconnected);

    let result = channel.send(events::PING, &serde_json::json!({"timestamp": 0}));
    assert!(matches!(result, Err(ChannelError::NotConnected)));
}

#[tokio::test]
async fn test_state_watch_observes_transitions() {
    let server = start_server(ServerBehavior::default()).await;
    let channel = RealtimeChannel::new(config_for(server.addr));
    let mut state_rx = channel.watch_state();

    assert_eq!(*state_rx.borrow(), ChannelState::Disconnected);

    channel.connect("token").await.expect("connect");

    // The watch converges on Connected even if intermediate transitions
    // were conflated.
    let connected = timeout(Duration::from_secs(5), async {
        loop {
            if *state_rx.borrow_and_update() == ChannelState::Connected {
                return;
            }
            if state_rx.changed().await.is_err() {
                panic!("state channel closed");
            }
        }
    })
    .await;
    assert!(connected.is_ok());
}
