//! The realtime tracking channel.
//!
//! A persistent, authenticated, auto-reconnecting duplex event channel over
//! WebSocket. The channel owns its connection state exclusively; callers
//! observe it through a watch and react, they never mutate it.
//!
//! Outbound application events are fire-and-forget: `send` succeeds only
//! while connected and the channel never buffers application events across
//! disconnects. Offline queuing belongs to the producers, which park
//! undelivered events in the durable pending queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, info, warn};

use fleettrack_protocol::codec::{decode_envelope, encode_envelope, CodecError, Envelope};
use fleettrack_protocol::messages::{events, Heartbeat};

use crate::backoff::BackoffPolicy;

/// Errors surfaced by the channel to its callers.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is not connected; the caller is responsible for queuing.
    #[error("Channel is not connected")]
    NotConnected,

    /// The server rejected the handshake token. A refreshed token and a new
    /// `connect` call are required; the channel does not retry on its own.
    #[error("Authentication rejected by server")]
    AuthRejected,

    /// The retry budget was exhausted without reaching the connected state.
    #[error("Connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },

    /// A bounded wait elapsed before the connection was established.
    #[error("Timed out while connecting")]
    Timeout,

    /// The endpoint could not be turned into a handshake request.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Message encoding/decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Transport-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] WsError),
}

/// Connection state, owned exclusively by the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Waiting out a reconnect delay after a failure. `attempt` counts
    /// consecutive failures since the last connected state.
    Backoff { attempt: u32, next_retry_at: Instant },
    /// Retry budget exhausted; a fresh `connect` call is required.
    Failed,
}

impl ChannelState {
    /// Whether `connect` would be a no-op in this state.
    fn is_active(&self) -> bool {
        matches!(
            self,
            ChannelState::Connecting | ChannelState::Authenticating | ChannelState::Connected
        )
    }
}

/// Configuration injected by the composition root.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint, e.g. `ws://host:port/tracking/stream`.
    pub endpoint: String,
    /// Bound on each TCP connect / handshake step.
    pub connect_timeout: Duration,
    /// Interval between application-level pings while connected.
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong before treating the link as dead.
    pub pong_timeout: Duration,
    /// Reconnect pacing and budget.
    pub backoff: BackoffPolicy,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Identifies a registered event handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;
type HandlerMap = Arc<RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>>;

/// A persistent, authenticated, auto-reconnecting duplex event channel.
pub struct RealtimeChannel {
    config: ChannelConfig,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
    handlers: HandlerMap,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    next_handler_id: AtomicU64,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            config,
            state_tx,
            state_rx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            outbound: Mutex::new(None),
            io_task: Mutex::new(None),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// The current connection state.
    pub fn state(&self) -> ChannelState {
        self.state_rx.borrow().clone()
    }

    /// A watch over connection state transitions, for callers that react to
    /// connectivity changes (draining queues on reconnect, surfacing
    /// "connection lost" to the UI).
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Whether application events can be sent right now.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ChannelState::Connected)
    }

    /// Establish the channel with the given bearer token.
    ///
    /// Idempotent: a no-op while already connecting or connected. Suspends
    /// the caller until the connection first reaches the connected state or
    /// resolves into a typed failure. After the first success the channel
    /// keeps itself alive, reconnecting with backoff as needed.
    pub async fn connect(&self, token: &str) -> Result<(), ChannelError> {
        if self.state().is_active() {
            debug!("connect: channel already active");
            return Ok(());
        }

        if let Some(task) = self.io_task.lock().unwrap().take() {
            task.abort();
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap() = Some(outbound_tx);

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = IoDriver {
            config: self.config.clone(),
            token: token.to_string(),
            state: self.state_tx.clone(),
            handlers: self.handlers.clone(),
        };
        let task = tokio::spawn(driver.run(outbound_rx, ready_tx));
        *self.io_task.lock().unwrap() = Some(task);

        match ready_rx.await {
            Ok(result) => result,
            // The driver never drops the sender without resolving it; treat
            // an aborted task as a plain disconnect.
            Err(_) => Err(ChannelError::NotConnected),
        }
    }

    /// Tear the channel down immediately.
    ///
    /// In-flight sends are not awaited; no new ones are issued.
    pub fn disconnect(&self) {
        if let Some(task) = self.io_task.lock().unwrap().take() {
            task.abort();
        }
        *self.outbound.lock().unwrap() = None;
        self.state_tx.send_replace(ChannelState::Disconnected);
        info!("channel disconnected");
    }

    /// Emit an event, fire-and-forget.
    ///
    /// Fails with [`ChannelError::NotConnected`] unless the channel is in
    /// the connected state; the caller decides whether to queue.
    pub fn send<T: Serialize>(&self, event: &str, data: &T) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let envelope = Envelope::new(event, data)?;
        let outbound = self.outbound.lock().unwrap();
        outbound
            .as_ref()
            .ok_or(ChannelError::NotConnected)?
            .send(envelope)
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Register a handler for an inbound event name.
    ///
    /// Multiple handlers per event are supported; each registration returns
    /// its own id for `unsubscribe`.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler.
    pub fn unsubscribe(&self, event: &str, id: HandlerId) {
        let mut handlers = self.handlers.write().unwrap();
        if let Some(list) = handlers.get_mut(event) {
            list.retain(|(registered, _)| *registered != id);
            if list.is_empty() {
                handlers.remove(event);
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Dispatch an envelope to every handler registered for its event name.
///
/// Handlers are snapshotted before invocation so a handler may subscribe or
/// unsubscribe without deadlocking the map.
fn dispatch_envelope(handlers: &HandlerMap, envelope: &Envelope) {
    let matching: Vec<Handler> = handlers
        .read()
        .unwrap()
        .get(&envelope.event)
        .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();

    for handler in matching {
        handler(envelope.data.clone());
    }
}

/// Why a connected session ended.
enum SessionEnd {
    RemoteClosed,
    TransportError,
    HeartbeatTimeout,
    LocalShutdown,
}

/// The connection driver running on its own task.
struct IoDriver {
    config: ChannelConfig,
    token: String,
    state: watch::Sender<ChannelState>,
    handlers: HandlerMap,
}

impl IoDriver {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    async fn run(
        self,
        mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
        ready_tx: oneshot::Sender<Result<(), ChannelError>>,
    ) {
        let mut ready_tx = Some(ready_tx);
        let mut attempt: u32 = 0;

        loop {
            match self.establish().await {
                Ok(ws) => {
                    attempt = 0;
                    self.set_state(ChannelState::Connected);
                    info!(endpoint = %self.config.endpoint, "channel connected");
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }

                    match self.run_session(ws, &mut outbound_rx).await {
                        SessionEnd::LocalShutdown => {
                            self.set_state(ChannelState::Disconnected);
                            return;
                        }
                        SessionEnd::RemoteClosed => warn!("server closed the connection"),
                        SessionEnd::TransportError => warn!("transport failure, reconnecting"),
                        SessionEnd::HeartbeatTimeout => warn!("heartbeat timed out, reconnecting"),
                    }
                }
                Err(ChannelError::AuthRejected) => {
                    // Retrying the same token cannot succeed; park without
                    // consuming the retry budget and let the caller refresh.
                    let delay = self.config.backoff.delay_for(attempt);
                    self.set_state(ChannelState::Backoff {
                        attempt,
                        next_retry_at: Instant::now() + delay,
                    });
                    warn!("handshake rejected, token refresh required");
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(ChannelError::AuthRejected));
                    }
                    return;
                }
                Err(error) => {
                    warn!(%error, attempt, "connection attempt failed");
                }
            }

            let delay = self.config.backoff.delay_for(attempt);
            attempt += 1;
            if self.config.backoff.exhausted(attempt) {
                self.set_state(ChannelState::Failed);
                warn!(attempts = attempt, "retry budget exhausted, giving up");
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(ChannelError::ConnectionFailed { attempts: attempt }));
                }
                return;
            }

            self.set_state(ChannelState::Backoff {
                attempt,
                next_retry_at: Instant::now() + delay,
            });
            sleep(delay).await;
        }
    }

    /// Open the TCP connection and perform the authenticated handshake.
    async fn establish(&self) -> Result<WebSocketStream<TcpStream>, ChannelError> {
        self.set_state(ChannelState::Connecting);

        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;

        let host = request
            .uri()
            .host()
            .ok_or_else(|| ChannelError::InvalidEndpoint("missing host".to_string()))?
            .to_string();
        let port = request.uri().port_u16().unwrap_or(80);

        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ChannelError::Timeout)?
        .map_err(WsError::Io)?;

        // The bearer token rides the upgrade request: the server
        // authenticates during the handshake, before any frame is exchanged.
        self.set_state(ChannelState::Authenticating);
        let auth_value = format!("Bearer {}", self.token)
            .parse()
            .map_err(|_| ChannelError::InvalidEndpoint("token is not header-safe".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth_value);

        let (ws, _response) = timeout(self.config.connect_timeout, client_async(request, stream))
            .await
            .map_err(|_| ChannelError::Timeout)?
            .map_err(|error| match error {
                WsError::Http(ref response)
                    if response.status() == StatusCode::UNAUTHORIZED
                        || response.status() == StatusCode::FORBIDDEN =>
                {
                    ChannelError::AuthRejected
                }
                other => ChannelError::Transport(other),
            })?;

        Ok(ws)
    }

    /// Pump one connected session until it ends.
    async fn run_session(
        &self,
        ws: WebSocketStream<TcpStream>,
        outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; consume it so
        // pings start one interval into the session.
        heartbeat.tick().await;

        let mut pong_deadline: Option<Instant> = None;

        loop {
            // Instant is Copy; lift the deadline out so the sleep future does
            // not hold a borrow the handlers need.
            let pong_at = pong_deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(envelope) => {
                            let text = match encode_envelope(&envelope) {
                                Ok(text) => text,
                                Err(error) => {
                                    warn!(%error, event = %envelope.event, "dropping unencodable event");
                                    continue;
                                }
                            };
                            if let Err(error) = ws_tx.send(Message::Text(text)).await {
                                warn!(%error, "send failed");
                                return SessionEnd::TransportError;
                            }
                        }
                        None => return SessionEnd::LocalShutdown,
                    }
                }

                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text, &mut pong_deadline);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_tx.send(Message::Pong(data)).await.is_err() {
                                return SessionEnd::TransportError;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::RemoteClosed,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(%error, "websocket error");
                            return SessionEnd::TransportError;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    let ping = match Envelope::new(events::PING, &Heartbeat::now()) {
                        Ok(envelope) => envelope,
                        Err(_) => continue,
                    };
                    let text = match encode_envelope(&ping) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if let Err(error) = ws_tx.send(Message::Text(text)).await {
                        warn!(%error, "heartbeat send failed");
                        return SessionEnd::TransportError;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }

                _ = sleep_until(pong_at), if pong_deadline.is_some() => {
                    return SessionEnd::HeartbeatTimeout;
                }
            }
        }
    }

    /// Decode and route a received text frame.
    fn handle_frame(&self, text: &str, pong_deadline: &mut Option<Instant>) {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "ignoring malformed frame");
                return;
            }
        };

        if envelope.event == events::PONG {
            *pong_deadline = None;
        }

        dispatch_envelope(&self.handlers, &envelope);
    }
}
