// SPDX-License-Identifier: MIT
//! Persistent bidirectional OneBot v11 socket (spec §4.1).
//!
//! One [`ProtocolClient`] owns a single websocket connection with automatic
//! reconnect, heartbeat probing, and echo-matched request/response actions.
//! Inbound events are broadcast to any number of subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::wire::{actions, ActionRequest, ActionResponse, ActionStatus, InboundEvent};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport_unavailable")]
    Unavailable,
    #[error("action request timed out after {0:?}")]
    Timeout(Duration),
    #[error("action failed: {0}")]
    ActionFailed(String),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid websocket url: {0}")]
    InvalidUrl(String),
}

const ACTION_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_SOFT_TIMEOUT: Duration = Duration::from_secs(90);
const HEARTBEAT_HARD_TIMEOUT: Duration = Duration::from_secs(150);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ActionResponse>>>>;

/// Shared, cloneable handle onto a running protocol client. Construct with
/// [`ProtocolClient::connect`], which spawns the read/reconnect loop.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<Inner>,
}

struct Inner {
    ws_url: String,
    access_token: String,
    connected: AtomicBool,
    self_id: Mutex<Option<String>>,
    last_server_msg_ms: AtomicU64,
    pending: PendingMap,
    events_tx: broadcast::Sender<InboundEvent>,
    outbound_tx: tokio::sync::mpsc::UnboundedSender<WsMessage>,
    cancel: CancellationToken,
}

impl ProtocolClient {
    /// Start the connect/reconnect/heartbeat loop in the background and
    /// return a handle. The loop runs until `cancel` fires.
    pub fn connect(ws_url: String, access_token: String, cancel: CancellationToken) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            ws_url,
            access_token,
            connected: AtomicBool::new(false),
            self_id: Mutex::new(None),
            last_server_msg_ms: AtomicU64::new(now_ms()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            outbound_tx,
            cancel,
        });

        let client = ProtocolClient { inner };
        tokio::spawn(client.clone().run_loop(outbound_rx));
        client
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn self_id(&self) -> Option<String> {
        self.inner.self_id.try_lock().ok().and_then(|g| g.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Block until connected or `timeout` elapses.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Echo-matched action request/response with a 5s timeout (spec §4.1).
    /// Fails with `transport_unavailable` if disconnected and a short grace
    /// window does not see a reconnect complete.
    pub async fn send_action(
        &self,
        name: &str,
        params: Value,
    ) -> Result<ActionResponse, TransportError> {
        if !self.is_connected() && !self.wait_until_connected(Duration::from_secs(2)).await {
            return Err(TransportError::Unavailable);
        }

        let echo = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(echo.clone(), tx);

        let req = ActionRequest { action: name.to_string(), params, echo: echo.clone() };
        let text = serde_json::to_string(&req).expect("action request serializes");
        if self.inner.outbound_tx.send(WsMessage::Text(text)).is_err() {
            self.inner.pending.lock().await.remove(&echo);
            return Err(TransportError::Unavailable);
        }

        match tokio::time::timeout(ACTION_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(TransportError::Unavailable),
            Err(_) => {
                self.inner.pending.lock().await.remove(&echo);
                Err(TransportError::Timeout(ACTION_TIMEOUT))
            }
        }
    }

    async fn run_loop(
        self,
        mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<WsMessage>,
    ) {
        let mut backoff = Duration::from_millis(500);

        loop {
            if self.inner.cancel.is_cancelled() {
                return;
            }

            match self.connect_once().await {
                Ok(stream) => {
                    backoff = Duration::from_millis(500);
                    self.inner.connected.store(true, Ordering::SeqCst);
                    self.inner
                        .last_server_msg_ms
                        .store(now_ms(), Ordering::SeqCst);
                    info!(url = %self.inner.ws_url, "onebot transport connected");

                    self.session(stream, &mut outbound_rx).await;

                    self.inner.connected.store(false, Ordering::SeqCst);
                    warn!("onebot transport disconnected, reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, "onebot connect failed");
                }
            }

            if self.inner.cancel.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.inner.cancel.cancelled() => return,
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
        }
    }

    async fn connect_once(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .inner
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if !self.inner.access_token.is_empty() {
            let value = format!("Bearer {}", self.inner.access_token);
            request.headers_mut().insert(
                "Authorization",
                value.parse().map_err(|_| {
                    TransportError::InvalidUrl("access_token not a valid header value".into())
                })?,
            );
        }
        let (stream, _resp) = connect_async(request).await?;
        Ok(stream)
    }

    /// Drive one connection until it closes or a hard heartbeat timeout
    /// forces a reconnect.
    async fn session(
        &self,
        stream: WsStream,
        outbound_rx: &mut tokio::sync::mpsc::UnboundedReceiver<WsMessage>,
    ) {
        let (mut write, mut read) = stream.split();
        let mut heartbeat_tick = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(m) => {
                            if write.send(m).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.inner.last_server_msg_ms.store(now_ms(), Ordering::SeqCst);
                            self.handle_frame(&text).await;
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            self.inner.last_server_msg_ms.store(now_ms(), Ordering::SeqCst);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "onebot read error");
                            return;
                        }
                        None => return,
                    }
                }
                _ = heartbeat_tick.tick() => {
                    if self.heartbeat_check().await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true if the hard timeout fired and the session should be torn
    /// down to force a reconnect.
    async fn heartbeat_check(&self) -> bool {
        let elapsed_ms = now_ms().saturating_sub(self.inner.last_server_msg_ms.load(Ordering::SeqCst));
        if elapsed_ms >= HEARTBEAT_HARD_TIMEOUT.as_millis() as u64 {
            warn!(elapsed_ms, "onebot heartbeat hard timeout, forcing reconnect");
            return true;
        }
        if elapsed_ms >= HEARTBEAT_SOFT_TIMEOUT.as_millis() as u64 {
            debug!("onebot heartbeat soft timeout, probing get_login_info");
            // Any reply is treated as liveness (SPEC_FULL / spec §9 open question).
            let _ = self.send_action(actions::GET_LOGIN_INFO, Value::Null).await;
        }
        false
    }

    /// Non-JSON frames are silently dropped (spec §4.1).
    async fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };

        // Action responses carry an `echo`; events don't.
        if let Some(echo) = value.get("echo").and_then(|e| e.as_str()) {
            if let Ok(resp) = serde_json::from_value::<ActionResponse>(value.clone()) {
                if let Some(tx) = self.inner.pending.lock().await.remove(echo) {
                    let _ = tx.send(resp);
                }
                return;
            }
        }

        if let Ok(event) = serde_json::from_value::<InboundEvent>(value) {
            {
                let mut self_id_guard = self.inner.self_id.lock().await;
                if self_id_guard.is_none() {
                    *self_id_guard = Some(event.self_id.clone());
                }
            }
            let _ = self.inner.events_tx.send(event);
        }
    }
}

/// Abstraction over "something that can run a OneBot action request", so
/// the media resolver / sender can be unit tested against a fake without
/// spinning up a real websocket (spec §4.3, §4.11 call through this).
#[async_trait::async_trait]
pub trait ActionClient: Send + Sync {
    async fn send_action(&self, name: &str, params: Value) -> Result<ActionResponse, TransportError>;

    /// Used by the delivery queue's preflight check (spec §4.9). Fakes
    /// that don't model a real socket can just accept the default.
    fn is_connected(&self) -> bool {
        true
    }

    /// Block until connected or `timeout` elapses; returns whether it's
    /// connected when it returns.
    async fn wait_until_connected(&self, _timeout: Duration) -> bool {
        true
    }
}

#[async_trait::async_trait]
impl ActionClient for ProtocolClient {
    async fn send_action(&self, name: &str, params: Value) -> Result<ActionResponse, TransportError> {
        ProtocolClient::send_action(self, name, params).await
    }

    fn is_connected(&self) -> bool {
        ProtocolClient::is_connected(self)
    }

    async fn wait_until_connected(&self, timeout: Duration) -> bool {
        ProtocolClient::wait_until_connected(self, timeout).await
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl From<ActionResponse> for Result<Value, TransportError> {
    fn from(resp: ActionResponse) -> Self {
        if resp.is_ok() {
            Ok(resp.data.unwrap_or(Value::Null))
        } else {
            Err(TransportError::ActionFailed(
                resp.msg.unwrap_or_else(|| "unknown failure".into()),
            ))
        }
    }
}
