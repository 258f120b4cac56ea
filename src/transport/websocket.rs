//! WebSocket Transport
//!
//! Owns one WebSocket connection to the node and a background driver task.
//!
//! # Driver Loop
//!
//! ```text
//! open() ──► spawn driver
//!              │
//!              ├─► connect (timeout) ──ok──► emit "connect" ──► pump frames ──► emit "disconnect"
//!              │        └──err──► emit "connect_error"
//!              │
//!              ├─► reconnection disabled? stop
//!              ├─► attempts exhausted?    stop
//!              └─► sleep(backoff) ──► re-check reconnection ──► loop
//!
//! close() ──► shutdown signal ──► driver closes the socket and exits
//! ```
//!
//! Every inbound frame is decoded and dispatched from the driver task, so
//! listeners run one at a time in delivery order.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        protocol::Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

use super::{ConnectionState, EventHandler, EventRegistry, ReconnectionFlag, Transport};
use crate::config::{LinkConfig, ReconnectConfig};
use crate::error::LinkError;
use crate::protocol::{
    decode_binary_frame, decode_frame, is_lifecycle_event, InboundEvent, EVENT_CONNECT,
    EVENT_CONNECT_ERROR, EVENT_DISCONNECT,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason reported when the client itself closes the connection
pub const CLIENT_CLOSE_REASON: &str = "io client disconnect";

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// WebSocket endpoint
    pub endpoint: String,
    /// Cookie header sent on the handshake
    pub session_cookie: Option<String>,
    pub reconnect: ReconnectConfig,
    /// Timeout for the handshake
    pub connect_timeout: Duration,
    /// Keepalive ping interval
    pub ping_interval: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for WsTransportConfig {
    fn from(config: &LinkConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            session_cookie: config.session_cookie.clone(),
            reconnect: config.reconnect.clone(),
            connect_timeout: config.connect_timeout(),
            ping_interval: config.ping_interval(),
        }
    }
}

/// How a connected session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// close() was called
    Closed,
    /// The connection dropped underneath us
    Lost(String),
}

impl SessionEnd {
    fn reason(&self) -> &str {
        match self {
            SessionEnd::Closed => CLIENT_CLOSE_REASON,
            SessionEnd::Lost(reason) => reason,
        }
    }
}

/// State shared between the transport handle and its driver task.
///
/// Every `open()` and `close()` advances `generation`. A driver only touches
/// the shared state and listeners while `epoch` is still the current
/// generation, so a driver that was closed cannot overwrite the state of
/// the one that replaced it.
#[derive(Clone)]
struct DriverContext {
    config: Arc<WsTransportConfig>,
    registry: Arc<EventRegistry>,
    reconnection: Arc<ReconnectionFlag>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    epoch: u64,
}

impl DriverContext {
    /// Context for a new driver, superseding every earlier one
    fn next_generation(&self) -> Self {
        let mut ctx = self.clone();
        self.state.send_modify(|_| {
            ctx.epoch = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        });
        ctx
    }

    /// Supersede every driver and mark the transport disconnected.
    ///
    /// Returns the state before the close.
    fn retire(&self) -> ConnectionState {
        let mut previous = ConnectionState::Disconnected;
        self.state.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            previous = *state;
            *state = ConnectionState::Disconnected;
        });
        previous
    }

    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.epoch
    }

    /// Returns `false` once this driver has been superseded.
    fn set_state(&self, state: ConnectionState) -> bool {
        let mut current = false;
        // Checked under the state lock, which retire() also holds
        self.state.send_if_modified(|value| {
            current = self.is_current();
            if !current || *value == state {
                return false;
            }
            *value = state;
            true
        });
        current
    }

    fn emit(&self, event: &str, payload: JsonValue) {
        if !self.is_current() {
            trace!(event = %event, epoch = self.epoch, "Superseded driver, event dropped");
            return;
        }
        self.registry.dispatch(event, &payload);
    }

    fn deliver(&self, frame: Result<InboundEvent, LinkError>) {
        if !self.is_current() {
            return;
        }
        match frame {
            Ok(event) if is_lifecycle_event(&event.event) => {
                warn!(event = %event.event, "Dropping server frame with reserved event name");
            }
            Ok(event) => {
                trace!(event = %event.event, "Inbound event");
                self.registry.dispatch(&event.event, &event.data);
            }
            Err(e) => {
                debug!(error = %e, "Failed to decode frame");
            }
        }
    }
}

struct Driver {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// WebSocket transport with automatic reconnection.
///
/// Must be opened from within a tokio runtime.
pub struct WsTransport {
    ctx: DriverContext,
    driver: Mutex<Option<Driver>>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        let reconnection = Arc::new(ReconnectionFlag::new(config.reconnect.enabled));
        Self {
            ctx: DriverContext {
                config: Arc::new(config),
                registry: Arc::new(EventRegistry::new()),
                reconnection,
                state: Arc::new(watch::Sender::new(ConnectionState::Disconnected)),
                generation: Arc::new(AtomicU64::new(0)),
                epoch: 0,
            },
            driver: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.ctx.config.endpoint
    }
}

impl Transport for WsTransport {
    fn on(&self, event: &str, handler: EventHandler) {
        self.ctx.registry.insert(event, handler);
    }

    fn off(&self, event: &str) -> Result<(), LinkError> {
        self.ctx.registry.remove(event);
        Ok(())
    }

    fn listener_count(&self, event: &str) -> usize {
        self.ctx.registry.count(event)
    }

    fn open(&self) {
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = driver.as_ref() {
            if !running.task.is_finished() {
                debug!(url = %self.ctx.config.endpoint, "Transport already open");
                return;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Cannot open transport outside a tokio runtime");
                self.ctx.state.send_replace(ConnectionState::Erroring);
                let payload = json!({ "message": e.to_string() });
                self.ctx.registry.dispatch(EVENT_CONNECT_ERROR, &payload);
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = self.ctx.next_generation();
        ctx.set_state(ConnectionState::Connecting);
        let task = runtime.spawn(async move {
            drive(ctx, shutdown_rx).await;
        });

        *driver = Some(Driver {
            shutdown: shutdown_tx,
            task,
        });
    }

    fn close(&self) -> Result<(), LinkError> {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // The driver is silenced first; the disconnect is reported from here
        let previous = self.ctx.retire();
        if previous == ConnectionState::Connected {
            let payload = json!({ "reason": CLIENT_CLOSE_REASON });
            self.ctx.registry.dispatch(EVENT_DISCONNECT, &payload);
        }

        match driver {
            Some(driver) if !driver.task.is_finished() => {
                debug!(url = %self.ctx.config.endpoint, "Closing transport");
                driver.shutdown.send(()).map_err(|_| {
                    LinkError::Transport("driver stopped before close was delivered".into())
                })
            }
            _ => Ok(()),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.ctx.state.borrow()
    }

    fn reconnection(&self) -> bool {
        self.ctx.reconnection.get()
    }

    fn set_reconnection(&self, enabled: bool) {
        self.ctx.reconnection.set(enabled);
    }

    fn reset_reconnection(&self) {
        self.ctx.reconnection.reset();
    }
}

/// Driver task: connect, pump frames, reconnect with backoff.
async fn drive(ctx: DriverContext, mut shutdown: oneshot::Receiver<()>) {
    let mut attempts = 0u32;

    loop {
        if !ctx.set_state(ConnectionState::Connecting) {
            debug!(epoch = ctx.epoch, "Driver superseded");
            break;
        }
        let connect_timeout = ctx.config.connect_timeout;
        let attempt = tokio::select! {
            result = tokio::time::timeout(connect_timeout, connect(&ctx.config)) => result,
            _ = &mut shutdown => {
                debug!("Shutdown received while connecting");
                break;
            }
        };

        match attempt {
            Ok(Ok(ws)) => {
                attempts = 0;
                if !ctx.set_state(ConnectionState::Connected) {
                    debug!(epoch = ctx.epoch, "Driver superseded while connecting");
                    break;
                }
                info!(url = %ctx.config.endpoint, "Transport connected");
                ctx.emit(EVENT_CONNECT, JsonValue::Null);

                let end = pump(&ctx, ws, &mut shutdown).await;

                ctx.set_state(ConnectionState::Disconnected);
                info!(
                    url = %ctx.config.endpoint,
                    reason = %end.reason(),
                    "Transport disconnected"
                );
                ctx.emit(EVENT_DISCONNECT, json!({ "reason": end.reason() }));

                if end == SessionEnd::Closed {
                    break;
                }
            }
            Ok(Err(e)) => {
                ctx.set_state(ConnectionState::Erroring);
                warn!(url = %ctx.config.endpoint, error = %e, "Connect attempt failed");
                ctx.emit(EVENT_CONNECT_ERROR, json!({ "message": e.to_string() }));
            }
            Err(_) => {
                ctx.set_state(ConnectionState::Erroring);
                warn!(
                    url = %ctx.config.endpoint,
                    timeout = ?ctx.config.connect_timeout,
                    "Connect attempt timed out"
                );
                ctx.emit(EVENT_CONNECT_ERROR, json!({ "message": "connect timeout" }));
            }
        }

        if !ctx.reconnection.get() {
            info!("Automatic reconnection disabled, driver stopping");
            break;
        }

        attempts += 1;
        let max = ctx.config.reconnect.max_attempts;
        if max > 0 && attempts > max {
            error!(max = max, "Max reconnection attempts reached, driver stopping");
            break;
        }

        let delay = ctx.config.reconnect.backoff(attempts);
        info!(delay = ?delay, attempt = attempts, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => {
                debug!("Shutdown received during reconnect wait");
                break;
            }
        }

        // Reconnection may have been switched off while we slept
        if !ctx.reconnection.get() {
            info!("Automatic reconnection disabled during backoff, driver stopping");
            break;
        }
    }

    ctx.set_state(ConnectionState::Disconnected);
    debug!("Transport driver stopped");
}

/// Open the WebSocket, attaching the session cookie if configured.
async fn connect(config: &WsTransportConfig) -> Result<WsStream, LinkError> {
    debug!(url = %config.endpoint, "Connecting to WebSocket");

    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| LinkError::Transport(format!("Invalid endpoint: {}", e)))?;

    if let Some(cookie) = &config.session_cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| LinkError::Transport(format!("Invalid session cookie: {}", e)))?;
        request.headers_mut().insert(COOKIE, value);
    }

    let (ws, _) = connect_async(request)
        .await
        .map_err(|e| LinkError::Transport(format!("WebSocket connect failed: {}", e)))?;

    Ok(ws)
}

/// Read frames until the session ends.
async fn pump(
    ctx: &DriverContext,
    ws: WsStream,
    shutdown: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval(ctx.config.ping_interval);
    // First tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "Error closing WebSocket");
                }
                return SessionEnd::Closed;
            }

            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Lost(format!("ping failed: {}", e));
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => ctx.deliver(decode_frame(&text)),
                    Some(Ok(Message::Binary(data))) => ctx.deliver(decode_binary_frame(&data)),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "Server closed connection");
                        return SessionEnd::Lost("io server disconnect".to_string());
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by tungstenite
                    }
                    Some(Err(e)) => return SessionEnd::Lost(format!("transport error: {}", e)),
                    None => return SessionEnd::Lost("transport close".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_link_config() {
        let link = LinkConfig {
            session_cookie: Some("sid=abc".to_string()),
            ..Default::default()
        };
        let config = WsTransportConfig::from(&link);
        assert_eq!(config.endpoint, "ws://localhost:8090/events");
        assert_eq!(config.session_cookie.as_deref(), Some("sid=abc"));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_session_end_reason() {
        assert_eq!(SessionEnd::Closed.reason(), CLIENT_CLOSE_REASON);
        assert_eq!(SessionEnd::Lost("boom".into()).reason(), "boom");
    }

    #[test]
    fn test_new_transport_is_idle() {
        let transport = WsTransport::new(WsTransportConfig::default());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(transport.reconnection());
        // Closing an unopened transport is a no-op
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_closed_driver_cannot_touch_shared_state() {
        let transport = WsTransport::new(WsTransportConfig::default());
        let disconnects = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        transport.on(
            EVENT_DISCONNECT,
            Arc::new(move |_: &JsonValue| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let stale = transport.ctx.next_generation();
        assert!(stale.set_state(ConnectionState::Connected));
        assert!(transport.close().is_ok());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        // A replacement driver is running by the time the old one winds down
        let fresh = transport.ctx.next_generation();
        assert!(fresh.set_state(ConnectionState::Connected));

        assert!(!stale.set_state(ConnectionState::Disconnected));
        stale.emit(EVENT_DISCONNECT, json!({ "reason": CLIENT_CLOSE_REASON }));

        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_outside_runtime_reports_connect_error() {
        let transport = WsTransport::new(WsTransportConfig::default());
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        transport.on(
            EVENT_CONNECT_ERROR,
            Arc::new(move |_: &JsonValue| flag.store(true, std::sync::atomic::Ordering::SeqCst)),
        );

        transport.open();

        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(transport.state(), ConnectionState::Erroring);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_emits_connect_error() {
        let mut config = WsTransportConfig {
            endpoint: "ws://127.0.0.1:1/events".to_string(),
            ..Default::default()
        };
        config.reconnect.enabled = false;
        let transport = WsTransport::new(config);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.on(
            EVENT_CONNECT_ERROR,
            Arc::new(move |payload: &JsonValue| {
                let _ = tx.send(payload.clone());
            }),
        );

        transport.open();
        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(payload["message"].is_string());
    }
}
