//! Connection Manager
//!
//! Owns the lifecycle of the one shared transport and exposes whether it is
//! currently connected.
//!
//! ```text
//!  connect() ──► bind lifecycle listeners (once) ──► transport.open()
//!                         │
//!        connect ─────────┼──► is_connected = true
//!        disconnect ──────┤
//!        connect_error ───┴──► is_connected = false
//!
//!  disconnect(false) ──► transport.close()
//!  disconnect(true)  ──► [reconnection off] unbind listeners, close [restored]
//! ```
//!
//! Nothing here returns connection failures to the caller. They show up as
//! `is_connected() == false`; retrying is up to the transport.

use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::protocol::{EVENT_CONNECT, EVENT_CONNECT_ERROR, EVENT_DISCONNECT, LIFECYCLE_EVENTS};
use crate::transport::{ConnectionState, Transport};

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    listeners_bound: AtomicBool,
    connected: Arc<watch::Sender<bool>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listeners_bound: AtomicBool::new(false),
            connected: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Bind the lifecycle listeners if needed and ask the transport to open.
    ///
    /// Safe to call repeatedly: listeners are bound once per bound lifetime
    /// and opening an open transport does nothing.
    pub fn connect(&self) {
        if self
            .listeners_bound
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.bind_listeners();
        }

        debug!(state = %self.transport.state(), "Requesting connection");
        self.transport.open();
    }

    /// Close the connection.
    ///
    /// A soft disconnect keeps the lifecycle listeners, so a later `connect()`
    /// picks up where it left off. A hard disconnect is for session end: it
    /// also removes the listeners and keeps automatic reconnection off until
    /// the close has been issued.
    pub fn disconnect(&self, hard: bool) {
        if !hard {
            if let Err(e) = self.transport.close() {
                warn!(error = %e, "Transport close failed");
            }
            self.set_connected(false);
            info!("Disconnected");
            return;
        }

        let _guard = ReconnectionGuard::disable(self.transport.as_ref());

        for event in LIFECYCLE_EVENTS {
            if let Err(e) = self.transport.off(event) {
                warn!(event = %event, error = %e, "Failed to remove lifecycle listener");
            }
        }
        self.listeners_bound.store(false, Ordering::SeqCst);

        if let Err(e) = self.transport.close() {
            warn!(error = %e, "Transport close failed");
        }
        self.set_connected(false);
        info!("Disconnected (hard)");
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observe connection changes
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Transport state, for diagnostics
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn listeners_bound(&self) -> bool {
        self.listeners_bound.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn set_connected(&self, connected: bool) {
        set_flag(&self.connected, connected);
    }

    fn bind_listeners(&self) {
        let connected = Arc::clone(&self.connected);
        self.transport.on(
            EVENT_CONNECT,
            Arc::new(move |_: &JsonValue| {
                info!("Connected");
                set_flag(&connected, true);
            }),
        );

        let connected = Arc::clone(&self.connected);
        self.transport.on(
            EVENT_DISCONNECT,
            Arc::new(move |payload: &JsonValue| {
                let reason = payload.get("reason").and_then(JsonValue::as_str).unwrap_or("unknown");
                info!(reason = %reason, "Connection lost");
                set_flag(&connected, false);
            }),
        );

        let connected = Arc::clone(&self.connected);
        self.transport.on(
            EVENT_CONNECT_ERROR,
            Arc::new(move |payload: &JsonValue| {
                let message = payload
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown");
                warn!(error = %message, "Connection attempt failed");
                set_flag(&connected, false);
            }),
        );

        debug!("Lifecycle listeners bound");
    }
}

fn set_flag(flag: &watch::Sender<bool>, value: bool) {
    flag.send_if_modified(|current| {
        if *current == value {
            return false;
        }
        *current = value;
        true
    });
}

/// Disables automatic reconnection for its lifetime.
///
/// The configured default is restored on drop, including during unwinding.
struct ReconnectionGuard<'a> {
    transport: &'a dyn Transport,
}

impl<'a> ReconnectionGuard<'a> {
    fn disable(transport: &'a dyn Transport) -> Self {
        transport.set_reconnection(false);
        Self { transport }
    }
}

impl Drop for ReconnectionGuard<'_> {
    fn drop(&mut self) {
        self.transport.reset_reconnection();
        debug!(enabled = self.transport.reconnection(), "Reconnection restored");
    }
}
