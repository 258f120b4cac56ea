//! In-process transport
//!
//! A [`Transport`] with no socket behind it. The caller plays the server and
//! the network: it decides when a handshake succeeds, when the connection
//! drops, when the reconnection timer fires, and which events arrive. Used by
//! the test suites and by embedders that feed events from another source.

use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::debug;

use super::{ConnectionState, EventHandler, EventRegistry, ReconnectionFlag, Transport};
use crate::error::LinkError;
use crate::protocol::{
    decode_frame, is_lifecycle_event, EVENT_CONNECT, EVENT_CONNECT_ERROR, EVENT_DISCONNECT,
};
use crate::transport::websocket::CLIENT_CLOSE_REASON;

pub struct MemoryTransport {
    registry: EventRegistry,
    reconnection: ReconnectionFlag,
    state: watch::Sender<ConnectionState>,
    /// Set by open(), cleared by close()
    wanted: AtomicBool,
    open_requests: AtomicUsize,
    close_requests: AtomicUsize,
    fail_teardown: AtomicBool,
}

impl MemoryTransport {
    /// Create a transport with automatic reconnection enabled by default
    pub fn new() -> Self {
        Self::with_reconnection(true)
    }

    pub fn with_reconnection(default: bool) -> Self {
        Self {
            registry: EventRegistry::new(),
            reconnection: ReconnectionFlag::new(default),
            state: watch::Sender::new(ConnectionState::Disconnected),
            wanted: AtomicBool::new(false),
            open_requests: AtomicUsize::new(0),
            close_requests: AtomicUsize::new(0),
            fail_teardown: AtomicBool::new(false),
        }
    }

    /// Complete a pending handshake
    pub fn establish(&self) {
        self.state.send_replace(ConnectionState::Connected);
        self.registry.dispatch(EVENT_CONNECT, &JsonValue::Null);
    }

    /// Fail a pending handshake
    pub fn fail(&self, message: &str) {
        self.state.send_replace(ConnectionState::Erroring);
        self.registry.dispatch(EVENT_CONNECT_ERROR, &json!({ "message": message }));
    }

    /// Drop the connection from the network side
    pub fn drop_connection(&self, reason: &str) {
        self.state.send_replace(ConnectionState::Disconnected);
        self.registry.dispatch(EVENT_DISCONNECT, &json!({ "reason": reason }));
    }

    /// Fire the automatic reconnection timer.
    ///
    /// Reconnects only if a connection is still wanted, reconnection is
    /// enabled and the transport is not already connected. Returns whether a
    /// reconnection happened.
    pub fn fire_reconnect_timer(&self) -> bool {
        if !self.wanted.load(Ordering::SeqCst) || !self.reconnection.get() {
            debug!("Reconnect timer fired but reconnection is not permitted");
            return false;
        }
        if self.state() == ConnectionState::Connected {
            return false;
        }
        self.establish();
        true
    }

    /// Deliver a server event. Returns whether a listener handled it.
    pub fn emit(&self, event: &str, payload: JsonValue) -> bool {
        self.registry.dispatch(event, &payload)
    }

    /// Deliver a raw text frame through the wire decoder
    pub fn deliver_frame(&self, text: &str) -> Result<bool, LinkError> {
        let event = decode_frame(text)?;
        if is_lifecycle_event(&event.event) {
            return Err(LinkError::Protocol(format!(
                "reserved event name from server: {}",
                event.event
            )));
        }
        Ok(self.registry.dispatch(&event.event, &event.data))
    }

    /// Make `off` and `close` fail until switched back
    pub fn set_fail_teardown(&self, fail: bool) {
        self.fail_teardown.store(fail, Ordering::SeqCst);
    }

    pub fn open_requests(&self) -> usize {
        self.open_requests.load(Ordering::SeqCst)
    }

    pub fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }

    pub fn bound_events(&self) -> Vec<String> {
        self.registry.events()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn on(&self, event: &str, handler: EventHandler) {
        self.registry.insert(event, handler);
    }

    fn off(&self, event: &str) -> Result<(), LinkError> {
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(LinkError::Transport(format!("cannot remove listener {}", event)));
        }
        self.registry.remove(event);
        Ok(())
    }

    fn listener_count(&self, event: &str) -> usize {
        self.registry.count(event)
    }

    fn open(&self) {
        self.open_requests.fetch_add(1, Ordering::SeqCst);
        self.wanted.store(true, Ordering::SeqCst);
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return;
        }
        self.state.send_replace(ConnectionState::Connecting);
    }

    fn close(&self) -> Result<(), LinkError> {
        self.close_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown.load(Ordering::SeqCst) {
            return Err(LinkError::Transport("close failed".into()));
        }

        self.wanted.store(false, Ordering::SeqCst);
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            self.registry
                .dispatch(EVENT_DISCONNECT, &json!({ "reason": CLIENT_CLOSE_REASON }));
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn reconnection(&self) -> bool {
        self.reconnection.get()
    }

    fn set_reconnection(&self, enabled: bool) {
        self.reconnection.set(enabled);
    }

    fn reset_reconnection(&self) {
        self.reconnection.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_is_noop_when_connected() {
        let transport = MemoryTransport::new();
        transport.open();
        transport.establish();
        transport.open();

        assert_eq!(transport.open_requests(), 2);
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_reconnect_timer_respects_flag_and_close() {
        let transport = MemoryTransport::new();
        transport.open();
        transport.establish();
        transport.drop_connection("transport close");

        transport.set_reconnection(false);
        assert!(!transport.fire_reconnect_timer());

        transport.reset_reconnection();
        assert!(transport.fire_reconnect_timer());
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.close().unwrap();
        assert!(!transport.fire_reconnect_timer());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_deliver_frame_rejects_reserved_names() {
        let transport = MemoryTransport::new();
        assert!(transport.deliver_frame(r#"{"event":"connect"}"#).is_err());
        assert!(!transport.deliver_frame(r#"["backupProgress",{"files":1}]"#).unwrap());
    }

    #[test]
    fn test_fail_teardown() {
        let transport = MemoryTransport::new();
        transport.set_fail_teardown(true);
        assert!(transport.off("connect").is_err());
        assert!(transport.close().is_err());
        assert_eq!(transport.close_requests(), 1);
    }
}
