//! Transport Module
//!
//! The transport is the one persistent, bidirectional connection to the node.
//! Everything above it (connection manager, progress synchronizers) talks to
//! it through the [`Transport`] trait.
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `mod`       | `Transport` trait, event registry, reconnection flag  |
//! | `websocket` | tokio-tungstenite driver with automatic reconnection  |
//! | `memory`    | In-process transport driven by the caller             |
//!
//! # Event Registry
//!
//! Listeners are stored in a map keyed by event name. Registering a listener
//! under a name that already has one replaces it, so a name never has more
//! than one listener no matter how often it is bound.
//!
//! All events are dispatched from a single place (the websocket driver task,
//! or the caller of `MemoryTransport::emit`), one at a time, in delivery order.

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::LinkError;

pub mod memory;
pub mod websocket;

pub use memory::MemoryTransport;
pub use websocket::{WsTransport, WsTransportConfig};

/// Listener invoked with the event payload
pub type EventHandler = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// Connection state as tracked by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Last attempt failed; a retry may be pending
    Erroring,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Erroring => write!(f, "erroring"),
        }
    }
}

/// The shared connection capability.
///
/// `open` and `close` are requests: they return immediately and their
/// outcome arrives later as `connect` / `disconnect` / `connect_error` events.
pub trait Transport: Send + Sync {
    /// Register `handler` for `event`, replacing any existing listener
    fn on(&self, event: &str, handler: EventHandler);

    /// Remove the listener for `event`
    fn off(&self, event: &str) -> Result<(), LinkError>;

    /// Number of listeners bound to `event` (0 or 1)
    fn listener_count(&self, event: &str) -> usize;

    /// Request a connection. A no-op while connecting or connected.
    fn open(&self);

    /// Close the connection and stop any pending reconnection
    fn close(&self) -> Result<(), LinkError>;

    fn state(&self) -> ConnectionState;

    /// Whether automatic reconnection is currently enabled
    fn reconnection(&self) -> bool;

    fn set_reconnection(&self, enabled: bool);

    /// Restore automatic reconnection to its configured default
    fn reset_reconnection(&self);
}

/// Listeners keyed by event name
#[derive(Default)]
pub struct EventRegistry {
    handlers: DashMap<String, EventHandler>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `event`. Returns `true` if a listener was replaced.
    pub fn insert(&self, event: &str, handler: EventHandler) -> bool {
        let replaced = self.handlers.insert(event.to_string(), handler).is_some();
        debug!(event = %event, replaced = replaced, "Listener bound");
        replaced
    }

    /// Unbind `event`. Returns `true` if a listener was removed.
    pub fn remove(&self, event: &str) -> bool {
        let removed = self.handlers.remove(event).is_some();
        if removed {
            debug!(event = %event, "Listener removed");
        }
        removed
    }

    pub fn count(&self, event: &str) -> usize {
        usize::from(self.handlers.contains_key(event))
    }

    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        events.sort();
        events
    }

    /// Invoke the listener for `event`. Returns `false` if none is bound.
    pub fn dispatch(&self, event: &str, payload: &JsonValue) -> bool {
        // Clone the handler out so it may bind or unbind listeners itself
        let handler = self.handlers.get(event).map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            trace!(event = %event, "No listener for event");
            return false;
        };
        handler(payload);
        true
    }
}

/// Automatic reconnection switch with a configured default
#[derive(Debug)]
pub struct ReconnectionFlag {
    current: AtomicBool,
    default: bool,
}

impl ReconnectionFlag {
    pub fn new(default: bool) -> Self {
        Self {
            current: AtomicBool::new(default),
            default,
        }
    }

    pub fn get(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.current.store(enabled, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.set(self.default);
    }

    pub fn default_value(&self) -> bool {
        self.default
    }
}
