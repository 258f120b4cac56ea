//! Elohim Link - Live operation progress from an Elohim node
//!
//! Keeps one persistent WebSocket connection to a node and projects the
//! progress events it pushes for long-running operations (backup, restore)
//! into a subscribable local cache.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────── LinkClient ────────────────────┐
//!                  │                                                    │
//! node ══ws══► Transport ──connect/disconnect/connect_error──► ConnectionManager ──► is_connected
//!                  │                                                    │
//!                  └──"<kind>Progress"──► ProgressSynchronizer ──► CacheStore ──► subscribers
//! ```
//!
//! ## Progress Events
//!
//! Each event carries a single stage update, e.g. `{"database": 40}` on
//! `backupProgress`. The synchronizer for that kind folds it into the latest
//! record; an operation is complete once both stages reach 100.
//!
//! ## Usage
//!
//! ```no_run
//! use elohim_link::{LinkClient, LinkConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), elohim_link::LinkError> {
//! let client = Arc::new(LinkClient::new(&LinkConfig::default())?);
//! client.start();
//!
//! let mut backup = client.backup()?.changes();
//! while let Ok(record) = backup.recv().await {
//!     if record.is_complete() {
//!         break;
//!     }
//! }
//! client.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod transport;

pub use cache::{CacheKey, CacheStore};
pub use client::LinkClient;
pub use config::{LinkConfig, OperationConfig, ReconnectConfig};
pub use connection::ConnectionManager;
pub use error::LinkError;
pub use progress::{
    OperationKind, ProgressRecord, ProgressSnapshot, ProgressSynchronizer, ProgressUpdate, Stage,
};
pub use transport::{ConnectionState, MemoryTransport, Transport, WsTransport, WsTransportConfig};
