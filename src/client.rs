//! Link client
//!
//! Wires one transport, one connection manager, one progress cache and a
//! synchronizer per operation kind. Construct it once and share it as
//! `Arc<LinkClient>`.

use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStore;
use crate::config::LinkConfig;
use crate::connection::ConnectionManager;
use crate::error::LinkError;
use crate::progress::{OperationKind, ProgressRecord, ProgressSynchronizer};
use crate::transport::{Transport, WsTransport, WsTransportConfig};

pub struct LinkClient {
    connection: ConnectionManager,
    cache: Arc<CacheStore<ProgressRecord>>,
    synchronizers: Vec<ProgressSynchronizer>,
}

impl LinkClient {
    /// Build a client over a WebSocket transport
    pub fn new(config: &LinkConfig) -> Result<Self, LinkError> {
        config.validate()?;

        let transport = Arc::new(WsTransport::new(WsTransportConfig::from(config)));
        info!(
            url = %transport.endpoint(),
            operations = config.operations.len(),
            "Link client created"
        );

        Ok(Self::build(
            transport,
            config.operation_kinds(),
            config.channel_capacity,
        ))
    }

    /// Build a client over any transport
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        kinds: Vec<OperationKind>,
    ) -> Result<Self, LinkError> {
        for (i, kind) in kinds.iter().enumerate() {
            if kinds[..i].iter().any(|k| k.name() == kind.name()) {
                return Err(LinkError::Config(format!(
                    "duplicate operation name: {}",
                    kind.name()
                )));
            }
        }
        Ok(Self::build(
            transport,
            kinds,
            crate::cache::DEFAULT_CHANGE_CAPACITY,
        ))
    }

    fn build(transport: Arc<dyn Transport>, kinds: Vec<OperationKind>, capacity: usize) -> Self {
        let cache = Arc::new(CacheStore::with_capacity(capacity));
        let synchronizers = kinds
            .into_iter()
            .map(|kind| ProgressSynchronizer::new(kind, Arc::clone(&cache), Arc::clone(&transport)))
            .collect();

        Self {
            connection: ConnectionManager::new(transport),
            cache,
            synchronizers,
        }
    }

    /// Subscribe every synchronizer, then connect
    pub fn start(&self) {
        for sync in &self.synchronizers {
            sync.subscribe();
        }
        self.connection.connect();
    }

    /// End the session: unbind progress channels and hard-disconnect
    pub fn shutdown(&self) {
        for sync in &self.synchronizers {
            sync.teardown();
        }
        self.connection.disconnect(true);
        info!("Link client shut down");
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn cache(&self) -> &Arc<CacheStore<ProgressRecord>> {
        &self.cache
    }

    /// Synchronizer for the named operation kind
    pub fn progress(&self, kind: &str) -> Result<&ProgressSynchronizer, LinkError> {
        self.synchronizers
            .iter()
            .find(|sync| sync.kind().name() == kind)
            .ok_or_else(|| LinkError::UnknownOperation(kind.to_string()))
    }

    pub fn backup(&self) -> Result<&ProgressSynchronizer, LinkError> {
        self.progress(OperationKind::backup().name())
    }

    pub fn restore(&self) -> Result<&ProgressSynchronizer, LinkError> {
        self.progress(OperationKind::restore().name())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &OperationKind> {
        self.synchronizers.iter().map(ProgressSynchronizer::kind)
    }

    pub fn synchronizers(&self) -> &[ProgressSynchronizer] {
        &self.synchronizers
    }
}
