//! Progress Synchronizer
//!
//! Projects one progress channel into one cache slot.
//!
//! ```text
//! "<kind>Progress" { "<tag>": n }
//!        │
//!        ▼ decode (OperationKind::decode)
//! ProgressUpdate { stage, percent }
//!        │
//!        ▼ merge under the slot lock (CacheStore::update)
//! CacheStore["progress:<kind>"] ──► subscribers
//! ```
//!
//! The merge is one read-modify-write on the slot. A reset from another task
//! lands either before or after it, never in between.

use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::record::{OperationKind, ProgressRecord, ProgressSnapshot, ProgressUpdate};
use crate::cache::{CacheKey, CacheStore};
use crate::error::LinkError;
use crate::transport::Transport;

/// Keeps the cache entry of one operation kind in step with its channel.
pub struct ProgressSynchronizer {
    kind: OperationKind,
    key: CacheKey,
    cache: Arc<CacheStore<ProgressRecord>>,
    transport: Arc<dyn Transport>,
    subscribed: AtomicBool,
}

impl ProgressSynchronizer {
    /// Create a synchronizer and establish the zero record for its kind.
    pub fn new(
        kind: OperationKind,
        cache: Arc<CacheStore<ProgressRecord>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let key = CacheKey::progress(kind.name());
        cache.get_or_init(&key, ProgressRecord::zero());

        Self {
            kind,
            key,
            cache,
            transport,
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Bind the channel handler. Binding again replaces the previous handler.
    pub fn subscribe(&self) {
        let kind = self.kind.clone();
        let key = self.key.clone();
        let cache = Arc::clone(&self.cache);

        self.transport.on(
            self.kind.channel(),
            Arc::new(move |payload: &JsonValue| {
                handle_payload(&kind, &key, &cache, payload);
            }),
        );
        self.subscribed.store(true, Ordering::SeqCst);

        debug!(kind = %self.kind, channel = %self.kind.channel(), "Progress channel subscribed");
    }

    /// Unbind this channel's handler. The connection is left alone.
    pub fn teardown(&self) {
        if let Err(e) = self.transport.off(self.kind.channel()) {
            warn!(kind = %self.kind, error = %e, "Failed to unbind progress channel");
            return;
        }
        self.subscribed.store(false, Ordering::SeqCst);
        debug!(kind = %self.kind, "Progress channel unbound");
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Merge a decoded update. Returns whether the record changed.
    pub fn apply(&self, update: ProgressUpdate) -> bool {
        merge(&self.key, &self.cache, update)
    }

    pub fn record(&self) -> ProgressRecord {
        self.cache.get_or_init(&self.key, ProgressRecord::zero())
    }

    pub fn current_progress(&self) -> ProgressSnapshot {
        self.record().snapshot()
    }

    pub fn is_complete(&self) -> bool {
        self.record().is_complete()
    }

    /// Overwrite the record with zero. Does not cancel anything on the node.
    pub fn reset_progress(&self) {
        self.cache.set(&self.key, ProgressRecord::zero());
        info!(kind = %self.kind, "Progress reset");
    }

    /// Reset and label the record, e.g. with the archive being produced
    pub fn start(&self, label: impl Into<String>) {
        let record = ProgressRecord::labelled(label);
        info!(kind = %self.kind, label = ?record.aux, "Progress started");
        self.cache.set(&self.key, record);
    }

    /// Every write to the record, in write order
    pub fn changes(&self) -> broadcast::Receiver<ProgressRecord> {
        self.cache.subscribe(&self.key)
    }

    /// Latest record
    pub fn watch(&self) -> watch::Receiver<ProgressRecord> {
        self.cache.watch(&self.key)
    }
}

fn merge(key: &CacheKey, cache: &CacheStore<ProgressRecord>, update: ProgressUpdate) -> bool {
    cache.update(key, |current| current.merge(update))
}

fn handle_payload(
    kind: &OperationKind,
    key: &CacheKey,
    cache: &CacheStore<ProgressRecord>,
    payload: &JsonValue,
) {
    match kind.decode(payload) {
        Ok(update) => {
            let changed = merge(key, cache, update);
            debug!(
                kind = %kind,
                stage = kind.tag(update.stage),
                percent = update.percent,
                changed = changed,
                "Progress update"
            );
        }
        Err(LinkError::UnknownStage { tag, .. }) => {
            debug!(kind = %kind, tag = %tag, "Ignoring unrecognized stage tag");
        }
        Err(e) => {
            warn!(kind = %kind, error = %e, "Ignoring malformed progress payload");
        }
    }
}
