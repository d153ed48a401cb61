//! Sync triggers: how local edits and hosts ask for a sync attempt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::traits::MutationLog;
use crate::types::Mutation;

/// Opaque task input handed to the job scheduler: the scope to sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub scope_id: String,
}

impl SyncRequest {
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
        }
    }
}

/// Something that can be asked to start a sync attempt for a scope.
pub trait SyncTrigger: Send + Sync {
    fn request_sync(&self, request: SyncRequest);
}

/// `SyncTrigger` backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelTrigger {
    tx: UnboundedSender<SyncRequest>,
}

pub struct TriggerReceiver {
    rx: UnboundedReceiver<SyncRequest>,
}

impl ChannelTrigger {
    pub fn new() -> (Self, TriggerReceiver) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, TriggerReceiver { rx })
    }
}

impl SyncTrigger for ChannelTrigger {
    fn request_sync(&self, request: SyncRequest) {
        if self.tx.send(request).is_err() {
            warn!("sync trigger receiver dropped; request ignored");
        }
    }
}

impl TriggerReceiver {
    pub async fn recv(&mut self) -> Option<SyncRequest> {
        self.rx.recv().await
    }

    /// Non-blocking poll, mostly for tests.
    pub fn try_recv(&mut self) -> Option<SyncRequest> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// MutationRecorder
// ============================================================================

/// Entry point for local edits: persist first, then ask for a sync.
pub struct MutationRecorder {
    log: Arc<dyn MutationLog>,
    trigger: Arc<dyn SyncTrigger>,
}

impl MutationRecorder {
    pub fn new(log: Arc<dyn MutationLog>, trigger: Arc<dyn SyncTrigger>) -> Self {
        Self { log, trigger }
    }

    /// Append `mutation` and request a sync for its scope. Nothing is
    /// triggered when the append fails.
    pub fn record(&self, mutation: Mutation) -> Result<Mutation> {
        let stored = self.log.append(mutation)?;
        debug!(
            mutation_id = %stored.id,
            sequence = stored.sequence,
            scope = %stored.feature_id,
            "mutation recorded"
        );
        self.trigger
            .request_sync(SyncRequest::new(stored.feature_id.clone()));
        Ok(stored)
    }
}
