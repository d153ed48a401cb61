//! Sync-specific types: attempt states, reports, events and the options
//! struct the worker is built from.

use std::fmt;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::error::RemoteErrorKind;
use crate::storage::traits::MutationLog;

use super::gateway::RemoteGateway;
use super::photos::PhotoTransferManager;

// ============================================================================
// Attempt state machine
// ============================================================================

/// States of a single sync attempt.
///
/// `Idle → LoadingPending → Grouping → Applying → Reconciling → Done | Failed`.
/// An empty pending set goes straight from `LoadingPending` to `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    LoadingPending,
    Grouping,
    /// Applying batch `index` (0-based) of `total`
    Applying { index: usize, total: usize, user_id: String },
    Reconciling,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("IDLE"),
            SyncState::LoadingPending => f.write_str("LOADING_PENDING"),
            SyncState::Grouping => f.write_str("GROUPING"),
            SyncState::Applying { index, total, .. } => {
                write!(f, "APPLYING({}/{})", index + 1, total)
            }
            SyncState::Reconciling => f.write_str("RECONCILING"),
            SyncState::Done => f.write_str("DONE"),
            SyncState::Failed => f.write_str("FAILED"),
        }
    }
}

/// Terminal result of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Done,
    Failed,
}

/// Signal handed back to the external job scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    Success,
    /// Reschedule with the scheduler's own backoff
    Retry,
}

// ============================================================================
// Errors and progress
// ============================================================================

/// Which step of the attempt an error was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Grouping,
    ResolveUser,
    Apply,
    Photos,
    Holding,
}

/// A recorded, absorbed error. Collected in `AttemptReport.errors`.
#[derive(Debug, Clone)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub scope: String,
    /// Mutation id, when the error concerns a single mutation
    pub mutation_id: Option<String>,
    pub user_id: Option<String>,
    pub error: String,
    /// Set for remote failures
    pub kind: Option<RemoteErrorKind>,
}

/// Progress callback payload, fired once per processed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub scope: String,
    pub processed: usize,
    pub total: usize,
}

/// Summary of one sync attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub scope: String,
    pub outcome: AttemptOutcome,
    /// Mutations committed remotely and finalized
    pub applied: usize,
    /// Mutations whose retry metadata was bumped
    pub retried: usize,
    /// Mutations moved out of pending state (missing user)
    pub discarded: usize,
    /// Mutations with a kind the gateway cannot interpret; still pending
    pub skipped_unsupported: usize,
    /// Abandoned mutations plus those held back behind them or behind a
    /// failed batch; still pending
    pub held: usize,
    pub photo_tasks: usize,
    pub errors: Vec<SyncErrorEvent>,
}

impl AttemptReport {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            outcome: AttemptOutcome::Done,
            applied: 0,
            retried: 0,
            discarded: 0,
            skipped_unsupported: 0,
            held: 0,
            photo_tasks: 0,
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Done
    }

    pub fn work_result(&self) -> WorkResult {
        match self.outcome {
            AttemptOutcome::Done => WorkResult::Success,
            AttemptOutcome::Failed => WorkResult::Retry,
        }
    }
}

// ============================================================================
// SyncWorker options
// ============================================================================

/// Callback type for recorded sync errors.
pub type SyncErrorCallback = dyn Fn(&SyncErrorEvent) + Send + Sync;

/// Callback type for per-batch progress.
pub type SyncProgressCallback = dyn Fn(&SyncProgress) + Send + Sync;

/// Callback type for state transitions; receives `(scope, state)`.
pub type SyncStateCallback = dyn Fn(&str, &SyncState) + Send + Sync;

/// Configuration for `SyncWorker`.
pub struct SyncWorkerOptions {
    pub log: Arc<dyn MutationLog>,
    pub gateway: Arc<dyn RemoteGateway>,
    pub photos: Arc<PhotoTransferManager>,
    /// `None` = `SyncConfig::default()`
    pub config: Option<SyncConfig>,
    pub on_error: Option<Arc<SyncErrorCallback>>,
    pub on_progress: Option<Arc<SyncProgressCallback>>,
    pub on_state: Option<Arc<SyncStateCallback>>,
}

impl SyncWorkerOptions {
    /// Options with default config and no callbacks.
    pub fn new(
        log: Arc<dyn MutationLog>,
        gateway: Arc<dyn RemoteGateway>,
        photos: Arc<PhotoTransferManager>,
    ) -> Self {
        Self {
            log,
            gateway,
            photos,
            config: None,
            on_error: None,
            on_progress: None,
            on_state: None,
        }
    }
}
