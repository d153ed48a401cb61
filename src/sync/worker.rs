//! SyncWorker: drains the mutation log for one scope per attempt.
//!
//! An attempt loads the scope's pending mutations, groups them into per-user
//! batches, applies each batch through the remote gateway, enqueues photo
//! transfers for committed batches and reconciles the log. Absorbed errors
//! (missing user, missing photo file, unsupported kind) are recorded in the
//! `AttemptReport`; storage failures abort the attempt with `Err`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{OrphanPolicy, SyncConfig};
use crate::error::{RemoteErrorKind, Result, SyncError};
use crate::storage::traits::MutationLog;
use crate::types::{Mutation, MutationType, User};

use super::batcher::{plan_batches, EntityKey, UserBatch};
use super::gateway::RemoteGateway;
use super::photos::PhotoTransferManager;
use super::types::*;

// ============================================================================
// SyncWorker
// ============================================================================

pub struct SyncWorker {
    log: Arc<dyn MutationLog>,
    gateway: Arc<dyn RemoteGateway>,
    photos: Arc<PhotoTransferManager>,
    config: SyncConfig,
    on_error: Option<Arc<SyncErrorCallback>>,
    on_progress: Option<Arc<SyncProgressCallback>>,
    on_state: Option<Arc<SyncStateCallback>>,
    /// Per-scope async locks; one attempt per scope at a time
    locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

/// Mutable bookkeeping for one attempt.
struct Attempt<'a> {
    scope: &'a str,
    report: AttemptReport,
    /// Entities whose mutations may not be sent for the rest of the attempt
    blocked: HashSet<EntityKey>,
    /// Mutations already moved out of the log by this attempt
    dropped: HashSet<String>,
    failed: bool,
}

/// Holds a scope's entry in `SyncWorker::locks`. The entry is removed on
/// drop once no other attempt holds or waits on it.
struct ScopeLock<'a> {
    locks: &'a Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
    scope: &'a str,
    lock: Arc<TokioMutex<()>>,
}

impl<'a> ScopeLock<'a> {
    fn acquire(locks: &'a Mutex<HashMap<String, Arc<TokioMutex<()>>>>, scope: &'a str) -> Self {
        let lock = locks
            .lock()
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone();
        Self { locks, scope, lock }
    }
}

impl Drop for ScopeLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // One reference in the map, one here
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(self.scope)
                .is_some_and(|l| Arc::ptr_eq(l, &self.lock))
        {
            locks.remove(self.scope);
        }
    }
}

impl SyncWorker {
    pub fn new(options: SyncWorkerOptions) -> Self {
        Self {
            log: options.log,
            gateway: options.gateway,
            photos: options.photos,
            config: options.config.unwrap_or_default(),
            on_error: options.on_error,
            on_progress: options.on_progress,
            on_state: options.on_state,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn MutationLog> {
        &self.log
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Run one sync attempt for `scope` (a feature id).
    ///
    /// Waits for any attempt already running for the same scope. Dropping the
    /// returned future is equivalent to a failed attempt: committed batches
    /// are finalized, everything else stays pending.
    pub async fn run(&self, scope: &str) -> Result<AttemptReport> {
        let scope_lock = ScopeLock::acquire(&self.locks, scope);
        let _guard = scope_lock.lock.lock().await;
        self.run_attempt(scope)
            .instrument(info_span!("sync_attempt", scope))
            .await
    }

    /// Run an attempt for every scope with pending mutations, in scope order.
    pub async fn run_all(&self) -> Result<Vec<AttemptReport>> {
        let scopes = self.log.pending_scopes()?;
        let mut reports = Vec::with_capacity(scopes.len());
        for scope in scopes {
            reports.push(self.run(&scope).await?);
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Attempt
    // -----------------------------------------------------------------------

    async fn run_attempt(&self, scope: &str) -> Result<AttemptReport> {
        self.set_state(scope, SyncState::Idle);
        let mut attempt = Attempt {
            scope,
            report: AttemptReport::new(scope),
            blocked: HashSet::new(),
            dropped: HashSet::new(),
            failed: false,
        };

        match self.drive(&mut attempt).await {
            Ok(()) => {
                let report = attempt.report;
                info!(
                    outcome = ?report.outcome,
                    applied = report.applied,
                    retried = report.retried,
                    discarded = report.discarded,
                    held = report.held,
                    skipped_unsupported = report.skipped_unsupported,
                    photo_tasks = report.photo_tasks,
                    "sync attempt finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "sync attempt aborted");
                self.set_state(scope, SyncState::Failed);
                Err(e)
            }
        }
    }

    async fn drive(&self, attempt: &mut Attempt<'_>) -> Result<()> {
        let scope = attempt.scope;

        self.set_state(scope, SyncState::LoadingPending);
        let pending = self.log.pending_for(scope)?;
        if pending.is_empty() {
            debug!("no pending mutations");
            self.set_state(scope, SyncState::Done);
            return Ok(());
        }

        self.set_state(scope, SyncState::Grouping);
        let eligible = self.hold_abandoned(attempt, pending);
        let plan = plan_batches(eligible);
        for (mutation, err) in plan.rejected {
            attempt.report.skipped_unsupported += 1;
            self.record_error(
                attempt,
                SyncPhase::Grouping,
                Some(&mutation),
                &err.to_string(),
                None,
            );
        }

        let total = plan.batches.len();
        for (index, batch) in plan.batches.into_iter().enumerate() {
            self.set_state(
                scope,
                SyncState::Applying {
                    index,
                    total,
                    user_id: batch.user_id.clone(),
                },
            );
            self.apply_group(attempt, batch).await?;
            self.report_progress(scope, index + 1, total);
        }

        self.set_state(scope, SyncState::Reconciling);
        if attempt.failed {
            attempt.report.outcome = AttemptOutcome::Failed;
            self.set_state(scope, SyncState::Failed);
        } else {
            self.set_state(scope, SyncState::Done);
        }
        Ok(())
    }

    /// Split off abandoned mutations and every later mutation of the same
    /// entity. Returns the rest in creation order.
    fn hold_abandoned(&self, attempt: &mut Attempt<'_>, mut pending: Vec<Mutation>) -> Vec<Mutation> {
        pending.sort_by_key(|m| m.sequence);
        let max = self.config.max_retry_count;
        let mut stalled: HashSet<EntityKey> = HashSet::new();
        let mut eligible = Vec::with_capacity(pending.len());

        for mutation in pending {
            let key = EntityKey::of(&mutation);
            if mutation.is_abandoned(max) {
                attempt.report.held += 1;
                let message = format!(
                    "abandoned after {} failed attempts: {}",
                    mutation.retry_count,
                    mutation.last_error.as_deref().unwrap_or("unknown error")
                );
                warn!(mutation_id = %mutation.id, retry_count = mutation.retry_count, "mutation abandoned");
                self.record_error(attempt, SyncPhase::Holding, Some(&mutation), &message, None);
                stalled.insert(key);
            } else if stalled.contains(&key) {
                attempt.report.held += 1;
                debug!(mutation_id = %mutation.id, "held behind abandoned mutation");
            } else {
                eligible.push(mutation);
            }
        }

        eligible
    }

    async fn apply_group(&self, attempt: &mut Attempt<'_>, mut batch: UserBatch) -> Result<()> {
        batch.mutations.retain(|m| !attempt.dropped.contains(&m.id));
        let (held, send): (Vec<Mutation>, Vec<Mutation>) = batch
            .mutations
            .into_iter()
            .partition(|m| attempt.blocked.contains(&EntityKey::of(m)));
        if !held.is_empty() {
            debug!(count = held.len(), "held behind failed batch");
            attempt.report.held += held.len();
        }
        if send.is_empty() {
            return Ok(());
        }

        let user = match self.log.user_of(&batch.user_id) {
            Ok(user) => user,
            Err(e) if e.is_user_not_found() => {
                return self.resolve_orphans(attempt, &batch.user_id, send);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.gateway.apply_batch(&send, &user).await {
            error!(user_id = %user.id, count = send.len(), error = %e, "remote apply failed");
            let kind = e.kind.clone();
            self.fail_group(attempt, &send, &user, &e.to_string(), Some(kind))?;
            return Ok(());
        }

        match self.photos.enqueue_for(&send) {
            Ok(summary) => {
                attempt.report.photo_tasks += summary.enqueued;
                for skipped in summary.skipped {
                    self.record_event(
                        attempt,
                        SyncPhase::Photos,
                        Some(skipped.mutation_id),
                        Some(user.id.clone()),
                        skipped.reason,
                        None,
                    );
                }
            }
            Err(e) => {
                // Committed remotely; retrying reapplies the same writes.
                error!(user_id = %user.id, error = %e, "photo transfer enqueue failed");
                self.fail_group(attempt, &send, &user, &e.to_string(), None)?;
                return Ok(());
            }
        }

        let finalized = self.log.finalize(&send)?;
        debug!(user_id = %user.id, finalized, "batch committed");
        attempt.report.applied += finalized;
        Ok(())
    }

    fn fail_group(
        &self,
        attempt: &mut Attempt<'_>,
        send: &[Mutation],
        user: &User,
        message: &str,
        kind: Option<RemoteErrorKind>,
    ) -> Result<()> {
        self.log.mark_retry(send, message)?;
        attempt.report.retried += send.len();
        attempt.failed = true;
        attempt.blocked.extend(send.iter().map(EntityKey::of));
        self.record_event(
            attempt,
            SyncPhase::Apply,
            None,
            Some(user.id.clone()),
            message.to_string(),
            kind,
        );
        Ok(())
    }

    /// The group's author is gone locally: resolve it without remote effect.
    fn resolve_orphans(
        &self,
        attempt: &mut Attempt<'_>,
        user_id: &str,
        send: Vec<Mutation>,
    ) -> Result<()> {
        let reason = SyncError::UserNotFound(user_id.to_string()).to_string();
        warn!(user_id, count = send.len(), policy = ?self.config.orphan_policy, "attribution user missing");
        self.record_event(
            attempt,
            SyncPhase::ResolveUser,
            None,
            Some(user_id.to_string()),
            reason.clone(),
            None,
        );

        match self.config.orphan_policy {
            OrphanPolicy::Discard => {
                let discard_reason = format!("user {user_id} not found");
                attempt.report.discarded += self.log.discard(&send, &discard_reason)?;
                self.discard_dependents(attempt, &send, &discard_reason)?;
            }
            OrphanPolicy::Retain => {
                attempt.report.held += send.len();
                attempt.blocked.extend(send.iter().map(EntityKey::of));
            }
        }
        Ok(())
    }

    /// Discard every pending mutation that follows a discarded CREATE of
    /// the same entity, up to the next CREATE of that entity. The remote
    /// document they would change is never created.
    fn discard_dependents(
        &self,
        attempt: &mut Attempt<'_>,
        discarded: &[Mutation],
        reason: &str,
    ) -> Result<()> {
        let mut uncreated: HashMap<EntityKey, i64> = discarded
            .iter()
            .filter(|m| m.mutation_type == MutationType::Create)
            .map(|m| (EntityKey::of(m), m.sequence))
            .collect();
        if uncreated.is_empty() {
            return Ok(());
        }

        let mut dependents = Vec::new();
        for mutation in self.log.pending_for(attempt.scope)? {
            let key = EntityKey::of(&mutation);
            let Some(&created_at) = uncreated.get(&key) else {
                continue;
            };
            if mutation.sequence < created_at {
                continue;
            }
            if mutation.mutation_type == MutationType::Create {
                uncreated.remove(&key);
                continue;
            }
            dependents.push(mutation);
        }
        if dependents.is_empty() {
            return Ok(());
        }

        warn!(count = dependents.len(), "discarding mutations of uncreated entities");
        attempt.report.discarded += self.log.discard(&dependents, reason)?;
        for mutation in &dependents {
            self.record_error(attempt, SyncPhase::ResolveUser, Some(mutation), reason, None);
        }
        attempt
            .dropped
            .extend(dependents.into_iter().map(|m| m.id));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------------

    fn set_state(&self, scope: &str, state: SyncState) {
        debug!(state = %state, "state transition");
        if let Some(ref on_state) = self.on_state {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_state(scope, &state);
            }));
        }
    }

    fn report_progress(&self, scope: &str, processed: usize, total: usize) {
        if let Some(ref on_progress) = self.on_progress {
            let progress = SyncProgress {
                scope: scope.to_string(),
                processed,
                total,
            };
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_progress(&progress);
            }));
        }
    }

    fn record_error(
        &self,
        attempt: &mut Attempt<'_>,
        phase: SyncPhase,
        mutation: Option<&Mutation>,
        error: &str,
        kind: Option<RemoteErrorKind>,
    ) {
        self.record_event(
            attempt,
            phase,
            mutation.map(|m| m.id.clone()),
            mutation.map(|m| m.user_id.clone()),
            error.to_string(),
            kind,
        );
    }

    fn record_event(
        &self,
        attempt: &mut Attempt<'_>,
        phase: SyncPhase,
        mutation_id: Option<String>,
        user_id: Option<String>,
        error: String,
        kind: Option<RemoteErrorKind>,
    ) {
        let event = SyncErrorEvent {
            phase,
            scope: attempt.scope.to_string(),
            mutation_id,
            user_id,
            error,
            kind,
        };
        if let Some(ref on_error) = self.on_error {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                on_error(&event);
            }));
        }
        attempt.report.errors.push(event);
    }
}
