//! SyncScheduler: throttle/coalesce layer over `SyncWorker`.
//!
//! One slot per scope. A request for an idle scope runs immediately; requests
//! arriving while an attempt runs or during the cooldown after it share the
//! result of one follow-up attempt. Different scopes run concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, SurveySyncError, SyncError};

use super::trigger::TriggerReceiver;
use super::types::AttemptReport;
use super::worker::SyncWorker;

/// Result shared by every caller coalesced into one attempt.
pub type ScheduleResult = std::result::Result<AttemptReport, Arc<SurveySyncError>>;

type AttemptFuture = Pin<Box<dyn Future<Output = ScheduleResult> + Send>>;

fn disposed() -> Arc<SurveySyncError> {
    Arc::new(SyncError::Disposed.into())
}

// ============================================================================
// SyncScheduler
// ============================================================================

pub struct SyncScheduler {
    worker: Arc<SyncWorker>,
    throttle_ms: u64,
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<ScheduleSlot>>>>>,
    disposed: Arc<AtomicBool>,
}

/// Internal per-scope scheduling state.
struct ScheduleSlot {
    running: bool,
    cooldown_active: bool,
    /// Queued waiters; they all share the next attempt's result.
    queued_senders: Vec<oneshot::Sender<ScheduleResult>>,
}

impl ScheduleSlot {
    fn new() -> Self {
        Self {
            running: false,
            cooldown_active: false,
            queued_senders: Vec::new(),
        }
    }
}

/// What the caller should do after checking the slot state.
enum ScheduleAction {
    /// Slot is idle; caller runs the attempt now.
    Run,
    /// Slot is busy; caller awaits this receiver.
    Wait(oneshot::Receiver<ScheduleResult>),
}

impl SyncScheduler {
    /// Wrap `worker`. `throttle_ms` defaults to the worker's configured
    /// `throttle_ms`.
    pub fn new(worker: Arc<SyncWorker>, throttle_ms: Option<u64>) -> Self {
        let throttle_ms = throttle_ms.unwrap_or(worker.config().throttle_ms);
        Self {
            worker,
            throttle_ms,
            slots: Arc::new(Mutex::new(HashMap::new())),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedule an attempt for `scope`, coalescing with in-flight requests.
    pub async fn schedule(&self, scope: &str) -> ScheduleResult {
        self.check_disposed()?;
        let worker = self.worker.clone();
        let scope_owned = scope.to_string();
        self.schedule_slot(scope.to_string(), move || -> AttemptFuture {
            let worker = worker.clone();
            let scope = scope_owned.clone();
            Box::pin(async move { worker.run(&scope).await.map_err(Arc::new) })
        })
        .await
    }

    /// Schedule every scope that currently has pending mutations, one after
    /// the other. Stops at the first failed request.
    pub async fn schedule_all(&self) -> std::result::Result<Vec<AttemptReport>, Arc<SurveySyncError>> {
        self.check_disposed()?;
        let scopes = self.worker.log().pending_scopes().map_err(Arc::new)?;
        let mut reports = Vec::with_capacity(scopes.len());
        for scope in scopes {
            reports.push(self.schedule(&scope).await?);
        }
        Ok(reports)
    }

    /// Bypass throttle and run an attempt immediately.
    pub async fn flush(&self, scope: &str) -> Result<AttemptReport> {
        self.worker.run(scope).await
    }

    /// Bypass throttle and run every pending scope immediately.
    pub async fn flush_all(&self) -> Result<Vec<AttemptReport>> {
        self.worker.run_all().await
    }

    /// Consume sync requests until the channel closes or the scheduler is
    /// disposed. Each request is scheduled on its own task.
    pub async fn drive(self: Arc<Self>, mut receiver: TriggerReceiver) {
        while let Some(request) = receiver.recv().await {
            if self.is_disposed() {
                break;
            }
            let this = self.clone();
            tokio::spawn(async move {
                match this.schedule(&request.scope_id).await {
                    Ok(report) => debug!(
                        scope = %request.scope_id,
                        outcome = ?report.outcome,
                        "triggered sync finished"
                    ),
                    Err(e) => warn!(scope = %request.scope_id, error = %e, "triggered sync failed"),
                }
            });
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Dispose the scheduler: reject queued waiters and all future requests.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);

        let mut slots = self.slots.lock();
        for (_, slot_arc) in slots.drain() {
            let mut slot = slot_arc.lock();
            for sender in slot.queued_senders.drain(..) {
                let _ = sender.send(Err(disposed()));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn check_disposed(&self) -> std::result::Result<(), Arc<SurveySyncError>> {
        if self.is_disposed() {
            Err(disposed())
        } else {
            Ok(())
        }
    }

    /// Get or create the slot for a scope, then decide whether to run or
    /// wait. The map lock is held while the slot is inspected, so a slot
    /// being released cannot be claimed at the same time.
    fn check_slot(&self, key: &str) -> (Arc<Mutex<ScheduleSlot>>, ScheduleAction) {
        let mut slots = self.slots.lock();
        let slot_arc = slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ScheduleSlot::new())))
            .clone();

        let action = {
            let mut slot = slot_arc.lock();
            if slot.running || slot.cooldown_active {
                let (tx, rx) = oneshot::channel();
                slot.queued_senders.push(tx);
                ScheduleAction::Wait(rx)
            } else {
                slot.running = true;
                ScheduleAction::Run
            }
        };

        (slot_arc, action)
    }

    /// The attempt and the cooldown loop after it run on their own task, so
    /// a caller dropping its future never leaves the slot marked running.
    async fn schedule_slot<F>(&self, key: String, make_future: F) -> ScheduleResult
    where
        F: Fn() -> AttemptFuture + Send + Sync + 'static,
    {
        let rx = match self.check_slot(&key) {
            (_, ScheduleAction::Wait(rx)) => rx,
            (slot_arc, ScheduleAction::Run) => {
                let (tx, rx) = oneshot::channel();
                let cycle = SlotCycle {
                    key,
                    slot: slot_arc,
                    slots: self.slots.clone(),
                    throttle_ms: self.throttle_ms,
                    disposed: self.disposed.clone(),
                };
                tokio::spawn(cycle.run(tx, make_future));
                rx
            }
        };

        rx.await.unwrap_or_else(|_| Err(disposed()))
    }
}

// ============================================================================
// SlotCycle
// ============================================================================

/// One busy period of a slot: the first attempt, then follow-up attempts
/// for callers that queued meanwhile, each after a cooldown.
struct SlotCycle {
    key: String,
    slot: Arc<Mutex<ScheduleSlot>>,
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<ScheduleSlot>>>>>,
    throttle_ms: u64,
    disposed: Arc<AtomicBool>,
}

impl SlotCycle {
    async fn run<F>(self, first: oneshot::Sender<ScheduleResult>, make_future: F)
    where
        F: Fn() -> AttemptFuture + Send + Sync + 'static,
    {
        let result = make_future().await;

        // Leave running, enter cooldown, collect waiters that queued meanwhile
        let mut prev_senders = {
            let mut slot = self.slot.lock();
            slot.running = false;
            slot.cooldown_active = true;
            slot.queued_senders.drain(..).collect::<Vec<_>>()
        };
        let _ = first.send(result);

        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.throttle_ms)).await;

            let cooldown_senders = {
                let mut slot = self.slot.lock();
                slot.cooldown_active = false;
                slot.queued_senders.drain(..).collect::<Vec<_>>()
            };

            let mut all_senders = std::mem::take(&mut prev_senders);
            all_senders.extend(cooldown_senders);

            if all_senders.is_empty() {
                break;
            }

            if self.disposed.load(Ordering::SeqCst) {
                for sender in all_senders {
                    let _ = sender.send(Err(disposed()));
                }
                break;
            }

            self.slot.lock().running = true;

            let follow_result = make_future().await;

            let during_run_senders = {
                let mut slot = self.slot.lock();
                slot.running = false;
                slot.cooldown_active = true;
                slot.queued_senders.drain(..).collect::<Vec<_>>()
            };

            for sender in all_senders {
                let _ = sender.send(follow_result.clone());
            }

            if during_run_senders.is_empty() {
                self.slot.lock().cooldown_active = false;
                break;
            }
            prev_senders = during_run_senders;
        }

        self.release();
    }

    /// Drop the slot from the map if nobody claimed it since the loop ended.
    fn release(&self) {
        let mut slots = self.slots.lock();
        let idle = {
            let slot = self.slot.lock();
            !slot.running && !slot.cooldown_active && slot.queued_senders.is_empty()
        };
        if idle
            && slots
                .get(&self.key)
                .is_some_and(|s| Arc::ptr_eq(s, &self.slot))
        {
            slots.remove(&self.key);
            debug!(scope = %self.key, "released idle schedule slot");
        }
    }
}
