//! SyncScheduler tests: coalescing, cooldown, flush and disposal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use survey_sync::error::{SurveySyncError, SyncError};
use survey_sync::storage::traits::MutationLog;
use survey_sync::sync::trigger::{ChannelTrigger, SyncRequest, SyncTrigger};
use survey_sync::sync::SyncScheduler;
use survey_sync::types::{Mutation, MutationType};

use super::support::{add_users, make_harness, Harness};

fn make_scheduler(throttle_ms: Option<u64>) -> (Arc<SyncScheduler>, Harness, Arc<AtomicUsize>) {
    let h = make_harness(&[], None);
    add_users(h.log.as_ref(), &["u1"]);
    let apply_count = Arc::new(AtomicUsize::new(0));
    let ac = apply_count.clone();
    h.gateway.on_apply(move |_, _| {
        ac.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let scheduler = Arc::new(SyncScheduler::new(h.worker.clone(), throttle_ms));
    (scheduler, h, apply_count)
}

fn append(h: &Harness, feature_id: &str) {
    h.log
        .append(Mutation::feature("s1", feature_id, "u1", MutationType::Update))
        .unwrap();
}

fn is_disposed(err: &SurveySyncError) -> bool {
    matches!(err, SurveySyncError::Sync(SyncError::Disposed))
}

// ============================================================================
// Basic Scheduling Tests
// ============================================================================

#[tokio::test]
async fn fires_immediately_on_first_call() {
    let (scheduler, h, apply_count) = make_scheduler(Some(100));
    append(&h, "f1");

    let report = scheduler.schedule("f1").await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(apply_count.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Throttle/Coalesce Tests
// ============================================================================

#[tokio::test]
async fn coalesces_calls_during_cooldown() {
    let (scheduler, h, apply_count) = make_scheduler(Some(50));
    append(&h, "f1");

    scheduler.schedule("f1").await.unwrap();
    assert_eq!(apply_count.load(Ordering::SeqCst), 1);

    // New edits during cooldown; both callers share one follow-up attempt
    append(&h, "f1");
    let s2 = scheduler.clone();
    let s3 = scheduler.clone();
    let (r2, r3) = tokio::join!(async move { s2.schedule("f1").await }, async move {
        s3.schedule("f1").await
    });

    let r2 = r2.unwrap();
    let r3 = r3.unwrap();
    assert_eq!(r2.applied, 1);
    assert_eq!(r3.applied, 1);

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    assert_eq!(apply_count.load(Ordering::SeqCst), 2);
    assert_eq!(h.log.pending_len(), 0);
}

#[tokio::test]
async fn coalesces_calls_during_running_attempt() {
    let (scheduler, h, apply_count) = make_scheduler(Some(10));
    append(&h, "f1");
    h.gateway.set_delay_ms(20);

    let s1 = scheduler.clone();
    let s2 = scheduler.clone();
    let (r1, r2) = tokio::join!(async move { s1.schedule("f1").await }, async move {
        s2.schedule("f1").await
    });

    assert!(r1.is_ok());
    assert!(r2.is_ok());
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    assert_eq!(apply_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scopes_use_independent_slots() {
    let (scheduler, h, apply_count) = make_scheduler(Some(5000));
    append(&h, "f1");
    append(&h, "f2");

    // f1 enters a long cooldown; f2 is not delayed by it
    scheduler.schedule("f1").await.unwrap();
    let report = tokio::time::timeout(
        tokio::time::Duration::from_millis(500),
        scheduler.schedule("f2"),
    )
    .await
    .expect("f2 should not wait for f1's cooldown")
    .unwrap();

    assert_eq!(report.scope, "f2");
    assert_eq!(apply_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn schedule_all_covers_pending_scopes() {
    let (scheduler, h, _) = make_scheduler(Some(10));
    append(&h, "f1");
    append(&h, "f2");
    append(&h, "f3");

    let reports = scheduler.schedule_all().await.unwrap();

    assert_eq!(reports.len(), 3);
    assert_eq!(h.log.pending_len(), 0);
}

// ============================================================================
// Flush Tests
// ============================================================================

#[tokio::test]
async fn flush_bypasses_throttle() {
    let (scheduler, h, apply_count) = make_scheduler(Some(5000));
    append(&h, "f1");
    scheduler.schedule("f1").await.unwrap();

    append(&h, "f1");
    let report = scheduler.flush("f1").await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(apply_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn flush_all_runs_every_scope() {
    let (scheduler, h, _) = make_scheduler(Some(5000));
    append(&h, "f1");
    append(&h, "f2");

    let reports = scheduler.flush_all().await.unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.is_success()));
}

// ============================================================================
// Disposal Tests
// ============================================================================

#[tokio::test]
async fn rejects_new_calls_after_dispose() {
    let (scheduler, _h, _) = make_scheduler(Some(100));

    scheduler.dispose();

    let err = scheduler.schedule("f1").await.unwrap_err();
    assert!(is_disposed(&err));
    assert!(is_disposed(&scheduler.schedule_all().await.unwrap_err()));
}

#[tokio::test]
async fn rejects_queued_callers_on_dispose() {
    let (scheduler, h, _) = make_scheduler(Some(5000));
    append(&h, "f1");
    scheduler.schedule("f1").await.unwrap();

    // Queue a second call during cooldown
    let s2 = scheduler.clone();
    let handle = tokio::spawn(async move { s2.schedule("f1").await });
    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    scheduler.dispose();

    let result = handle.await.unwrap();
    assert!(is_disposed(&result.unwrap_err()));
}

#[tokio::test]
async fn failed_attempt_is_reported_and_scheduler_stays_usable() {
    let (scheduler, h, _) = make_scheduler(Some(10));
    append(&h, "f1");
    h.gateway.fail_for_user("u1");

    let first = scheduler.schedule("f1").await.unwrap();
    assert!(!first.is_success());

    h.gateway.on_apply(|_, _| Ok(()));
    tokio::time::sleep(tokio::time::Duration::from_millis(30)).await;

    let second = scheduler.schedule("f1").await.unwrap();
    assert!(second.is_success());
    assert_eq!(h.log.pending_len(), 0);
}

#[tokio::test]
async fn dropped_caller_does_not_wedge_scope() {
    let (scheduler, h, apply_count) = make_scheduler(Some(10));
    append(&h, "f1");
    h.gateway.set_delay_ms(200);

    // Caller gives up while the attempt is inside the gateway
    let abandoned = tokio::time::timeout(
        tokio::time::Duration::from_millis(50),
        scheduler.schedule("f1"),
    )
    .await;
    assert!(abandoned.is_err());

    h.gateway.set_delay_ms(0);
    let report = tokio::time::timeout(
        tokio::time::Duration::from_secs(2),
        scheduler.schedule("f1"),
    )
    .await
    .expect("scope should accept requests after a dropped caller")
    .unwrap();

    assert!(report.is_success());
    assert_eq!(apply_count.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.pending_len(), 0);
}

// ============================================================================
// Trigger-driven scheduling
// ============================================================================

#[tokio::test]
async fn drive_consumes_trigger_requests() {
    let (scheduler, h, apply_count) = make_scheduler(Some(10));
    append(&h, "f1");
    append(&h, "f2");

    let (trigger, receiver) = ChannelTrigger::new();
    let driver = tokio::spawn(scheduler.clone().drive(receiver));

    trigger.request_sync(SyncRequest::new("f1"));
    trigger.request_sync(SyncRequest::new("f2"));
    drop(trigger);

    driver.await.unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    assert_eq!(apply_count.load(Ordering::SeqCst), 2);
    assert_eq!(h.log.pending_len(), 0);
}
