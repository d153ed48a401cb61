//! MutationRecorder and trigger tests.

use std::sync::Arc;

use parking_lot::Mutex;

use survey_sync::error::StorageError;
use survey_sync::storage::memory::MemoryMutationLog;
use survey_sync::storage::traits::MutationLog;
use survey_sync::sync::trigger::{ChannelTrigger, MutationRecorder, SyncRequest, SyncTrigger};
use survey_sync::types::{Mutation, MutationType};

/// Collects requests instead of sending them anywhere.
struct RecordingTrigger {
    requests: Mutex<Vec<SyncRequest>>,
}

impl RecordingTrigger {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().clone()
    }
}

impl SyncTrigger for RecordingTrigger {
    fn request_sync(&self, request: SyncRequest) {
        self.requests.lock().push(request);
    }
}

#[test]
fn record_appends_then_requests_scope_sync() {
    let log = Arc::new(MemoryMutationLog::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let recorder = MutationRecorder::new(log.clone(), trigger.clone());

    let stored = recorder
        .record(Mutation::observation(
            "s1",
            "f7",
            "o1",
            "u1",
            MutationType::Create,
        ))
        .unwrap();

    assert!(stored.sequence > 0);
    assert_eq!(log.pending_for("f7").unwrap(), vec![stored]);
    assert_eq!(trigger.requests(), vec![SyncRequest::new("f7")]);
}

#[test]
fn failed_append_triggers_nothing() {
    let log = Arc::new(MemoryMutationLog::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let recorder = MutationRecorder::new(log.clone(), trigger.clone());
    let m = Mutation::feature("s1", "f1", "u1", MutationType::Create).with_id("dup");

    recorder.record(m.clone()).unwrap();
    let err = recorder.record(m).unwrap_err();

    assert!(matches!(
        err,
        survey_sync::SurveySyncError::Storage(StorageError::Transaction { .. })
    ));
    assert_eq!(trigger.requests().len(), 1);
}

#[tokio::test]
async fn channel_trigger_feeds_receiver() {
    let log = Arc::new(MemoryMutationLog::new());
    let (trigger, mut receiver) = ChannelTrigger::new();
    let recorder = MutationRecorder::new(log, Arc::new(trigger));

    recorder
        .record(Mutation::feature("s1", "f1", "u1", MutationType::Create))
        .unwrap();
    recorder
        .record(Mutation::feature("s1", "f2", "u1", MutationType::Create))
        .unwrap();

    assert_eq!(receiver.recv().await, Some(SyncRequest::new("f1")));
    assert_eq!(receiver.recv().await, Some(SyncRequest::new("f2")));
}

#[test]
fn request_round_trips_as_task_input() {
    let request: SyncRequest = serde_json::from_str(r#"{"scopeId":"feature-42"}"#).unwrap();
    assert_eq!(request.scope_id, "feature-42");
}
