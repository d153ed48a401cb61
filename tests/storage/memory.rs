//! Tests for MemoryMutationLog.

use std::sync::Arc;

use survey_sync::storage::memory::MemoryMutationLog;
use survey_sync::storage::traits::MutationLog;
use survey_sync::types::MutationType;

use super::contract;

// ============================================================================
// Shared contract
// ============================================================================

#[test]
fn append_assigns_increasing_sequence() {
    contract::append_assigns_increasing_sequence(&MemoryMutationLog::new());
}

#[test]
fn pending_for_is_scoped_and_ordered() {
    contract::pending_for_is_scoped_and_ordered(&MemoryMutationLog::new());
}

#[test]
fn stored_mutation_round_trips() {
    contract::stored_mutation_round_trips(&MemoryMutationLog::new());
}

#[test]
fn unrecognized_kind_survives_storage() {
    contract::unrecognized_kind_survives_storage(&MemoryMutationLog::new());
}

#[test]
fn duplicate_id_is_rejected() {
    contract::duplicate_id_is_rejected(&MemoryMutationLog::new());
}

#[test]
fn finalize_is_idempotent() {
    contract::finalize_is_idempotent(&MemoryMutationLog::new());
}

#[test]
fn mark_retry_increments_without_reordering() {
    contract::mark_retry_increments_without_reordering(&MemoryMutationLog::new());
}

#[test]
fn mark_retry_ignores_finalized() {
    contract::mark_retry_ignores_finalized(&MemoryMutationLog::new());
}

#[test]
fn user_of_resolves_and_reports_missing() {
    contract::user_of_resolves_and_reports_missing(&MemoryMutationLog::new());
}

#[test]
fn discard_moves_out_of_pending() {
    contract::discard_moves_out_of_pending(&MemoryMutationLog::new());
}

#[test]
fn reset_retries_clears_metadata() {
    contract::reset_retries_clears_metadata(&MemoryMutationLog::new());
}

#[test]
fn pending_scopes_are_distinct() {
    contract::pending_scopes_are_distinct(&MemoryMutationLog::new());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_appends_keep_unique_sequences() {
    let log = Arc::new(MemoryMutationLog::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let log = log.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    log.append(contract::feature(&format!("f{i}"), "u1", MutationType::Update))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(log.pending_len(), 200);
    let mut sequences: Vec<i64> = (0..8)
        .flat_map(|i| log.pending_for(&format!("f{i}")).unwrap())
        .map(|m| m.sequence)
        .collect();
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences.len(), 200);
}
