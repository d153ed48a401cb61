//! MemoryMutationLog: a `MutationLog` that keeps everything in process.
//!
//! Useful for tests and for hosts that persist the log some other way. All
//! state sits behind one `parking_lot::Mutex`, so every operation is atomic
//! with respect to concurrent callers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::types::{DiscardedMutation, Mutation, User};

use super::traits::MutationLog;

#[derive(Default)]
struct LogState {
    next_sequence: i64,
    /// sequence → pending mutation
    pending: BTreeMap<i64, Mutation>,
    /// mutation id → sequence, for pending mutations
    pending_ids: HashMap<String, i64>,
    /// sequence → discarded mutation
    discarded: BTreeMap<i64, DiscardedMutation>,
    users: HashMap<String, User>,
}

#[derive(Default)]
pub struct MemoryMutationLog {
    state: Mutex<LogState>,
}

impl MemoryMutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total pending mutations across all scopes.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl MutationLog for MemoryMutationLog {
    fn append(&self, mut mutation: Mutation) -> Result<Mutation> {
        let mut state = self.state.lock();
        let duplicate = state.pending_ids.contains_key(&mutation.id)
            || state.discarded.values().any(|d| d.mutation.id == mutation.id);
        if duplicate {
            return Err(StorageError::Transaction {
                message: format!("mutation {} already appended", mutation.id),
                source: None,
            }
            .into());
        }

        state.next_sequence += 1;
        mutation.sequence = state.next_sequence;
        state
            .pending_ids
            .insert(mutation.id.clone(), mutation.sequence);
        state.pending.insert(mutation.sequence, mutation.clone());
        Ok(mutation)
    }

    fn pending_for(&self, scope_id: &str) -> Result<Vec<Mutation>> {
        let state = self.state.lock();
        Ok(state
            .pending
            .values()
            .filter(|m| m.feature_id == scope_id)
            .cloned()
            .collect())
    }

    fn finalize(&self, mutations: &[Mutation]) -> Result<usize> {
        let mut state = self.state.lock();
        let mut removed = 0;
        for mutation in mutations {
            if let Some(seq) = state.pending_ids.remove(&mutation.id) {
                state.pending.remove(&seq);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn mark_retry(&self, mutations: &[Mutation], error: &str) -> Result<()> {
        let mut state = self.state.lock();
        for mutation in mutations {
            let Some(seq) = state.pending_ids.get(&mutation.id).copied() else {
                continue;
            };
            if let Some(stored) = state.pending.get_mut(&seq) {
                stored.retry_count += 1;
                stored.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    fn user_of(&self, user_id: &str) -> Result<User> {
        self.state
            .lock()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| StorageError::user_not_found(user_id).into())
    }

    fn discard(&self, mutations: &[Mutation], reason: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let mut moved = 0;
        for mutation in mutations {
            let Some(seq) = state.pending_ids.remove(&mutation.id) else {
                continue;
            };
            if let Some(stored) = state.pending.remove(&seq) {
                state.discarded.insert(
                    seq,
                    DiscardedMutation {
                        mutation: stored,
                        reason: reason.to_string(),
                    },
                );
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn discarded(&self, scope_id: &str) -> Result<Vec<DiscardedMutation>> {
        let state = self.state.lock();
        Ok(state
            .discarded
            .values()
            .filter(|d| d.mutation.feature_id == scope_id)
            .cloned()
            .collect())
    }

    fn reset_retries(&self, scope_id: &str) -> Result<usize> {
        let mut state = self.state.lock();
        let mut reset = 0;
        for mutation in state.pending.values_mut() {
            if mutation.feature_id == scope_id
                && (mutation.retry_count > 0 || mutation.last_error.is_some())
            {
                mutation.retry_count = 0;
                mutation.last_error = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    fn pending_scopes(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        let scopes: BTreeSet<&str> = state
            .pending
            .values()
            .map(|m| m.feature_id.as_str())
            .collect();
        Ok(scopes.into_iter().map(str::to_string).collect())
    }

    fn put_user(&self, user: &User) -> Result<()> {
        self.state
            .lock()
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn remove_user(&self, user_id: &str) -> Result<bool> {
        Ok(self.state.lock().users.remove(user_id).is_some())
    }
}
