/// Storage traits for the local mutation log.
///
/// `MutationLog` is the single source of truth for what remote state should
/// eventually look like. Concrete implementations live next to this module
/// (in-memory and SQLite).
use crate::error::Result;
use crate::types::{DiscardedMutation, Mutation, User};

/// Durable, ordered record of pending local changes.
///
/// Implementors must be `Send + Sync` so one log can be shared by concurrent
/// sync attempts. `append`, `finalize`, `mark_retry`, `discard` and
/// `reset_retries` must each be atomic with respect to concurrent callers.
///
/// # Threading
/// All methods are synchronous. The SQLite implementation blocks the calling
/// thread for the duration of the statement.
pub trait MutationLog: Send + Sync {
    /// Persist a new mutation and return it with its assigned `sequence`.
    /// Fails only on storage-layer failure; never drops silently.
    fn append(&self, mutation: Mutation) -> Result<Mutation>;

    /// All pending mutations for a scope (feature id) in creation order.
    fn pending_for(&self, scope_id: &str) -> Result<Vec<Mutation>>;

    /// Remove the given mutations from pending state. Already-removed
    /// mutations are ignored. Returns how many were actually removed.
    fn finalize(&self, mutations: &[Mutation]) -> Result<usize>;

    /// Increment `retry_count` and set `last_error` on each mutation that is
    /// still pending. Does not change ordering.
    fn mark_retry(&self, mutations: &[Mutation], error: &str) -> Result<()>;

    /// Resolve the attribution user. Returns `StorageError::NotFound` with
    /// kind `"user"` when the local record is gone.
    fn user_of(&self, user_id: &str) -> Result<User>;

    /// Move mutations out of pending state without remote effect, keeping
    /// them with `reason` for manual cleanup. Returns how many moved.
    fn discard(&self, mutations: &[Mutation], reason: &str) -> Result<usize>;

    /// Discarded mutations of a scope in creation order.
    fn discarded(&self, scope_id: &str) -> Result<Vec<DiscardedMutation>>;

    /// Clear `retry_count` and `last_error` for every pending mutation of a
    /// scope. Returns how many were reset.
    fn reset_retries(&self, scope_id: &str) -> Result<usize>;

    /// Distinct scopes that still have pending mutations.
    fn pending_scopes(&self) -> Result<Vec<String>>;

    /// Insert or replace a local user record.
    fn put_user(&self, user: &User) -> Result<()>;

    /// Remove a local user record. Returns whether it existed.
    fn remove_user(&self, user_id: &str) -> Result<bool>;
}
