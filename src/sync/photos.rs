//! Photo transfer manager.
//!
//! Turns the photo-typed field deltas of committed mutations into upload and
//! delete tasks on an external durable queue. Transfers themselves, and
//! their retries and deduplication, belong to that queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::types::{Mutation, PhotoTransferTask, TransferOperation};

// ============================================================================
// Collaborators
// ============================================================================

/// External durable queue that performs photo transfers.
///
/// Implementations dedupe on `PhotoTransferTask::identity()`, so enqueuing
/// the same task twice must not transfer twice.
pub trait PhotoTransferQueue: Send + Sync {
    fn enqueue(&self, task: PhotoTransferTask) -> Result<(), SyncError>;
}

/// Maps a logical remote photo path to the local file holding its bytes.
pub trait LocalFileResolver: Send + Sync {
    /// `SyncError::LocalFileNotFound` when the file no longer exists.
    fn local_file(&self, remote_path: &str) -> Result<PathBuf, SyncError>;
}

/// Resolves `a/b/photo.jpg` to `<root>/photo.jpg`.
#[derive(Debug, Clone)]
pub struct DirectoryFileResolver {
    root: PathBuf,
}

impl DirectoryFileResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LocalFileResolver for DirectoryFileResolver {
    fn local_file(&self, remote_path: &str) -> Result<PathBuf, SyncError> {
        let path = match Path::new(remote_path).file_name() {
            Some(name) => self.root.join(name),
            None => self.root.join(remote_path),
        };
        if path.is_file() {
            Ok(path)
        } else {
            Err(SyncError::LocalFileNotFound(path))
        }
    }
}

// ============================================================================
// PhotoTransferManager
// ============================================================================

/// An upload that could not be enqueued because its source is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedUpload {
    pub mutation_id: String,
    pub remote_path: String,
    pub reason: String,
}

/// Result of `PhotoTransferManager::enqueue_for`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoEnqueueSummary {
    pub enqueued: usize,
    pub skipped: Vec<SkippedUpload>,
}

pub struct PhotoTransferManager {
    queue: Arc<dyn PhotoTransferQueue>,
    files: Arc<dyn LocalFileResolver>,
}

impl PhotoTransferManager {
    pub fn new(queue: Arc<dyn PhotoTransferQueue>, files: Arc<dyn LocalFileResolver>) -> Self {
        Self { queue, files }
    }

    /// Hand one transfer to the queue. `local_path` is required for uploads
    /// and ignored for deletes.
    pub fn enqueue(
        &self,
        local_path: Option<PathBuf>,
        remote_path: &str,
        operation: TransferOperation,
    ) -> Result<(), SyncError> {
        let task = match operation {
            TransferOperation::Upload => {
                let local = local_path.ok_or_else(|| {
                    SyncError::LocalFileNotFound(PathBuf::from(remote_path))
                })?;
                PhotoTransferTask::upload(local, remote_path)
            }
            TransferOperation::Delete => PhotoTransferTask::delete(remote_path),
        };
        debug!(identity = %task.identity(), "enqueue photo transfer");
        self.queue.enqueue(task)
    }

    /// Enqueue transfers for every photo delta of `mutations`.
    ///
    /// Uploads `new_value` when present and its local file exists; a missing
    /// file is logged and skipped. Deletes `previous_value` when present and
    /// different from `new_value`. Queue failures propagate.
    pub fn enqueue_for(&self, mutations: &[Mutation]) -> Result<PhotoEnqueueSummary, SyncError> {
        let mut summary = PhotoEnqueueSummary::default();

        for mutation in mutations {
            for delta in mutation.photo_deltas() {
                if let Some(new_value) = delta.new_value.as_deref() {
                    match self.files.local_file(new_value) {
                        Ok(local) => {
                            self.enqueue(Some(local), new_value, TransferOperation::Upload)?;
                            summary.enqueued += 1;
                        }
                        Err(e) => {
                            warn!(
                                mutation_id = %mutation.id,
                                field_id = %delta.field_id,
                                remote_path = new_value,
                                error = %e,
                                "photo upload skipped"
                            );
                            summary.skipped.push(SkippedUpload {
                                mutation_id: mutation.id.clone(),
                                remote_path: new_value.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }

                if let Some(previous) = delta.previous_value.as_deref() {
                    if delta.new_value.as_deref() != Some(previous) {
                        self.enqueue(None, previous, TransferOperation::Delete)?;
                        summary.enqueued += 1;
                    }
                }
            }
        }

        Ok(summary)
    }
}
