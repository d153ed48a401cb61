use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Failure of the local mutation log. Every variant is fatal to the current
/// sync attempt.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Storage corruption in {table}/{id}: failed to parse \"{field}\" column")]
    Corruption {
        table: String,
        id: String,
        field: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub fn user_not_found(user_id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: "user".to_string(),
            id: user_id.into(),
        }
    }

    /// True for the `NotFound` raised by `MutationLog::user_of`.
    pub fn is_user_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { kind, .. } if kind == "user")
    }
}

// ---------------------------------------------------------------------------
// RemoteApplyError
// ---------------------------------------------------------------------------

/// Classification of remote commit failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network loss, timeouts, temporary unavailability
    Transient,
    /// Rejected by the remote store
    Permanent,
    /// Authentication or authorization failed
    Auth,
    /// Rate limit or quota exceeded
    Capacity,
    /// A mutation kind the gateway cannot interpret reached it
    Unsupported,
}

/// Failure of an atomic batch commit. Nothing in the batch took effect.
#[derive(Debug, Clone)]
pub struct RemoteApplyError {
    pub message: String,
    pub kind: RemoteErrorKind,
}

impl RemoteApplyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: RemoteErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: RemoteErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl fmt::Display for RemoteApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteApplyError {}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unsupported mutation {id}: unrecognized kind \"{kind}\"")]
    UnsupportedMutation { id: String, kind: String },

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("Remote apply failed: {0}")]
    RemoteApply(#[from] RemoteApplyError),

    #[error("Local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    #[error("Photo transfer queue error: {0}")]
    TransferQueue(String),

    #[error("Sync scheduler disposed")]
    Disposed,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// SurveySyncError: top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SurveySyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SurveySyncError {
    /// True when the underlying failure is a missing user record.
    pub fn is_user_not_found(&self) -> bool {
        match self {
            SurveySyncError::Storage(e) => e.is_user_not_found(),
            SurveySyncError::Sync(SyncError::Storage(e)) => e.is_user_not_found(),
            SurveySyncError::Sync(SyncError::UserNotFound(_)) => true,
            _ => false,
        }
    }
}

/// Convenience alias; the default error type is `SurveySyncError`.
pub type Result<T, E = SurveySyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
