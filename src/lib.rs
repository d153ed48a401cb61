//! Offline survey mutation log and remote sync engine.
//!
//! Local edits are appended to a durable [`storage::MutationLog`]; a
//! [`sync::SyncWorker`] drains it per scope, replays each user's mutations
//! through a [`sync::RemoteGateway`] as one atomic batch, enqueues photo
//! transfers and reconciles the log.

pub mod config;
pub mod error;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::{OrphanPolicy, SyncConfig};
pub use error::{Result, SurveySyncError};
