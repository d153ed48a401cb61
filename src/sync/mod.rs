pub mod batcher;
pub mod gateway;
pub mod photos;
pub mod scheduler;
pub mod trigger;
pub mod types;
pub mod worker;

pub use batcher::{plan_batches, BatchPlan, EntityKey, UserBatch};
pub use gateway::{BatchedWriteGateway, RemoteGateway, RemoteStore, RemoteWrite, WriteBatch};
pub use photos::{
    DirectoryFileResolver, LocalFileResolver, PhotoEnqueueSummary, PhotoTransferManager,
    PhotoTransferQueue, SkippedUpload,
};
pub use scheduler::{ScheduleResult, SyncScheduler};
pub use trigger::{ChannelTrigger, MutationRecorder, SyncRequest, SyncTrigger, TriggerReceiver};
pub use types::{
    AttemptOutcome, AttemptReport, SyncErrorCallback, SyncErrorEvent, SyncPhase, SyncProgress,
    SyncProgressCallback, SyncState, SyncStateCallback, SyncWorkerOptions, WorkResult,
};
pub use worker::SyncWorker;
