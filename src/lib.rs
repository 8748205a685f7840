/*!
 * Shredspace - secure file deletion engine
 *
 * Overwrites or cryptographically wipes files before unlinking them, with
 * optional verified backups, per-path exclusivity and bounded concurrency
 * across a batch.
 *
 * Overwriting in place only reaches the original blocks on storage that
 * writes in place. Copy-on-write and log-structured filesystems, snapshots,
 * journals and SSD wear levelling can all keep older copies; see
 * [`storage::assess`] for the per-file warning the engine attaches.
 */

pub mod backup;
pub mod batch;
pub mod config;
pub mod crypto_wipe;
pub mod error;
pub mod job;
pub mod method;
pub mod overwrite;
pub mod pattern;
pub mod storage;

pub use crate::backup::{BackupInterceptor, BackupRecord, BackupStore, DirectoryBackup};
pub use crate::batch::{
    BatchCoordinator, BatchRequest, BatchResult, CancellationToken, ProgressEvent,
};
pub use crate::config::{Config, DeletionConfig, EngineOptions};
pub use crate::crypto_wipe::{CryptoWipeExecutor, CryptoWipeReceipt, EphemeralKey};
pub use crate::error::{ConfigurationError, Failure, FailureKind, WipeError};
pub use crate::job::{DeletionJob, FileOutcome, JobState, PassObserver, PassReport, SkipReason};
pub use crate::method::{DeletionMethod, PassKind, PassSpec, MAX_PASSES};
pub use crate::overwrite::{OverwriteExecutor, VerifyMode, DEFAULT_CHUNK_SIZE};
pub use crate::pattern::PatternKind;
pub use crate::storage::{OverwriteGuarantee, StorageAssessment};
