//! The deletion job: one target file driven through its passes, verification and unlink.
//!
//! States only move forward:
//!
//! ```text
//! Pending -> [Backup] -> Overwriting(1) -> .. -> Overwriting(n) -> Verifying -> Unlinking -> Done
//! ```
//!
//! with `Failed` reachable from every non-terminal state. Nothing is retried
//! inside a job; a retry is a new job.

use std::io;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backup::{BackupInterceptor, BackupRecord};
use crate::config::EngineOptions;
use crate::crypto_wipe::{CryptoWipeExecutor, CryptoWipeReceipt};
use crate::error::{Failure, FailureKind, WipeError};
use crate::method::{DeletionMethod, PassKind, PassSpec};
use crate::overwrite::{no_follow, sample_offsets, ChunkDigest, OverwriteExecutor};
use crate::storage::{self, StorageAssessment};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Backup,
    Overwriting { pass: usize },
    Verifying,
    Unlinking,
    Done,
    Failed(Failure),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }

    fn permits(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Done, _) | (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Pending, Backup) => true,
            (Pending, Overwriting { pass: 1 }) | (Backup, Overwriting { pass: 1 }) => true,
            (Overwriting { pass: from }, Overwriting { pass: to }) => *to == from + 1,
            (Overwriting { .. }, Verifying) => true,
            (Verifying, Unlinking) => true,
            (Unlinking, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyInProgress,
    Cancelled,
}

/// Exactly one of these is reported for every file in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Success {
        passes: usize,
        bytes_written: u64,
    },
    PartialFailure {
        passes_completed: usize,
        reason: Failure,
    },
    Skipped {
        reason: SkipReason,
    },
    BackupFailed {
        reason: Failure,
    },
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FileOutcome::PartialFailure { reason, .. } | FileOutcome::BackupFailed { reason } => {
                Some(reason.kind)
            }
            _ => None,
        }
    }
}

/// Emitted after each pass has been synced.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub job_id: Uuid,
    pub path: PathBuf,
    pub pass: PassSpec,
    pub total_passes: usize,
    pub bytes_written: u64,
}

pub trait PassObserver: Send + Sync {
    fn on_pass_complete(&self, report: &PassReport);
}

impl<F> PassObserver for F
where
    F: Fn(&PassReport) + Send + Sync,
{
    fn on_pass_complete(&self, report: &PassReport) {
        self(report)
    }
}

pub struct DeletionJob {
    id: Uuid,
    target: PathBuf,
    method: DeletionMethod,
    passes: Vec<PassSpec>,
    options: EngineOptions,
    extent: Option<u64>,
    state: JobState,
    history: Vec<JobState>,
    bytes_per_pass: Vec<u64>,
    backup: Option<BackupRecord>,
    storage: Option<StorageAssessment>,
}

impl DeletionJob {
    pub fn new(
        target: impl Into<PathBuf>,
        method: DeletionMethod,
        passes: Vec<PassSpec>,
        options: EngineOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            method,
            passes,
            options,
            extent: None,
            state: JobState::Pending,
            history: vec![JobState::Pending],
            bytes_per_pass: Vec::new(),
            backup: None,
            storage: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Every state the job has entered, in order.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// File size captured before the first pass.
    pub fn extent(&self) -> Option<u64> {
        self.extent
    }

    pub fn bytes_per_pass(&self) -> &[u64] {
        &self.bytes_per_pass
    }

    pub fn passes_completed(&self) -> usize {
        self.bytes_per_pass.len()
    }

    pub fn backup(&self) -> Option<&BackupRecord> {
        self.backup.as_ref()
    }

    pub fn storage(&self) -> Option<&StorageAssessment> {
        self.storage.as_ref()
    }

    pub async fn run(
        &mut self,
        backup: Option<&BackupInterceptor>,
        observer: Option<&dyn PassObserver>,
    ) -> FileOutcome {
        let span = info_span!(
            "deletion_job",
            job_id = %self.id,
            path = %self.target.display(),
            method = %self.method
        );
        self.execute(backup, observer).instrument(span).await
    }

    async fn execute(
        &mut self,
        backup: Option<&BackupInterceptor>,
        observer: Option<&dyn PassObserver>,
    ) -> FileOutcome {
        info!(passes = self.passes.len(), "job started");
        match self.drive(backup, observer).await {
            Ok(()) => info!(bytes = self.bytes_per_pass.iter().sum::<u64>(), "file destroyed"),
            Err(err) => {
                warn!(
                    error = %err,
                    passes_completed = self.passes_completed(),
                    "job failed"
                );
                self.fail(err.to_failure());
            }
        }
        self.outcome()
    }

    async fn drive(
        &mut self,
        backup: Option<&BackupInterceptor>,
        observer: Option<&dyn PassObserver>,
    ) -> Result<(), WipeError> {
        check_plan(&self.passes)?;
        let extent = self.capture_extent().await?;

        let assessment = storage::assess(&self.target);
        if assessment.is_warning() {
            warn!(
                guarantee = ?assessment.guarantee,
                reason = assessment.reason.as_deref().unwrap_or("unknown"),
                "in-place overwrite is not guaranteed on this storage"
            );
        }
        self.storage = Some(assessment);

        if let Some(interceptor) = backup {
            self.advance(JobState::Backup)?;
            self.backup = Some(interceptor.protect(&self.target).await?);
        }

        let overwrite = OverwriteExecutor::new(self.options.chunk_size, self.options.verify_mode);
        let crypto = CryptoWipeExecutor::new(self.options.chunk_size, self.options.verify_mode);
        let total = self.passes.len();
        let mut final_samples: Vec<ChunkDigest> = Vec::new();
        let mut receipt: Option<CryptoWipeReceipt> = None;

        for spec in self.passes.clone() {
            self.advance(JobState::Overwriting { pass: spec.index })?;
            let is_final = spec.index == total;

            let written = match spec.kind {
                PassKind::Pattern(pattern) => {
                    let outcome = overwrite.run(&self.target, extent, pattern, is_final).await?;
                    if is_final {
                        final_samples = outcome.samples;
                    }
                    outcome.bytes_written
                }
                PassKind::CryptoWipe => {
                    let done = crypto.run(&self.target, extent).await?;
                    receipt = Some(done);
                    done.bytes_encrypted
                }
            };
            self.bytes_per_pass.push(written);
            debug!(pass = spec.index, total, bytes = written, "pass complete");

            if let Some(observer) = observer {
                observer.on_pass_complete(&PassReport {
                    job_id: self.id,
                    path: self.target.clone(),
                    pass: spec,
                    total_passes: total,
                    bytes_written: written,
                });
            }
        }

        self.advance(JobState::Verifying)?;
        match self.passes.last().map(|spec| spec.kind) {
            Some(PassKind::CryptoWipe) => {
                let expected =
                    sample_offsets(extent, self.options.chunk_size, self.options.verify_mode).len() as u64;
                let authenticated = receipt.map_or(0, |r| r.chunks_authenticated);
                if authenticated != expected {
                    return Err(WipeError::VerificationFailed { offset: 0 });
                }
            }
            _ => overwrite.verify(&self.target, extent, &final_samples).await?,
        }

        self.advance(JobState::Unlinking)?;
        self.unlink().await?;
        self.advance(JobState::Done)?;
        Ok(())
    }

    /// Re-validate the target and capture the extent every pass is bounded by.
    async fn capture_extent(&mut self) -> Result<u64, WipeError> {
        let metadata = tokio::fs::symlink_metadata(&self.target)
            .await
            .map_err(|e| WipeError::io("stat", &self.target, e))?;
        if !metadata.file_type().is_file() {
            return Err(WipeError::NotRegularFile(self.target.clone()));
        }
        no_follow()
            .write(true)
            .open(&self.target)
            .await
            .map_err(|e| WipeError::io("open for writing", &self.target, e))?;

        self.extent = Some(metadata.len());
        Ok(metadata.len())
    }

    async fn unlink(&self) -> Result<(), WipeError> {
        let target = &self.target;
        let file = no_follow()
            .write(true)
            .open(target)
            .await
            .map_err(|e| WipeError::io("open for truncation", target, e))?;
        file.set_len(0)
            .await
            .map_err(|e| WipeError::io("truncate", target, e))?;
        file.sync_all()
            .await
            .map_err(|e| WipeError::io("sync", target, e))?;
        drop(file);

        let doomed = if self.options.obscure_names {
            obscure_name(target).await?
        } else {
            target.clone()
        };
        tokio::fs::remove_file(&doomed)
            .await
            .map_err(|e| WipeError::io("unlink", &doomed, e))?;
        sync_parent(target).await;

        for path in [target, &doomed] {
            match tokio::fs::symlink_metadata(path).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(WipeError::io("confirm removal", path, e)),
                Ok(_) => {
                    return Err(WipeError::io(
                        "confirm removal",
                        path,
                        io::Error::new(io::ErrorKind::AlreadyExists, "path still resolves after unlink"),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Move to `next`, refusing anything the state machine does not permit.
    fn advance(&mut self, next: JobState) -> Result<(), WipeError> {
        if !self.state.permits(&next) {
            return Err(WipeError::IllegalTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", next),
            });
        }
        self.history.push(next.clone());
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, reason: Failure) {
        if self.state.is_terminal() {
            return;
        }
        let failed = JobState::Failed(reason);
        self.history.push(failed.clone());
        self.state = failed;
    }

    pub fn outcome(&self) -> FileOutcome {
        match &self.state {
            JobState::Done => FileOutcome::Success {
                passes: self.passes_completed(),
                bytes_written: self.bytes_per_pass.iter().sum(),
            },
            JobState::Failed(reason) if reason.kind == FailureKind::BackupFailed => {
                FileOutcome::BackupFailed {
                    reason: reason.clone(),
                }
            }
            JobState::Failed(reason) => FileOutcome::PartialFailure {
                passes_completed: self.passes_completed(),
                reason: reason.clone(),
            },
            _ => FileOutcome::PartialFailure {
                passes_completed: self.passes_completed(),
                reason: Failure::new(FailureKind::Aborted, "job did not reach a terminal state"),
            },
        }
    }
}

/// A plan must be non-empty and numbered 1..=n in order.
fn check_plan(passes: &[PassSpec]) -> Result<(), WipeError> {
    if passes.is_empty() {
        return Err(WipeError::InvalidPlan("no passes".to_string()));
    }
    for (position, spec) in passes.iter().enumerate() {
        if spec.index != position + 1 {
            return Err(WipeError::InvalidPlan(format!(
                "pass at position {} is numbered {}",
                position + 1,
                spec.index
            )));
        }
    }
    Ok(())
}

/// Rename the (already truncated) file to a random name in the same directory
/// so the original name does not survive in directory metadata.
async fn obscure_name(path: &Path) -> Result<PathBuf, WipeError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let len = path
        .file_name()
        .map(|name| name.len())
        .unwrap_or(12)
        .clamp(8, 64);

    for _ in 0..8 {
        let name: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        let candidate = parent.join(name);
        if tokio::fs::symlink_metadata(&candidate).await.is_ok() {
            continue;
        }
        tokio::fs::rename(path, &candidate)
            .await
            .map_err(|e| WipeError::io("rename", path, e))?;
        return Ok(candidate);
    }
    // Could not find a free name; unlink under the original one
    Ok(path.to_path_buf())
}

#[cfg(unix)]
async fn sync_parent(path: &Path) {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let result = match tokio::fs::File::open(parent).await {
        Ok(dir) => dir.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(error = %e, "directory sync skipped");
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) {}
