//! Error taxonomy for the deletion engine.
//!
//! Configuration errors abort a batch before any file is touched. Every other
//! error is file-scoped: it is folded into a [`Failure`] and recorded in that
//! file's outcome without affecting sibling jobs.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid batch or engine configuration. Rejected before any job starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("pass count must be between 1 and {max}, got {value}")]
    InvalidPassCount { value: u32, max: u32 },

    #[error("backup is enabled but no backup directory was configured")]
    MissingBackupDirectory,

    #[error("duplicate target path in batch: {}", .0.display())]
    DuplicatePath(PathBuf),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("worker limit must be at least 1")]
    InvalidWorkerLimit,

    #[error("unknown deletion method `{0}`")]
    UnknownMethod(String),

    #[error("unknown verification mode `{0}`")]
    UnknownVerifyMode(String),

    #[error("failed to load configuration")]
    Load(#[from] config::ConfigError),
}

/// File-scoped failure raised while wiping a single target.
#[derive(Debug, Error)]
pub enum WipeError {
    #[error("{operation} failed for {}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file size changed from {expected} to {actual} bytes during the job")]
    SizeChanged { expected: u64, actual: u64 },

    #[error("read-back verification failed at offset {offset}")]
    VerificationFailed { offset: u64 },

    #[error("backup failed: {reason}")]
    Backup { reason: String },

    #[error("{} is not a regular file", .0.display())]
    NotRegularFile(PathBuf),

    #[error("pass plan rejected: {0}")]
    InvalidPlan(String),

    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

impl WipeError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Io { .. } => FailureKind::Io,
            Self::SizeChanged { .. } => FailureKind::SizeChanged,
            Self::VerificationFailed { .. } => FailureKind::VerificationFailed,
            Self::Backup { .. } => FailureKind::BackupFailed,
            Self::NotRegularFile(_) => FailureKind::NotRegularFile,
            Self::InvalidPlan(_) | Self::IllegalTransition { .. } => FailureKind::Aborted,
        }
    }

    /// Flatten into the serialisable record carried by job states and outcomes.
    pub fn to_failure(&self) -> Failure {
        let detail = match self {
            Self::Io { source, .. } => format!("{self}: {source}"),
            other => other.to_string(),
        };
        Failure {
            kind: self.kind(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Io,
    SizeChanged,
    /// Ranked above plain I/O failures: the erasure claim could not be confirmed.
    VerificationFailed,
    BackupFailed,
    NotRegularFile,
    /// The job stopped on an internal inconsistency (bad plan, illegal
    /// transition) or its task ended without producing an outcome.
    Aborted,
}

/// Reason attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl From<&WipeError> for Failure {
    fn from(err: &WipeError) -> Self {
        err.to_failure()
    }
}
