//! Batch coordination: schedules one deletion job per target, enforces
//! per-path exclusivity, honours cancellation between files and assembles
//! the aggregate result.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backup::{BackupInterceptor, BackupStore, DirectoryBackup};
use crate::config::{DeletionConfig, EngineOptions};
use crate::error::{ConfigurationError, Failure, FailureKind};
use crate::job::{DeletionJob, FileOutcome, PassObserver, SkipReason};
use crate::method::DeletionMethod;
use crate::storage::StorageAssessment;

/// Cloneable flag polled between files. A job that has started always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub targets: Vec<PathBuf>,
    pub config: DeletionConfig,
    pub cancel: CancellationToken,
}

impl BatchRequest {
    pub fn new(targets: Vec<PathBuf>, config: DeletionConfig) -> Self {
        Self {
            targets,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub path: PathBuf,
    pub outcome: FileOutcome,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub method: DeletionMethod,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Exactly one outcome per requested path.
    pub outcomes: BTreeMap<PathBuf, FileOutcome>,
    /// Files whose storage cannot guarantee an in-place overwrite.
    pub warnings: BTreeMap<PathBuf, StorageAssessment>,
}

impl BatchResult {
    pub fn get(&self, path: &Path) -> Option<&FileOutcome> {
        self.outcomes.get(path)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded() == self.outcomes.len()
    }

    pub fn count_where(&self, predicate: impl Fn(&FileOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| predicate(o)).count()
    }
}

/// Paths currently owned by an active job, keyed by canonical absolute path.
#[derive(Debug, Default)]
pub struct PathRegistry {
    active: Mutex<HashSet<PathBuf>>,
}

impl PathRegistry {
    pub fn try_acquire(self: &Arc<Self>, key: PathBuf) -> Option<PathLease> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return None;
        }
        Some(PathLease {
            registry: Arc::clone(self),
            key,
        })
    }

    pub fn is_locked(&self, key: &Path) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases the path when dropped.
#[derive(Debug)]
pub struct PathLease {
    registry: Arc<PathRegistry>,
    key: PathBuf,
}

impl Drop for PathLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Key under which a target is serialised: the canonical path when the file
/// exists, otherwise its absolute form.
pub fn serialization_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Clone)]
pub struct BatchCoordinator {
    options: EngineOptions,
    registry: Arc<PathRegistry>,
    backup_store: Arc<dyn BackupStore>,
    observer: Option<Arc<dyn PassObserver>>,
}

impl BatchCoordinator {
    pub fn new(options: EngineOptions) -> Result<Self, ConfigurationError> {
        options.validate()?;
        Ok(Self {
            options,
            registry: Arc::new(PathRegistry::default()),
            backup_store: Arc::new(DirectoryBackup),
            observer: None,
        })
    }

    pub fn with_backup_store(mut self, store: Arc<dyn BackupStore>) -> Self {
        self.backup_store = store;
        self
    }

    pub fn with_pass_observer(mut self, observer: Arc<dyn PassObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<PathRegistry> {
        &self.registry
    }

    pub async fn execute(&self, request: BatchRequest) -> Result<BatchResult, ConfigurationError> {
        self.execute_with_progress(request, |_: &ProgressEvent| {}).await
    }

    /// Run every target of `request`. Configuration problems abort the whole
    /// batch before any file is touched; everything else is captured per file.
    pub async fn execute_with_progress<F>(
        &self,
        request: BatchRequest,
        progress: F,
    ) -> Result<BatchResult, ConfigurationError>
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let passes = request.config.validate()?;
        reject_duplicates(&request.targets)?;

        let batch_id = Uuid::new_v4();
        let span = info_span!(
            "batch",
            %batch_id,
            method = %request.config.method,
            files = request.targets.len()
        );

        async move {
            let started_at = Utc::now();
            let total = request.targets.len();
            let method = request.config.method;
            let progress: ProgressCallback = Arc::new(progress);
            let completed = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(self.options.worker_limit));
            let backup = match (&request.config.backup_directory, request.config.backup_enabled) {
                (Some(dir), true) => Some(BackupInterceptor::new(self.backup_store.clone(), dir)),
                _ => None,
            };

            info!(backup = backup.is_some(), "batch started");

            let report = |path: &Path, outcome: &FileOutcome| {
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                progress(&ProgressEvent {
                    path: path.to_path_buf(),
                    outcome: outcome.clone(),
                    completed: done,
                    total,
                });
            };

            let mut outcomes = BTreeMap::new();
            let mut warnings = BTreeMap::new();
            let mut running = Vec::new();

            for target in &request.targets {
                // A permit frees up only after the previous job's progress event
                // has been delivered, so a cancel raised there is seen here.
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let outcome = FileOutcome::PartialFailure {
                            passes_completed: 0,
                            reason: Failure::new(FailureKind::Aborted, e.to_string()),
                        };
                        report(target, &outcome);
                        outcomes.insert(target.clone(), outcome);
                        continue;
                    }
                };

                if request.cancel.is_cancelled() {
                    let outcome = FileOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    };
                    report(target, &outcome);
                    outcomes.insert(target.clone(), outcome);
                    continue;
                }

                let Some(lease) = self.registry.try_acquire(serialization_key(target)) else {
                    warn!(path = %target.display(), "another job already owns this file");
                    let outcome = FileOutcome::Skipped {
                        reason: SkipReason::AlreadyInProgress,
                    };
                    report(target, &outcome);
                    outcomes.insert(target.clone(), outcome);
                    continue;
                };

                let mut job = DeletionJob::new(target.clone(), method, passes.clone(), self.options);
                let backup = backup.clone();
                let observer = self.observer.clone();
                let progress = progress.clone();
                let completed = completed.clone();
                let path = target.clone();

                let delivered: Arc<Mutex<Option<FileOutcome>>> = Arc::default();
                let slot = delivered.clone();

                let handle = tokio::spawn(
                    async move {
                        let outcome = job.run(backup.as_ref(), observer.as_deref()).await;
                        drop(lease);
                        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        progress(&ProgressEvent {
                            path,
                            outcome: outcome.clone(),
                            completed: done,
                            total,
                        });
                        drop(permit);
                        (outcome, job.storage().cloned())
                    }
                    .in_current_span(),
                );
                running.push((target.clone(), handle, delivered));
            }

            for (path, handle, delivered) in running {
                match handle.await {
                    Ok((outcome, storage)) => {
                        if let Some(assessment) = storage.filter(StorageAssessment::is_warning) {
                            warnings.insert(path.clone(), assessment);
                        }
                        outcomes.insert(path, outcome);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "job task ended abnormally");
                        // Once the outcome reached the progress callback it has
                        // been counted; keep it and do not report twice.
                        let finished = delivered.lock().unwrap_or_else(PoisonError::into_inner).take();
                        let outcome = match finished {
                            Some(outcome) => outcome,
                            None => {
                                let outcome = FileOutcome::PartialFailure {
                                    passes_completed: 0,
                                    reason: Failure::new(FailureKind::Aborted, e.to_string()),
                                };
                                report(&path, &outcome);
                                outcome
                            }
                        };
                        outcomes.insert(path, outcome);
                    }
                }
            }

            let result = BatchResult {
                batch_id,
                method,
                started_at,
                finished_at: Utc::now(),
                outcomes,
                warnings,
            };
            info!(
                succeeded = result.succeeded(),
                total = result.len(),
                "batch finished"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }
}

fn reject_duplicates(targets: &[PathBuf]) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::with_capacity(targets.len());
    for target in targets {
        if !seen.insert(serialization_key(target)) {
            return Err(ConfigurationError::DuplicatePath(target.clone()));
        }
    }
    Ok(())
}
