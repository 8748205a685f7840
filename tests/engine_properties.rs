use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use shredspace::{
    BackupStore, BatchCoordinator, BatchRequest, CancellationToken, DeletionConfig, DeletionJob,
    DeletionMethod, DirectoryBackup, EngineOptions, EphemeralKey, FailureKind, FileOutcome,
    JobState, PassObserver, PassReport, SkipReason, VerifyMode,
};

fn options(workers: usize) -> EngineOptions {
    EngineOptions {
        chunk_size: 4096,
        worker_limit: workers,
        verify_mode: VerifyMode::Sampled,
        obscure_names: true,
    }
}

fn seed(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8 + 1).collect();
    std::fs::write(&path, content).unwrap();
    path
}

/// Captures the file's bytes as each pass completes.
#[derive(Default)]
struct Snapshots(Mutex<Vec<Vec<u8>>>);

impl PassObserver for Snapshots {
    fn on_pass_complete(&self, report: &PassReport) {
        let bytes = std::fs::read(&report.path).unwrap();
        self.0.lock().unwrap().push(bytes);
    }
}

fn job(path: &Path, method: DeletionMethod, passes: u32) -> DeletionJob {
    let plan = DeletionConfig::new(method, passes).validate().unwrap();
    DeletionJob::new(path, method, plan, options(1))
}

#[tokio::test]
async fn every_method_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    for method in DeletionMethod::ALL {
        let path = seed(dir.path(), &format!("{method}.dat"), 10_000);
        let mut job = job(&path, method, 2);
        let outcome = job.run(None, None).await;

        assert!(outcome.is_success(), "{method}: {outcome:?}");
        assert_eq!(job.state(), &JobState::Done);
        assert!(std::fs::symlink_metadata(&path).is_err());
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn zero_fill_passes_are_all_zero() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "ledger.db", 9_000);
    let snapshots = Snapshots::default();

    let mut job = job(&path, DeletionMethod::ZeroFill, 4);
    assert!(job.run(None, Some(&snapshots)).await.is_success());

    let snapshots = snapshots.0.into_inner().unwrap();
    assert_eq!(snapshots.len(), 4);
    for pass in snapshots {
        assert_eq!(pass.len(), 9_000);
        assert!(pass.iter().all(|&b| b == 0x00));
    }
}

#[tokio::test]
async fn dod_passes_are_zero_then_ones_then_random() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "payroll.xlsx", 12_345);
    let snapshots = Snapshots::default();

    // The supplied pass count has no effect on the fixed three-pass plan
    let mut job = job(&path, DeletionMethod::Dod522022M, 7);
    assert!(job.run(None, Some(&snapshots)).await.is_success());

    let passes = snapshots.0.into_inner().unwrap();
    assert_eq!(passes.len(), 3);
    assert!(passes[0].iter().all(|&b| b == 0x00));
    assert!(passes[1].iter().all(|&b| b == 0xFF));
    assert_eq!(passes[2].len(), 12_345);
    assert_ne!(passes[2], vec![0x00; 12_345]);
    assert_ne!(passes[2], vec![0xFF; 12_345]);
}

#[tokio::test]
async fn aes_wipe_replaces_plaintext_with_ciphertext() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "keys.pem", 20_000);
    let original = std::fs::read(&path).unwrap();
    let snapshots = Snapshots::default();

    let mut job = job(&path, DeletionMethod::AesWipe, 1);
    assert!(job.run(None, Some(&snapshots)).await.is_success());

    let passes = snapshots.0.into_inner().unwrap();
    assert_eq!(passes.len(), 1);
    assert_eq!(passes[0].len(), original.len());
    assert_ne!(passes[0], original);
    assert_ne!(passes[0], vec![0u8; original.len()]);
}

#[test]
fn destroyed_key_holds_no_material() {
    let mut key = EphemeralKey::generate().unwrap();
    assert!(!key.is_destroyed());
    key.destroy();
    assert!(key.is_destroyed());
    assert_eq!(format!("{key:?}"), "EphemeralKey { destroyed: true, .. }");
}

#[tokio::test]
async fn verification_failure_keeps_the_file() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "evidence.log", 8_192);

    // Tamper with the written region after the final pass, before verification
    let corrupt = |report: &PassReport| {
        let mut bytes = std::fs::read(&report.path).unwrap();
        bytes[0] = 0x7A;
        std::fs::write(&report.path, bytes).unwrap();
    };

    let mut job = job(&path, DeletionMethod::ZeroFill, 1);
    let outcome = job.run(None, Some(&corrupt)).await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::VerificationFailed));
    assert!(matches!(job.state(), JobState::Failed(f) if f.kind == FailureKind::VerificationFailed));
    assert!(!job.history().contains(&JobState::Unlinking));
    assert!(path.exists());
}

/// Holds the first copy until released so a second batch can collide with it.
struct GatedBackup {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl BackupStore for GatedBackup {
    async fn copy(&self, source: &Path, destination_dir: &Path) -> io::Result<PathBuf> {
        self.entered.notify_one();
        self.release.notified().await;
        DirectoryBackup.copy(source, destination_dir).await
    }
}

#[tokio::test]
async fn same_path_in_two_batches_runs_once() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "shared.bin", 5_000);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let coordinator = BatchCoordinator::new(options(2))
        .unwrap()
        .with_backup_store(Arc::new(GatedBackup {
            entered: entered.clone(),
            release: release.clone(),
        }));
    let config =
        DeletionConfig::new(DeletionMethod::RandomFill, 1).with_backup(dir.path().join("backups"));

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let request = BatchRequest::new(vec![path.clone()], config.clone());
        async move { coordinator.execute(request).await }
    });
    entered.notified().await;

    let second = coordinator
        .execute(BatchRequest::new(vec![path.clone()], config))
        .await
        .unwrap();
    release.notify_one();
    let first = first.await.unwrap().unwrap();

    let outcomes = [first.get(&path).unwrap(), second.get(&path).unwrap()];
    let skipped = outcomes
        .iter()
        .filter(|o| {
            matches!(
                o,
                FileOutcome::Skipped {
                    reason: SkipReason::AlreadyInProgress
                }
            )
        })
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
    assert!(!path.exists());
}

#[tokio::test]
async fn cancellation_after_second_file_skips_the_rest() {
    let dir = TempDir::new().unwrap();
    let targets: Vec<PathBuf> = (1..=5)
        .map(|i| seed(dir.path(), &format!("batch-{i}.dat"), 3_000))
        .collect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let request = BatchRequest::new(targets.clone(), DeletionConfig::new(DeletionMethod::ZeroFill, 1))
        .with_cancellation(cancel);

    let result = BatchCoordinator::new(options(1))
        .unwrap()
        .execute_with_progress(request, move |event| {
            if event.completed == 2 {
                trigger.cancel();
            }
        })
        .await
        .unwrap();

    assert_eq!(result.len(), 5);
    for target in &targets[..2] {
        assert!(result.get(target).unwrap().is_success());
        assert!(!target.exists());
    }
    for target in &targets[2..] {
        assert_eq!(
            result.get(target),
            Some(&FileOutcome::Skipped {
                reason: SkipReason::Cancelled
            })
        );
        assert!(target.exists());
    }
}

#[tokio::test]
async fn failed_backup_leaves_the_original_intact() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "thesis.docx", 30_000);
    let before = std::fs::read(&path).unwrap();
    let unusable = dir.path().join("backup-target");
    std::fs::write(&unusable, b"a file, not a directory").unwrap();

    let request = BatchRequest::new(
        vec![path.clone()],
        DeletionConfig::new(DeletionMethod::Dod522022M, 3).with_backup(&unusable),
    );
    let result = BatchCoordinator::new(options(1))
        .unwrap()
        .execute(request)
        .await
        .unwrap();

    assert!(matches!(
        result.get(&path),
        Some(FileOutcome::BackupFailed { reason }) if reason.kind == FailureKind::BackupFailed
    ));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn backup_copy_survives_the_deletion() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "photo.raw", 6_000);
    let before = std::fs::read(&path).unwrap();
    let backups = dir.path().join("backups");

    let request = BatchRequest::new(
        vec![path.clone()],
        DeletionConfig::new(DeletionMethod::AesWipe, 1).with_backup(&backups),
    );
    let result = BatchCoordinator::new(options(1))
        .unwrap()
        .execute(request)
        .await
        .unwrap();

    assert!(result.all_succeeded());
    let copies: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
    assert_eq!(copies.len(), 1);
    let copy = copies[0].as_ref().unwrap().path();
    assert_eq!(std::fs::read(copy).unwrap(), before);
}

#[tokio::test]
async fn duplicate_targets_are_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let path = seed(dir.path(), "twice.txt", 100);

    let request = BatchRequest::new(
        vec![path.clone(), path.clone()],
        DeletionConfig::new(DeletionMethod::ZeroFill, 1),
    );
    let err = BatchCoordinator::new(options(1))
        .unwrap()
        .execute(request)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("twice.txt"));
    assert!(path.exists());
}

#[tokio::test]
async fn one_failure_does_not_stop_the_batch() {
    let dir = TempDir::new().unwrap();
    let good = seed(dir.path(), "good.txt", 2_000);
    let missing = dir.path().join("missing.txt");
    let also_good = seed(dir.path(), "also-good.txt", 2_000);

    let request = BatchRequest::new(
        vec![good.clone(), missing.clone(), also_good.clone()],
        DeletionConfig::new(DeletionMethod::RandomFill, 2),
    );
    let result = BatchCoordinator::new(options(2))
        .unwrap()
        .execute(request)
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    assert!(result.get(&good).unwrap().is_success());
    assert!(result.get(&also_good).unwrap().is_success());
    assert_eq!(result.get(&missing).unwrap().failure_kind(), Some(FailureKind::Io));
}
