//! In-place pattern overwrite and read-back verification.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};

use crate::error::{ConfigurationError, WipeError};
use crate::pattern::{self, PatternKind};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// How much of the final pass is read back before a file may be unlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// First, middle and last chunk.
    #[default]
    Sampled,
    /// Every chunk.
    Full,
}

impl FromStr for VerifyMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sampled" | "sample" => Ok(VerifyMode::Sampled),
            "full" => Ok(VerifyMode::Full),
            _ => Err(ConfigurationError::UnknownVerifyMode(s.to_string())),
        }
    }
}

/// `(offset, length)` of every chunk covering `[0, extent)`.
pub(crate) fn chunks(extent: u64, chunk_size: usize) -> impl Iterator<Item = (u64, usize)> {
    let step = chunk_size.max(1) as u64;
    (0..extent)
        .step_by(step as usize)
        .map(move |offset| (offset, (extent - offset).min(step) as usize))
}

/// Start offsets of the chunks that verification reads back.
pub fn sample_offsets(extent: u64, chunk_size: usize, mode: VerifyMode) -> BTreeSet<u64> {
    if extent == 0 {
        return BTreeSet::new();
    }
    let step = chunk_size.max(1) as u64;
    let count = (extent + step - 1) / step;
    match mode {
        VerifyMode::Full => (0..count).map(|i| i * step).collect(),
        VerifyMode::Sampled => [0, count / 2, count - 1].into_iter().map(|i| i * step).collect(),
    }
}

/// Open options that refuse a symlink in the final path component, so a
/// target swapped for a link mid-job cannot redirect writes elsewhere.
pub(crate) fn no_follow() -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits());
    options
}

/// Open an existing file for an in-place pass and confirm it still spans the
/// captured extent. Never creates, truncates or replaces the file.
pub(crate) async fn open_for_pass(path: &Path, extent: u64, read: bool) -> Result<File, WipeError> {
    let file = no_follow()
        .read(read)
        .write(true)
        .open(path)
        .await
        .map_err(|e| WipeError::io("open for overwrite", path, e))?;
    ensure_extent(&file, path, extent).await?;
    Ok(file)
}

pub(crate) async fn ensure_extent(file: &File, path: &Path, extent: u64) -> Result<(), WipeError> {
    let actual = file
        .metadata()
        .await
        .map_err(|e| WipeError::io("stat", path, e))?
        .len();
    if actual != extent {
        return Err(WipeError::SizeChanged {
            expected: extent,
            actual,
        });
    }
    Ok(())
}

/// Digest of one chunk as it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDigest {
    pub offset: u64,
    pub len: usize,
    pub digest: [u8; 32],
}

#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub bytes_written: u64,
    /// Digests of the verification chunks; empty unless requested.
    pub samples: Vec<ChunkDigest>,
}

#[derive(Debug, Clone)]
pub struct OverwriteExecutor {
    chunk_size: usize,
    verify_mode: VerifyMode,
}

impl OverwriteExecutor {
    pub fn new(chunk_size: usize, verify_mode: VerifyMode) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            verify_mode,
        }
    }

    /// Stream `pattern` over `[0, extent)` and sync it to stable storage.
    ///
    /// The pass only counts once `sync_all` has returned. When
    /// `record_samples` is set, digests of the chunks selected by the
    /// verification mode are kept for [`OverwriteExecutor::verify`].
    pub async fn run(
        &self,
        path: &Path,
        extent: u64,
        pattern: PatternKind,
        record_samples: bool,
    ) -> Result<PassOutcome, WipeError> {
        let mut file = open_for_pass(path, extent, false).await?;
        let sampled = if record_samples {
            sample_offsets(extent, self.chunk_size, self.verify_mode)
        } else {
            BTreeSet::new()
        };

        let mut outcome = PassOutcome::default();
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| WipeError::io("seek", path, e))?;

        for (offset, len) in chunks(extent, self.chunk_size) {
            let buffer = pattern::generate(pattern, offset, len)
                .map_err(|e| WipeError::io("generate pattern", path, e))?;
            file.write_all(&buffer)
                .await
                .map_err(|e| WipeError::io("write", path, e))?;

            if sampled.contains(&offset) {
                outcome.samples.push(ChunkDigest {
                    offset,
                    len,
                    digest: Sha256::digest(&buffer).into(),
                });
            }
            outcome.bytes_written += len as u64;
        }

        file.flush()
            .await
            .map_err(|e| WipeError::io("flush", path, e))?;
        file.sync_all()
            .await
            .map_err(|e| WipeError::io("sync", path, e))?;

        debug!(
            path = %path.display(),
            %pattern,
            bytes = outcome.bytes_written,
            "overwrite pass synced"
        );
        Ok(outcome)
    }

    /// Re-open the file read-only and compare each recorded chunk with what is on disk.
    pub async fn verify(
        &self,
        path: &Path,
        extent: u64,
        samples: &[ChunkDigest],
    ) -> Result<(), WipeError> {
        let mut file = no_follow()
            .read(true)
            .open(path)
            .await
            .map_err(|e| WipeError::io("open for verification", path, e))?;
        ensure_extent(&file, path, extent).await?;

        for sample in samples {
            let mut buffer = vec![0u8; sample.len];
            file.seek(SeekFrom::Start(sample.offset))
                .await
                .map_err(|e| WipeError::io("seek", path, e))?;
            file.read_exact(&mut buffer)
                .await
                .map_err(|e| WipeError::io("read back", path, e))?;

            let digest: [u8; 32] = Sha256::digest(&buffer).into();
            if digest != sample.digest {
                error!(
                    path = %path.display(),
                    offset = sample.offset,
                    "read-back does not match the final pass"
                );
                return Err(WipeError::VerificationFailed {
                    offset: sample.offset,
                });
            }
        }
        Ok(())
    }
}
