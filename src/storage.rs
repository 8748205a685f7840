//! Capability query: can an in-place overwrite be trusted to hit the original blocks?
//!
//! Copy-on-write and log-structured filesystems, and flash media behind a
//! translation layer, may write new data to fresh blocks and leave the old
//! contents intact. The engine still runs on such storage but reports the
//! limitation instead of claiming unconditional erasure.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteGuarantee {
    InPlace,
    NotGuaranteed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAssessment {
    pub guarantee: OverwriteGuarantee,
    pub filesystem: Option<String>,
    pub reason: Option<String>,
}

impl StorageAssessment {
    fn new(guarantee: OverwriteGuarantee, filesystem: Option<&str>, reason: Option<&str>) -> Self {
        Self {
            guarantee,
            filesystem: filesystem.map(str::to_string),
            reason: reason.map(str::to_string),
        }
    }

    /// True when the result must carry a warning alongside the outcome.
    pub fn is_warning(&self) -> bool {
        self.guarantee != OverwriteGuarantee::InPlace
    }
}

pub fn assess(path: &Path) -> StorageAssessment {
    platform::assess(path)
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{OverwriteGuarantee, StorageAssessment};
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;

    use nix::sys::stat::{major, minor};
    use nix::sys::statfs::statfs;

    const BTRFS: u32 = 0x9123_683E;
    const ZFS: u32 = 0x2FC1_2FC1;
    const BCACHEFS: u32 = 0xCA45_1A4E;
    const F2FS: u32 = 0xF2F5_2010;
    const NILFS: u32 = 0x3434;
    const OVERLAYFS: u32 = 0x794C_7630;
    const TMPFS: u32 = 0x0102_1994;
    const NFS: u32 = 0x6969;
    const CIFS: u32 = 0xFF53_4D42;
    const SMB2: u32 = 0xFE53_4D42;
    const FUSE: u32 = 0x6573_5546;
    const EXT4: u32 = 0xEF53;
    const XFS: u32 = 0x5846_5342;

    pub(super) fn assess(path: &Path) -> StorageAssessment {
        use OverwriteGuarantee::*;

        let stat = match statfs(path) {
            Ok(stat) => stat,
            Err(_) => {
                return StorageAssessment::new(Unknown, None, Some("filesystem type could not be read"))
            }
        };

        let by_filesystem = match stat.filesystem_type().0 as u32 {
            BTRFS => StorageAssessment::new(NotGuaranteed, Some("btrfs"), Some("copy-on-write filesystem")),
            ZFS => StorageAssessment::new(NotGuaranteed, Some("zfs"), Some("copy-on-write filesystem")),
            BCACHEFS => StorageAssessment::new(NotGuaranteed, Some("bcachefs"), Some("copy-on-write filesystem")),
            F2FS => StorageAssessment::new(NotGuaranteed, Some("f2fs"), Some("log-structured filesystem")),
            NILFS => StorageAssessment::new(NotGuaranteed, Some("nilfs2"), Some("log-structured filesystem")),
            OVERLAYFS => StorageAssessment::new(
                NotGuaranteed,
                Some("overlayfs"),
                Some("lower layers keep their own copy of the file"),
            ),
            TMPFS => StorageAssessment::new(
                NotGuaranteed,
                Some("tmpfs"),
                Some("memory-backed; pages may already have been swapped out"),
            ),
            NFS | CIFS | SMB2 => StorageAssessment::new(
                Unknown,
                Some("network"),
                Some("server-side storage layout is not visible"),
            ),
            FUSE => StorageAssessment::new(Unknown, Some("fuse"), Some("userspace filesystem")),
            EXT4 => StorageAssessment::new(InPlace, Some("ext2/3/4"), None),
            XFS => StorageAssessment::new(InPlace, Some("xfs"), None),
            _ => StorageAssessment::new(Unknown, None, Some("unrecognised filesystem")),
        };

        if by_filesystem.guarantee == InPlace && is_solid_state(path) == Some(true) {
            return StorageAssessment {
                guarantee: NotGuaranteed,
                reason: Some("solid-state media; wear levelling may keep the old blocks".to_string()),
                ..by_filesystem
            };
        }
        by_filesystem
    }

    fn is_solid_state(path: &Path) -> Option<bool> {
        let dev = std::fs::metadata(path).ok()?.dev();
        let base = format!("/sys/dev/block/{}:{}", major(dev), minor(dev));
        // Partitions keep their queue attributes on the parent device
        let rotational = std::fs::read_to_string(format!("{base}/queue/rotational"))
            .or_else(|_| std::fs::read_to_string(format!("{base}/../queue/rotational")))
            .ok()?;
        Some(rotational.trim() == "0")
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::{OverwriteGuarantee, StorageAssessment};
    use std::path::Path;

    pub(super) fn assess(_path: &Path) -> StorageAssessment {
        StorageAssessment::new(
            OverwriteGuarantee::Unknown,
            None,
            Some("in-place overwrite cannot be confirmed on this platform"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn assessment_always_yields_a_verdict() {
        let dir = TempDir::new().unwrap();
        let assessment = assess(dir.path());
        if assessment.guarantee != OverwriteGuarantee::InPlace {
            assert!(assessment.reason.is_some());
        }
    }

    #[test]
    fn missing_path_is_unknown() {
        let dir = TempDir::new().unwrap();
        let assessment = assess(&dir.path().join("nope/nope"));
        assert_eq!(assessment.guarantee, OverwriteGuarantee::Unknown);
        assert!(assessment.is_warning());
    }
}
