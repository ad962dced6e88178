//! Capacity guard for the journal directory.

use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{JournalError, Result};

/// Source of free-space figures for a directory.
pub trait DiskSpace: Send + Sync + Debug {
    /// Bytes available to an unprivileged writer in `dir`.
    fn available(&self, dir: &Path) -> io::Result<u64>;
}

/// Queries the filesystem through `fs2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2DiskSpace;

impl DiskSpace for Fs2DiskSpace {
    fn available(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Reports a fixed figure regardless of the directory.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub u64);

impl DiskSpace for FixedDiskSpace {
    fn available(&self, _dir: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Refuses writes that would leave less than the configured headroom.
#[derive(Debug, Clone)]
pub struct SpaceGuard {
    dir: PathBuf,
    min_space_left: u64,
    min_space_required_after_write: u64,
    probe: Arc<dyn DiskSpace>,
}

impl SpaceGuard {
    pub fn new(
        dir: impl Into<PathBuf>,
        min_space_left: u64,
        min_space_required_after_write: u64,
        probe: Arc<dyn DiskSpace>,
    ) -> Self {
        Self {
            dir: dir.into(),
            min_space_left,
            min_space_required_after_write,
            probe,
        }
    }

    /// Whether free space strictly exceeds `min_space_left`.
    ///
    /// A failing probe counts as "not enough" and is logged.
    pub fn has_enough_space(&self) -> bool {
        match self.probe.available(&self.dir) {
            Ok(available) => available > self.min_space_left,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "could not determine free space");
                false
            }
        }
    }

    /// Checks that `size` more bytes fit and still leave the required headroom.
    pub fn check_write(&self, size: u64) -> Result<()> {
        let available = self.probe.available(&self.dir)?;
        let required = size
            .saturating_add(self.min_space_required_after_write)
            .max(self.min_space_left.saturating_add(1));
        if available < required {
            tracing::warn!(
                dir = %self.dir.display(),
                available,
                required,
                "refusing write, not enough space"
            );
            return Err(JournalError::InsufficientSpace {
                dir: self.dir.clone(),
                available,
                required,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn guard(available: u64) -> SpaceGuard {
        SpaceGuard::new("/data", 100, 50, Arc::new(FixedDiskSpace(available)))
    }

    #[test_case(101, true ; "just above minimum")]
    #[test_case(100, false ; "at minimum")]
    #[test_case(0, false ; "full disk")]
    fn has_enough_space_is_strict(available: u64, expected: bool) {
        assert_eq!(guard(available).has_enough_space(), expected);
    }

    #[test_case(1_000, 900, true ; "leaves exact headroom")]
    #[test_case(1_000, 951, false ; "eats into headroom")]
    #[test_case(120, 0, true ; "empty write above minimum")]
    #[test_case(100, 0, false ; "empty write at minimum")]
    fn check_write_accounts_for_headroom(available: u64, size: u64, ok: bool) {
        let result = guard(available).check_write(size);
        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[test]
    fn real_filesystem_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        let guard = SpaceGuard::new(dir.path(), 0, 0, Arc::new(Fs2DiskSpace));
        assert!(guard.check_write(1).is_ok());
    }
}
