//! Single-use transfer handles for files moved between processes.
//!
//! A [`RemoteFile`] names a transient file staged by one component (a node's
//! batch output, a large archive record) for another component to consume.
//! The content can be read exactly once: the first full read removes the
//! transient file and marks the handle released, and any later read fails
//! with [`BatchError::IllegalState`] instead of returning stale or empty data.
//! A handle dropped without being read removes its file as well.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::{BatchError, Result};

/// A transient file readable exactly once.
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoteFile {
    name: String,
    path: PathBuf,
    size: u64,
    #[serde(skip)]
    released: AtomicBool,
}

impl RemoteFile {
    /// Copies `reader` into a new transient file under `staging_dir`.
    pub fn stage(staging_dir: &Path, name: impl Into<String>, reader: &mut dyn Read) -> Result<Self> {
        let name = name.into();
        fs::create_dir_all(staging_dir)?;
        let mut staged = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize_prefix(&name)))
            .suffix(".staged")
            .tempfile_in(staging_dir)?;
        let size = io::copy(reader, staged.as_file_mut())?;
        staged.as_file_mut().sync_all()?;
        let path = staged.into_temp_path().keep().map_err(|e| BatchError::Io(e.error))?;
        Ok(Self {
            name,
            path,
            size,
            released: AtomicBool::new(false),
        })
    }

    /// Takes ownership of an already-written transient file.
    pub fn adopt(name: impl Into<String>, path: PathBuf) -> Result<Self> {
        let size = fs::metadata(&path)?.len();
        Ok(Self {
            name: name.into(),
            path,
            size,
            released: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Streams the whole content into `out`, then releases the handle.
    ///
    /// Returns the number of bytes copied.
    pub fn append_to(&self, out: &mut dyn Write) -> Result<u64> {
        self.claim()?;
        let result = File::open(&self.path).and_then(|mut f| io::copy(&mut f, out));
        self.remove_backing_file();
        Ok(result?)
    }

    /// Reads the whole content into memory, then releases the handle.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.append_to(&mut buf)?;
        Ok(buf)
    }

    /// Releases the handle without reading it. Idempotent.
    pub fn cleanup(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.remove_backing_file();
        }
    }

    fn claim(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(BatchError::IllegalState(format!(
                "remote file '{}' has already been read and released",
                self.name
            )));
        }
        Ok(())
    }

    fn remove_backing_file(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(name = %self.name, path = %self.path.display(), error = %e, "could not remove transient file");
            }
        }
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn sanitize_prefix(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .take(48)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_read_succeeds_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteFile::stage(dir.path(), "out", &mut &b"payload"[..]).unwrap();
        assert_eq!(remote.size(), 7);
        assert!(!remote.is_released());

        assert_eq!(remote.read_all().unwrap(), b"payload");
        assert!(remote.is_released());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn second_read_is_illegal_state() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteFile::stage(dir.path(), "out", &mut &b"payload"[..]).unwrap();
        remote.read_all().unwrap();

        let err = remote.read_all().unwrap_err();
        assert!(matches!(err, BatchError::IllegalState(_)));
        let mut sink = Vec::new();
        assert!(matches!(
            remote.append_to(&mut sink),
            Err(BatchError::IllegalState(_))
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn dropping_unread_handle_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _remote = RemoteFile::stage(dir.path(), "out", &mut &b"x"[..]).unwrap();
            assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cleanup_then_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteFile::stage(dir.path(), "out", &mut &b"x"[..]).unwrap();
        remote.cleanup();
        remote.cleanup();
        assert!(remote.read_all().is_err());
    }

    #[test]
    fn adopt_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result");
        fs::write(&path, b"12345").unwrap();
        let remote = RemoteFile::adopt("result", path.clone()).unwrap();
        assert_eq!(remote.size(), 5);
        drop(remote);
        assert!(!path.exists());
    }
}
