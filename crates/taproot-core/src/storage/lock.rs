use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::{Error, Result};

/// Advisory lock guarding a tree file (`flock(2)` on Unix).
///
/// Writers take an exclusive lock, readers a shared one, through a second
/// descriptor on the same path. One writer at a time per file; the lock is
/// released when this struct drops.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Take an exclusive (writer) lock without blocking.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open_handle(path)?;
        file.try_lock_exclusive().map_err(|_| Error::FileLocked)?;
        Ok(Self { _file: file })
    }

    /// Take a shared (reader) lock without blocking.
    pub fn shared(path: &Path) -> Result<Self> {
        let file = Self::open_handle(path)?;
        file.try_lock_shared().map_err(|_| Error::FileLocked)?;
        Ok(Self { _file: file })
    }

    fn open_handle(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_exclusive_excludes_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        let lock = FileLock::exclusive(&path).unwrap();
        match FileLock::exclusive(&path) {
            Err(Error::FileLocked) => {}
            other => panic!("expected FileLocked, got {other:?}"),
        }
        drop(lock);
        FileLock::exclusive(&path).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        let _a = FileLock::shared(&path).unwrap();
        let _b = FileLock::shared(&path).unwrap();
    }

    #[test]
    fn test_shared_excludes_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        let _reader = FileLock::shared(&path).unwrap();
        assert!(matches!(
            FileLock::exclusive(&path),
            Err(Error::FileLocked)
        ));
    }
}
