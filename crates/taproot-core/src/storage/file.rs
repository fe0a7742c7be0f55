use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::OpenFlags;

/// Low-level positioned I/O over a single file.
///
/// Reads and writes go through `pread`/`pwrite` (`FileExt::read_exact_at` /
/// `write_all_at`), so the handle carries no seek position. Reads past EOF
/// fail; writes past EOF extend the file.
#[derive(Debug)]
pub struct BinaryFile {
    file: File,
    path: PathBuf,
}

impl BinaryFile {
    /// Open `path` according to `flags`: read-only opens an existing file,
    /// read-write creates it when missing, truncate discards existing
    /// contents.
    pub fn open(path: &Path, flags: OpenFlags) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if flags.writable() {
            opts.write(true).create(true);
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            opts.truncate(true);
        }
        let file = opts.open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Extend (or shrink) the file to exactly `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Stream the whole file once in `chunk`-sized reads to warm the OS
    /// page cache. The data itself is discarded.
    pub fn preload(&self, chunk: usize) -> Result<()> {
        let len = self.len()?;
        let mut buf = vec![0u8; chunk];
        let mut offset = 0u64;
        while offset < len {
            let n = ((len - offset) as usize).min(chunk);
            self.file.read_exact_at(&mut buf[..n], offset)?;
            offset += n as u64;
        }
        Ok(())
    }

    pub(crate) fn handle(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");

        let f = BinaryFile::open(&path, OpenFlags::READ_WRITE).unwrap();
        f.write_at(0, b"hello").unwrap();
        f.write_at(100, b"world").unwrap();

        let mut buf = [0u8; 5];
        f.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        f.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // Write past EOF extended the file.
        assert_eq!(f.len().unwrap(), 105);
    }

    #[test]
    fn test_read_past_eof_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");

        let f = BinaryFile::open(&path, OpenFlags::READ_WRITE).unwrap();
        f.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert!(f.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_read_only_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        assert!(BinaryFile::open(&path, OpenFlags::READ_ONLY).is_err());
    }

    #[test]
    fn test_truncate_discards() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");

        {
            let f = BinaryFile::open(&path, OpenFlags::READ_WRITE).unwrap();
            f.write_at(0, &[0xAA; 64]).unwrap();
        }
        let f = BinaryFile::open(&path, OpenFlags::TRUNCATE).unwrap();
        assert_eq!(f.len().unwrap(), 0);
    }

    #[test]
    fn test_set_len_and_preload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");

        let f = BinaryFile::open(&path, OpenFlags::READ_WRITE).unwrap();
        f.set_len(1024).unwrap();
        assert_eq!(f.len().unwrap(), 1024);
        f.preload(128).unwrap();
    }
}
