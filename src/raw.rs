//! RAW file abstraction
//!
//! This module provides the [`RAW`] struct, a thin wrapper around [`std::fs::File`]
//! used for the positioned reads performed on extent and descriptor files.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

/// An open backing file of a virtual disk.
pub struct RAW {
    /// The underlying file handle.
    file: File,
    /// Path the file was opened from.
    path: PathBuf,
}

impl RAW {
    /// Opens the file at `file_path` and returns a new [`RAW`] wrapper.
    ///
    /// # Errors
    ///
    /// Returns any [`io::Error`] produced by [`File::open`], e.g. when the
    /// path does not exist or the process lacks sufficient permissions.
    pub fn new(file_path: &Path) -> Result<RAW, io::Error> {
        let file = File::open(file_path)?;
        Ok(RAW {
            file,
            path: file_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Fills `buf` with the bytes found at `offset`, stopping early only at end-of-file.
    ///
    /// Returns the number of bytes actually read, which is smaller than `buf.len()`
    /// when the file ends before the buffer is full. Bytes past that count are left untouched.
    ///
    /// # Errors
    ///
    /// Propagates any I/O error returned by [`Seek::seek`] or [`Read::read`].
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_at_stops_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"0123456789").unwrap();

        let mut raw = RAW::new(&path).unwrap();
        assert_eq!(raw.size().unwrap(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(raw.read_at(&mut buf, 3).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        let mut buf = [0xffu8; 6];
        assert_eq!(raw.read_at(&mut buf, 8).unwrap(), 2);
        assert_eq!(&buf, &[b'8', b'9', 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(raw.read_at(&mut buf, 20).unwrap(), 0);
    }

    #[test]
    fn test_new_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RAW::new(&dir.path().join("missing.vmdk")).is_err());
    }
}
