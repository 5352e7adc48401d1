// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity based on inode (Unix) or file index (Windows).
//!
//! Registry entries are keyed by this identity rather than by path, so a file
//! keeps its state through renames, and a new file that reuses a rotated path
//! gets a fresh entry.

use serde::{Deserialize, Serialize};
use std::fs::{File, Metadata};
use std::io;
use std::path::Path;

/// A platform-independent unique identifier for a file.
///
/// On Unix systems, this is the device ID + inode number.
/// On Windows, this is the volume serial number + file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    /// Device ID (Unix) or volume serial number (Windows)
    dev: u64,
    /// Inode number (Unix) or file index (Windows)
    ino: u64,
}

impl FileId {
    /// Create a FileId from raw device and inode values.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Create a FileId from metadata that was already fetched for a path.
    #[cfg(unix)]
    pub fn from_metadata(_path: &Path, metadata: &Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    /// Create a FileId from metadata that was already fetched for a path.
    ///
    /// Windows metadata does not expose the file index, so the file is opened.
    #[cfg(windows)]
    pub fn from_metadata(path: &Path, _metadata: &Metadata) -> io::Result<Self> {
        Self::from_path(path)
    }

    /// Create a FileId from an open file handle.
    #[cfg(unix)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = file.metadata()?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    /// Create a FileId from an open file handle.
    #[cfg(windows)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(Self {
            dev: info.dwVolumeSerialNumber as u64,
            ino: file_index,
        })
    }

    /// Create a FileId from a path by opening the file.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Get the device ID (Unix) or volume serial number (Windows).
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Get the inode number (Unix) or file index (Windows).
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_id_from_metadata_matches_open_handle() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"test content").unwrap();
        file.flush().unwrap();

        let metadata = std::fs::metadata(file.path()).unwrap();
        let from_meta = FileId::from_metadata(file.path(), &metadata).unwrap();
        let from_handle = FileId::from_file(&file.reopen().unwrap()).unwrap();

        assert_eq!(from_meta, from_handle);
        assert!(from_meta.dev() > 0 || from_meta.ino() > 0);
    }

    #[test]
    fn test_file_id_different_files() {
        let file1 = NamedTempFile::new().unwrap();
        let file2 = NamedTempFile::new().unwrap();

        let id1 = FileId::from_path(file1.path()).unwrap();
        let id2 = FileId::from_path(file2.path()).unwrap();

        assert_ne!(id1, id2);
    }

    #[test]
    fn test_file_id_stable_across_rename() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        std::fs::write(&original, "line\n").unwrap();

        let before = FileId::from_path(&original).unwrap();
        std::fs::rename(&original, &rotated).unwrap();
        let after = FileId::from_path(&rotated).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_reused_path_gets_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\n").unwrap();
        let first = FileId::from_path(&path).unwrap();

        // Keep the rotated file alive so the inode cannot be recycled.
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "second\n").unwrap();
        let second = FileId::from_path(&path).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn test_file_id_display() {
        let id = FileId { dev: 123, ino: 456 };
        assert_eq!(format!("{}", id), "123:456");
    }
}
