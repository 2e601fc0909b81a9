//! VFS trait surface the host engine programs against.
//!
//! Abstracts all storage operations so backends can differ: the versioned
//! store (the point of this crate), or anything else a host wants to plug in
//! for testing.

use std::path::{Path, PathBuf};

use strata_error::Result;
use strata_types::{LockLevel, SyncLevel};

use crate::params::OpenParams;

/// What role the opened file plays for the host engine.
///
/// The main database carries the connection parameters; companion files
/// (rollback journal, write-ahead log) attach to the store the main database
/// opened; temporary files are private scratch space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    MainDb,
    Journal,
    Wal,
    Temp,
}

impl FileKind {
    #[inline]
    #[must_use]
    pub fn is_main(self) -> bool {
        self == Self::MainDb
    }
}

/// A virtual filesystem implementation.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS (e.g. "strata").
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `params` carries the connection parameters and is required for
    /// [`FileKind::MainDb`]; companion files inherit the configuration of the
    /// store their main database established.
    fn open(&self, path: &Path, kind: FileKind, params: Option<&OpenParams>) -> Result<Self::File>;

    /// Delete a file. Idempotent: deleting a file that does not exist is not
    /// an error.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Check whether a file exists.
    fn access(&self, path: &Path) -> Result<bool>;

    /// Resolve a potentially relative path into an absolute path.
    fn full_pathname(&self, path: &Path) -> Result<PathBuf>;
}

/// A file handle opened by a VFS.
pub trait VfsFile: Send {
    /// Close the file. The handle must not be used afterwards.
    fn close(&mut self) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes actually read. A read past the logical end
    /// of the file is not an error: the remaining bytes in `buf` are zeroed
    /// and the short count returned, which is the host engine's convention
    /// for "page never written".
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` starting at byte `offset`.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Flush everything written so far to stable storage.
    fn sync(&mut self, level: SyncLevel) -> Result<()>;

    /// Current logical file size in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Acquire a lock at the given level.
    ///
    /// Writer serialization lives inside the store, so levels are tracked per
    /// handle for protocol fidelity rather than enforced across handles.
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// Release the lock down to the given level.
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// Whether some handle holds a reserved-or-higher lock.
    fn check_reserved_lock(&self) -> Result<bool>;

    /// Minimum write granularity of the underlying storage.
    fn sector_size(&self) -> u32 {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The host engine stores handles behind a vtable; keep that possible.
    #[test]
    fn vfs_file_is_object_safe() {
        fn _accepts_dyn(_f: &mut dyn VfsFile) {}
    }

    #[test]
    fn main_db_kind_is_distinguished() {
        assert!(FileKind::MainDb.is_main());
        assert!(!FileKind::Journal.is_main());
        assert!(!FileKind::Wal.is_main());
        assert!(!FileKind::Temp.is_main());
    }
}
