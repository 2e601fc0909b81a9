//! Store-backed implementation of the VFS traits.
//!
//! One [`StrataVfs`] serves any number of stores, keyed by root path. The
//! main database file of a connection establishes (or attaches to) the store
//! and fixes its geometry; companion files - rollback journal, WAL - strip
//! their suffix to find the same store and become independently versioned
//! files inside it. Temporary files never touch a store at all.
//!
//! Byte-offset I/O is translated to page operations: `offset / page_size`
//! addresses the logical page, `offset % page_size` the range within it. A
//! read that reaches a page no version ever wrote zero-fills the tail and
//! reports a short count, which the host engine treats as reading past EOF.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use strata_error::{Result, StrataError};
use strata_store::{
    ReadHandle, Store, StoreOptions, VacuumPolicy, VacuumScope, VacuumStats, WriteHandle,
};
use strata_types::{LockLevel, LogicalPageId, SyncLevel, VersionId};

use crate::params::{AutoVacuumMode, OpenParams};
use crate::traits::{FileKind, Vfs, VfsFile};

const COMPANION_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

struct RegisteredStore {
    store: Store,
    auto_vacuum: AutoVacuumMode,
}

#[derive(Default)]
struct Registry {
    stores: HashMap<PathBuf, RegisteredStore>,
}

/// VFS adaptor over the versioned page store.
#[derive(Clone, Default)]
pub struct StrataVfs {
    registry: Arc<Mutex<Registry>>,
}

impl StrataVfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The live `Store` for a root this VFS has opened, if any.
    #[must_use]
    pub fn store(&self, root: &Path) -> Option<Store> {
        self.registry
            .lock()
            .stores
            .get(root)
            .map(|r| r.store.clone())
    }

    /// Active version of the store at `root`.
    pub fn active_version(&self, root: &Path) -> Result<VersionId> {
        let store = self.store(root).ok_or_else(|| StrataError::StoreNotFound {
            path: root.to_owned(),
        })?;
        Ok(store.active_version())
    }

    /// Run a reclamation pass on the store at `root`, with the policy the
    /// connection's `auto_vacuum` knob selected.
    pub fn vacuum(&self, root: &Path) -> Result<VacuumStats> {
        let (store, auto_vacuum) = {
            let registry = self.registry.lock();
            let r = registry
                .stores
                .get(root)
                .ok_or_else(|| StrataError::StoreNotFound {
                    path: root.to_owned(),
                })?;
            (r.store.clone(), r.auto_vacuum)
        };
        let policy = match auto_vacuum {
            AutoVacuumMode::Full => VacuumPolicy::Full,
            AutoVacuumMode::None | AutoVacuumMode::Incremental => VacuumPolicy::Incremental,
        };
        store.vacuum(VacuumScope::Active, policy)
    }

    /// Map a companion file path back to its store root: `X-journal` and
    /// `X-wal` belong to the store rooted at `X`.
    fn store_root(path: &Path, kind: FileKind) -> PathBuf {
        if kind.is_main() {
            return path.to_owned();
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        for suffix in COMPANION_SUFFIXES {
            if let Some(main) = name.strip_suffix(suffix) {
                return path.with_file_name(main);
            }
        }
        path.to_owned()
    }

    fn file_name(path: &Path) -> Result<String> {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| StrataError::InvalidParameter {
                name: "path",
                detail: format!("'{}' has no file name", path.display()),
            })
    }

    /// Fetch the store for `root`, opening it read-write from disk when this
    /// VFS has not seen it yet.
    fn attach_rw(&self, root: &Path, auto_vacuum: Option<AutoVacuumMode>) -> Result<Store> {
        let mut registry = self.registry.lock();
        if let Some(r) = registry.stores.get_mut(root) {
            if let Some(mode) = auto_vacuum {
                r.auto_vacuum = mode;
            }
            return Ok(r.store.clone());
        }
        let store = Store::open(root)?;
        registry.stores.insert(
            root.to_owned(),
            RegisteredStore {
                store: store.clone(),
                auto_vacuum: auto_vacuum.unwrap_or_default(),
            },
        );
        Ok(store)
    }

    fn open_main(&self, path: &Path, params: &OpenParams) -> Result<StrataFile> {
        let name = Self::file_name(path)?;
        let page_size = params.page_size;

        if params.mode.is_read_only() {
            // Reuse the live store when this process already has one, so the
            // pin table is shared; otherwise a private read-only attachment.
            let store = match self.store(path) {
                Some(store) => store,
                None => Store::open_readonly(path)?,
            };
            if store.page_size() != page_size {
                return Err(StrataError::PageSizeMismatch {
                    expected: store.page_size().get(),
                    actual: page_size.get(),
                });
            }
            let version = params.pinned_version();
            let handle = store.read_handle(&name, version)?;
            debug!(path = %path.display(), version = version.get(), "main database pinned read-only");
            return Ok(StrataFile::reader(name, page_size.as_usize(), handle));
        }

        let options = StoreOptions {
            page_size,
            segment_capacity: params.segment_capacity,
        };
        let store = {
            let mut registry = self.registry.lock();
            match registry.stores.get_mut(path) {
                Some(r) => {
                    r.auto_vacuum = params.auto_vacuum;
                    r.store.clone()
                }
                None => {
                    let store = Store::open_or_create(path, options)?;
                    registry.stores.insert(
                        path.to_owned(),
                        RegisteredStore {
                            store: store.clone(),
                            auto_vacuum: params.auto_vacuum,
                        },
                    );
                    store
                }
            }
        };
        if store.page_size() != page_size {
            return Err(StrataError::PageSizeMismatch {
                expected: store.page_size().get(),
                actual: page_size.get(),
            });
        }
        if store.segment_capacity() != params.segment_capacity {
            return Err(StrataError::SegmentCapacityMismatch {
                expected: store.segment_capacity().get(),
                actual: params.segment_capacity.get(),
            });
        }

        // An explicit version on a read-write open must be the active one.
        if let Some(requested) = params.version {
            let active = store.active_version();
            if requested < active {
                return Err(StrataError::VersionSealed {
                    version: requested.get(),
                });
            }
            if requested > active {
                return Err(StrataError::VersionUnknown {
                    version: requested.get(),
                });
            }
        }

        let handle = store.write_handle(&name)?;
        debug!(path = %path.display(), "main database opened read-write");
        Ok(StrataFile::writer(name, page_size.as_usize(), handle))
    }

    fn open_companion(&self, path: &Path, kind: FileKind) -> Result<StrataFile> {
        let root = Self::store_root(path, kind);
        let name = Self::file_name(path)?;
        let store = self.attach_rw(&root, None)?;
        let handle = store.write_handle(&name)?;
        Ok(StrataFile::writer(
            name,
            store.page_size().as_usize(),
            handle,
        ))
    }
}

impl Vfs for StrataVfs {
    type File = StrataFile;

    fn name(&self) -> &'static str {
        "strata"
    }

    fn open(&self, path: &Path, kind: FileKind, params: Option<&OpenParams>) -> Result<Self::File> {
        match kind {
            FileKind::Temp => Ok(StrataFile::temp()),
            FileKind::MainDb => {
                let params = params.ok_or(StrataError::InvalidParameter {
                    name: "params",
                    detail: "main database open requires connection parameters".to_owned(),
                })?;
                self.open_main(path, params)
            }
            FileKind::Journal | FileKind::Wal => self.open_companion(path, kind),
        }
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let root = Self::store_root(path, FileKind::Journal);
        let name = Self::file_name(path)?;
        let store = match self.store(&root) {
            Some(store) => store,
            None => return Ok(()),
        };
        match store.delete_file(&name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn access(&self, path: &Path) -> Result<bool> {
        let root = Self::store_root(path, FileKind::Journal);
        let name = Self::file_name(path)?;
        Ok(self
            .store(&root)
            .is_some_and(|store| store.file_exists(&name)))
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(path.to_owned())
        } else {
            Ok(std::env::current_dir()?.join(path))
        }
    }
}

// ---------------------------------------------------------------------------
// StrataFile
// ---------------------------------------------------------------------------

enum Backing {
    Writer(WriteHandle),
    Reader(ReadHandle),
    Temp(Vec<u8>),
}

/// A file handle served by [`StrataVfs`].
pub struct StrataFile {
    name: String,
    page_size: usize,
    backing: Backing,
    lock_level: LockLevel,
}

impl std::fmt::Debug for StrataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backing {
            Backing::Writer(_) => "writer",
            Backing::Reader(_) => "reader",
            Backing::Temp(_) => "temp",
        };
        f.debug_struct("StrataFile")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("lock_level", &self.lock_level)
            .finish()
    }
}

impl StrataFile {
    fn writer(name: String, page_size: usize, handle: WriteHandle) -> Self {
        Self {
            name,
            page_size,
            backing: Backing::Writer(handle),
            lock_level: LockLevel::None,
        }
    }

    fn reader(name: String, page_size: usize, handle: ReadHandle) -> Self {
        Self {
            name,
            page_size,
            backing: Backing::Reader(handle),
            lock_level: LockLevel::None,
        }
    }

    fn temp() -> Self {
        Self {
            name: String::new(),
            page_size: 0,
            backing: Backing::Temp(Vec::new()),
            lock_level: LockLevel::None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version this handle resolves against right now.
    #[must_use]
    pub fn version(&self) -> Option<VersionId> {
        match &self.backing {
            Backing::Writer(h) => Some(h.version()),
            Backing::Reader(h) => Some(h.version()),
            Backing::Temp(_) => None,
        }
    }

    /// Split a byte range into per-page chunks and feed them to `op`.
    fn for_each_chunk<T, F>(
        page_size: usize,
        offset: u64,
        total_len: usize,
        mut op: F,
    ) -> Result<Option<T>>
    where
        F: FnMut(LogicalPageId, usize, usize, usize) -> Result<Option<T>>,
    {
        let mut done = 0usize;
        while done < total_len {
            let abs = offset + done as u64;
            let page = u32::try_from(abs / page_size as u64).map_err(|_| {
                StrataError::InvalidParameter {
                    name: "offset",
                    detail: format!("offset {abs} exceeds addressable pages"),
                }
            })?;
            let in_page = (abs % page_size as u64) as usize;
            let chunk = (total_len - done).min(page_size - in_page);
            if let Some(out) = op(LogicalPageId::new(page), in_page, done, chunk)? {
                return Ok(Some(out));
            }
            done += chunk;
        }
        Ok(None)
    }
}

impl VfsFile for StrataFile {
    fn close(&mut self) -> Result<()> {
        self.lock_level = LockLevel::None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match &self.backing {
            Backing::Temp(data) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let n = (data.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&data[start..start + n]);
                buf[n..].fill(0);
                Ok(n)
            }
            Backing::Writer(_) | Backing::Reader(_) => {
                let page_size = self.page_size;
                let backing = &self.backing;
                let total = buf.len();
                let short = Self::for_each_chunk(
                    page_size,
                    offset,
                    total,
                    |page, in_page, done, chunk| {
                        let dst = &mut buf[done..done + chunk];
                        let result = match backing {
                            Backing::Writer(h) => h.read(page, in_page, dst),
                            Backing::Reader(h) => h.read(page, in_page, dst),
                            Backing::Temp(_) => unreachable!(),
                        };
                        match result {
                            Ok(_) => Ok(None),
                            // Reading a page no version ever wrote is the
                            // host's "past EOF": zero-fill and report short.
                            Err(e) if e.is_not_found() => Ok(Some(done)),
                            Err(e) => Err(e),
                        }
                    },
                )?;
                match short {
                    Some(done) => {
                        buf[done..].fill(0);
                        Ok(done)
                    }
                    None => Ok(total),
                }
            }
        }
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        match &mut self.backing {
            Backing::Temp(data) => {
                let start = usize::try_from(offset).map_err(|_| StrataError::InvalidParameter {
                    name: "offset",
                    detail: "temp file offset exceeds memory".to_owned(),
                })?;
                if data.len() < start + buf.len() {
                    data.resize(start + buf.len(), 0);
                }
                data[start..start + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            Backing::Reader(_) => Err(StrataError::ReadOnly),
            Backing::Writer(handle) => {
                Self::for_each_chunk(
                    self.page_size,
                    offset,
                    buf.len(),
                    |page, in_page, done, chunk| {
                        handle.write(page, in_page, &buf[done..done + chunk])?;
                        Ok(None::<()>)
                    },
                )?;
                Ok(())
            }
        }
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        match &mut self.backing {
            Backing::Temp(data) => {
                data.truncate(usize::try_from(size).unwrap_or(usize::MAX));
                Ok(())
            }
            Backing::Reader(_) => Err(StrataError::ReadOnly),
            Backing::Writer(handle) => {
                let first_dropped =
                    u32::try_from(size / self.page_size as u64).map_err(|_| {
                        StrataError::InvalidParameter {
                            name: "size",
                            detail: format!("truncate size {size} exceeds addressable pages"),
                        }
                    })?;
                handle.truncate(LogicalPageId::new(first_dropped))
            }
        }
    }

    fn sync(&mut self, _level: SyncLevel) -> Result<()> {
        match &self.backing {
            Backing::Writer(handle) => handle.flush(),
            Backing::Reader(_) | Backing::Temp(_) => Ok(()),
        }
    }

    fn file_size(&self) -> Result<u64> {
        match &self.backing {
            Backing::Temp(data) => Ok(data.len() as u64),
            Backing::Writer(handle) => {
                Ok(u64::from(handle.logical_pages()?) * self.page_size as u64)
            }
            Backing::Reader(handle) => {
                Ok(u64::from(handle.logical_pages()?) * self.page_size as u64)
            }
        }
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if matches!(self.backing, Backing::Reader(_)) && level > LockLevel::Shared {
            return Err(StrataError::ReadOnly);
        }
        self.lock_level = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level < self.lock_level {
            self.lock_level = level;
        }
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        Ok(self.lock_level >= LockLevel::Reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str) -> OpenParams {
        OpenParams::from_query(query).unwrap()
    }

    fn open_main(vfs: &StrataVfs, root: &Path, query: &str) -> StrataFile {
        vfs.open(root, FileKind::MainDb, Some(&params(query))).unwrap()
    }

    #[test]
    fn byte_io_spans_page_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("test.db");
        let vfs = StrataVfs::new();
        let mut file = open_main(&vfs, &root, "pagesz=512&pps=8");

        // 1300 bytes starting at offset 100 touch pages 0, 1, and 2.
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        file.write(&payload, 100).unwrap();
        file.sync(SyncLevel::Normal).unwrap();

        let mut out = vec![0u8; 1300];
        let n = file.read(&mut out, 100).unwrap();
        assert_eq!(n, 1300);
        assert_eq!(out, payload);
        assert_eq!(file.file_size().unwrap(), 3 * 512);
    }

    #[test]
    fn reads_past_the_end_zero_fill_short() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("test.db");
        let vfs = StrataVfs::new();
        let mut file = open_main(&vfs, &root, "pagesz=512&pps=8");

        file.write(&[7u8; 512], 0).unwrap();

        let mut out = vec![0xffu8; 1024];
        let n = file.read(&mut out, 0).unwrap();
        assert_eq!(n, 512);
        assert_eq!(&out[..512], &[7u8; 512]);
        assert_eq!(&out[512..], &[0u8; 512]);
    }

    #[test]
    fn journal_files_share_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("test.db");
        let vfs = StrataVfs::new();
        let _main = open_main(&vfs, &root, "pagesz=512&pps=8");

        let journal_path = dir.path().join("test.db-journal");
        let mut journal = vfs.open(&journal_path, FileKind::Journal, None).unwrap();
        journal.write(&[1u8; 100], 0).unwrap();

        assert!(vfs.access(&journal_path).unwrap());
        vfs.delete(&journal_path).unwrap();
        assert!(!vfs.access(&journal_path).unwrap());
        // Idempotent: deleting again is fine.
        vfs.delete(&journal_path).unwrap();
    }

    #[test]
    fn sealed_versions_open_read_only_and_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("test.db");
        let vfs = StrataVfs::new();
        let mut main = open_main(&vfs, &root, "pagesz=512&pps=8");
        main.write(&[3u8; 512], 0).unwrap();

        let store = vfs.store(&root).unwrap();
        store.commit().unwrap();

        // Read-write open against the sealed version fails.
        let err = vfs
            .open(&root, FileKind::MainDb, Some(&params("pagesz=512&pps=8&ver=1")))
            .unwrap_err();
        assert!(matches!(err, StrataError::VersionSealed { version: 1 }));

        // Pinned read-only open works and rejects writes.
        let mut pinned = open_main(&vfs, &root, "pagesz=512&pps=8&ver=1&mode=ro");
        let mut buf = vec![0u8; 512];
        assert_eq!(pinned.read(&mut buf, 0).unwrap(), 512);
        assert_eq!(buf, vec![3u8; 512]);
        assert!(matches!(pinned.write(&[1], 0), Err(StrataError::ReadOnly)));
        assert!(matches!(pinned.truncate(0), Err(StrataError::ReadOnly)));
        assert!(matches!(
            pinned.lock(LockLevel::Reserved),
            Err(StrataError::ReadOnly)
        ));
    }

    #[test]
    fn page_size_must_match_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("test.db");
        let vfs = StrataVfs::new();
        drop(open_main(&vfs, &root, "pagesz=512&pps=8"));

        let other_vfs = StrataVfs::new();
        let err = other_vfs
            .open(&root, FileKind::MainDb, Some(&params("pagesz=1024&pps=8")))
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::PageSizeMismatch {
                expected: 512,
                actual: 1024
            }
        ));
    }

    #[test]
    fn temp_files_are_private_scratch() {
        let vfs = StrataVfs::new();
        let mut tmp = vfs.open(Path::new(""), FileKind::Temp, None).unwrap();
        tmp.write(&[9u8; 10], 5).unwrap();
        assert_eq!(tmp.file_size().unwrap(), 15);

        let mut out = vec![0u8; 20];
        let n = tmp.read(&mut out, 0).unwrap();
        assert_eq!(n, 15);
        assert_eq!(&out[5..15], &[9u8; 10]);
        tmp.truncate(5).unwrap();
        assert_eq!(tmp.file_size().unwrap(), 5);
    }

    #[test]
    fn geometry_capacity_is_validated_against_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("test.db");
        let vfs = StrataVfs::new();
        drop(open_main(&vfs, &root, "pagesz=512&pps=8"));

        let fresh = StrataVfs::new();
        let err = fresh
            .open(&root, FileKind::MainDb, Some(&params("pagesz=512&pps=16")))
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::SegmentCapacityMismatch {
                expected: 8,
                actual: 16
            }
        ));
    }
}
