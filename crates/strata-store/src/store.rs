//! The `Store` façade and its capability-tagged handles.
//!
//! A [`Store`] is a directory holding the manifest, the lock file, and the
//! segment files. It serves one writer and many readers: [`WriteHandle`]s are
//! bound to whatever version is currently active, [`ReadHandle`]s are pinned
//! to one sealed version for their whole lifetime.
//!
//! The engine state sits behind one `RwLock`: page resolution and reads take
//! the shared side, every mutation takes the exclusive side, which is the
//! single-writer serialization the commit protocol relies on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use strata_error::{Result, StrataError};
use strata_types::{
    FileId, LogicalPageId, PageSize, SegmentCapacity, VersionId,
};

use crate::catalog::FileCatalog;
use crate::commit::{run_commit, CommitLock};
use crate::manifest::Manifest;
use crate::segment::SegmentStore;
use crate::vacuum::{run_vacuum, PinSet, VacuumPolicy, VacuumScope, VacuumStats};
use crate::version::{Mapping, VersionManager, VersionState};

/// Geometry options for creating a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub page_size: PageSize,
    pub segment_capacity: SegmentCapacity,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: PageSize::DEFAULT,
            segment_capacity: SegmentCapacity::DEFAULT,
        }
    }
}

/// Mutable engine state: everything behind the store's RwLock.
pub(crate) struct EngineState {
    pub(crate) segments: SegmentStore,
    pub(crate) versions: VersionManager,
    pub(crate) catalog: FileCatalog,
    /// Pages the active version shadowed or deleted, awaiting a vacuum pass.
    pub(crate) pending_free: Vec<strata_types::PhysicalPageId>,
}

pub(crate) struct StoreInner {
    root: PathBuf,
    page_size: PageSize,
    capacity: SegmentCapacity,
    read_only: bool,
    state: RwLock<EngineState>,
    pins: PinSet,
    /// Non-reentrancy guard for commit/vacuum.
    exclusive_op: AtomicBool,
}

/// A versioned, segment-based page store rooted at one directory.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create a new store at `root`. Fails if one already exists there.
    pub fn create(root: &Path, options: StoreOptions) -> Result<Self> {
        if root.join(crate::manifest::MANIFEST_FILE).exists() {
            return Err(StrataError::InvalidParameter {
                name: "root",
                detail: format!("store already exists at '{}'", root.display()),
            });
        }
        std::fs::create_dir_all(root)?;

        let segments = SegmentStore::create(root, options.page_size, options.segment_capacity)?;
        let state = EngineState {
            segments,
            versions: VersionManager::new(),
            catalog: FileCatalog::new(),
            pending_free: Vec::new(),
        };
        snapshot_current(&state).persist(root)?;

        info!(
            root = %root.display(),
            page_size = options.page_size.get(),
            segment_capacity = options.segment_capacity.get(),
            "store created"
        );
        Ok(Self::from_state(root, options, state, false))
    }

    /// Open an existing store read-write.
    pub fn open(root: &Path) -> Result<Self> {
        Self::open_inner(root, false)
    }

    /// Open an existing store read-only: every mutating operation fails with
    /// `ReadOnly`, and nothing on disk is touched.
    pub fn open_readonly(root: &Path) -> Result<Self> {
        Self::open_inner(root, true)
    }

    /// Open, or create when absent, validating geometry against an existing
    /// store.
    pub fn open_or_create(root: &Path, options: StoreOptions) -> Result<Self> {
        if !root.join(crate::manifest::MANIFEST_FILE).exists() {
            return Self::create(root, options);
        }
        let store = Self::open(root)?;
        if store.page_size() != options.page_size {
            return Err(StrataError::PageSizeMismatch {
                expected: store.page_size().get(),
                actual: options.page_size.get(),
            });
        }
        if store.segment_capacity() != options.segment_capacity {
            return Err(StrataError::SegmentCapacityMismatch {
                expected: store.segment_capacity().get(),
                actual: options.segment_capacity.get(),
            });
        }
        Ok(store)
    }

    fn open_inner(root: &Path, read_only: bool) -> Result<Self> {
        let manifest = Manifest::load(root)?;
        let options = StoreOptions {
            page_size: manifest.page_size,
            segment_capacity: manifest.capacity,
        };
        let segments = SegmentStore::open(
            root,
            manifest.page_size,
            manifest.capacity,
            &manifest.segments,
        )?;
        let versions = VersionManager::from_parts(
            manifest.min_version,
            manifest.active_version,
            manifest.versions,
        )?;
        let catalog = FileCatalog::from_parts(manifest.files, manifest.catalog_next_id);

        let mut state = EngineState {
            segments,
            versions,
            catalog,
            pending_free: Vec::new(),
        };

        if !read_only {
            // Slots the last incarnation allocated but never recorded in a
            // persisted delta (crash mid-version, or frees lost with the
            // process) go straight back to the allocator.
            sweep_orphans(&mut state);
        }

        debug!(root = %root.display(), read_only, "store opened");
        Ok(Self::from_state(root, options, state, read_only))
    }

    fn from_state(
        root: &Path,
        options: StoreOptions,
        state: EngineState,
        read_only: bool,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: root.to_owned(),
                page_size: options.page_size,
                capacity: options.segment_capacity,
                read_only,
                state: RwLock::new(state),
                pins: PinSet::new(),
                exclusive_op: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.inner.page_size
    }

    #[must_use]
    pub fn segment_capacity(&self) -> SegmentCapacity {
        self.inner.capacity
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    #[must_use]
    pub fn active_version(&self) -> VersionId {
        self.inner.state.read().versions.active()
    }

    /// Lowest retained version; read-only opens below this fail.
    #[must_use]
    pub fn min_version(&self) -> VersionId {
        self.inner.state.read().versions.min_version()
    }

    fn require_writable(&self) -> Result<()> {
        if self.inner.read_only {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }

    /// True if a file of this name is visible at the given version.
    #[must_use]
    pub fn file_exists_at(&self, name: &str, version: VersionId) -> bool {
        self.inner
            .state
            .read()
            .catalog
            .lookup_at(name, version)
            .is_some()
    }

    /// True if a file of this name is visible at the active version.
    #[must_use]
    pub fn file_exists(&self, name: &str) -> bool {
        let state = self.inner.state.read();
        let active = state.versions.active();
        state.catalog.lookup_at(name, active).is_some()
    }

    /// Open a read-write handle on a file under the active version, creating
    /// the file if it does not exist yet.
    pub fn write_handle(&self, name: &str) -> Result<WriteHandle> {
        self.require_writable()?;
        let mut state = self.inner.state.write();
        let active = state.versions.active();
        let file = match state.catalog.lookup_at(name, active) {
            Some(id) => id,
            None => state.catalog.create(name, active),
        };
        Ok(WriteHandle {
            inner: Arc::clone(&self.inner),
            file,
        })
    }

    /// Open a read-only handle pinned to `version`, which must be sealed.
    ///
    /// The pin defers reclamation of every page the handle can reach until
    /// the handle is dropped.
    pub fn read_handle(&self, name: &str, version: VersionId) -> Result<ReadHandle> {
        let state = self.inner.state.read();
        match state.versions.state(version) {
            None => return Err(StrataError::VersionUnknown {
                version: version.get(),
            }),
            Some(VersionState::Sealed) => {}
            Some(VersionState::Active | VersionState::Sealing) => {
                return Err(StrataError::VersionNotSealed {
                    version: version.get(),
                });
            }
        }
        let file = state
            .catalog
            .lookup_at(name, version)
            .ok_or_else(|| StrataError::FileNotFound {
                name: name.to_owned(),
            })?;
        self.inner.pins.pin(version);
        debug!(name, version = version.get(), "read handle pinned");
        Ok(ReadHandle {
            inner: Arc::clone(&self.inner),
            file,
            version,
        })
    }

    /// Delete a file under the active version. Sealed versions keep resolving
    /// it; the active version's own pages for it are reclaimed by the next
    /// vacuum pass.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        self.require_writable()?;
        let mut state = self.inner.state.write();
        let active = state.versions.active();
        let file = state
            .catalog
            .lookup_at(name, active)
            .ok_or_else(|| StrataError::FileNotFound {
                name: name.to_owned(),
            })?;
        let freed = state.versions.remove_active_table(file);
        state.pending_free.extend(freed);
        state.catalog.mark_deleted(file, active);
        Ok(())
    }

    /// Flush dirty pages and persist the manifest without sealing anything.
    pub fn flush(&self) -> Result<()> {
        self.require_writable()?;
        let mut state = self.inner.state.write();
        state.segments.flush()?;
        snapshot_current(&state).persist(&self.inner.root)
    }

    /// Seal the active version and open the next one. Returns the new active
    /// version id.
    ///
    /// Non-reentrant: a second commit (or vacuum) while one is in flight
    /// fails with `WriteConflict`; a commit racing another process fails with
    /// `StoreLocked`.
    pub fn commit(&self) -> Result<VersionId> {
        self.require_writable()?;
        self.exclusive(|| {
            let _lock = CommitLock::acquire(&self.inner.root)?;
            let mut state = self.inner.state.write();
            run_commit(&mut state, &self.inner.root)
        })
    }

    /// Run a reclamation pass. Takes the same exclusion as commit.
    pub fn vacuum(&self, scope: VacuumScope, policy: VacuumPolicy) -> Result<VacuumStats> {
        self.require_writable()?;
        self.exclusive(|| {
            let _lock = CommitLock::acquire(&self.inner.root)?;
            let mut state = self.inner.state.write();
            run_vacuum(&mut state, &self.inner.pins, scope, policy, &self.inner.root)
        })
    }

    /// Number of open pins on a version, for tests and inspection tools.
    #[must_use]
    pub fn pin_count(&self, version: VersionId) -> usize {
        self.inner.pins.count(version)
    }

    fn exclusive<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        if self
            .inner
            .exclusive_op
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StrataError::WriteConflict);
        }
        let result = op();
        self.inner.exclusive_op.store(false, Ordering::SeqCst);
        result
    }
}

/// Return allocator slots that no retained delta references.
///
/// Covers two cases after reopen: pages allocated but never recorded in a
/// persisted manifest (crash mid-version), and pages whose pending frees died
/// with the previous process.
fn sweep_orphans(state: &mut EngineState) {
    let referenced = state.versions.referenced_pages();
    let mut orphans = Vec::new();
    for alloc in state.segments.allocations() {
        let free: std::collections::BTreeSet<u32> = alloc.free_slots.iter().copied().collect();
        for slot in 0..alloc.next_slot {
            let page = strata_types::PhysicalPageId::new(alloc.id, slot);
            if !free.contains(&slot) && !referenced.contains(&page) {
                orphans.push(page);
            }
        }
    }
    if !orphans.is_empty() {
        debug!(count = orphans.len(), "orphaned pages queued for reclamation");
        state.pending_free.extend(orphans);
    }
}

// ---------------------------------------------------------------------------
// Manifest snapshots
// ---------------------------------------------------------------------------

/// Manifest image of the state exactly as it stands.
pub(crate) fn snapshot_current(state: &EngineState) -> Manifest {
    Manifest {
        page_size: state.segments.page_size(),
        capacity: state.segments.capacity(),
        min_version: state.versions.min_version(),
        active_version: state.versions.active(),
        segments: state.segments.allocations(),
        catalog_next_id: state.catalog.next_id(),
        files: state.catalog.records().map(|(id, r)| (id, r.clone())).collect(),
        versions: state
            .versions
            .records()
            .map(|(v, r)| (v, r.clone()))
            .collect(),
    }
}

/// Manifest image for the commit point: the sealing version marked sealed,
/// its successor active with an empty delta. Persisting this image *is* the
/// advance; in-memory state flips only afterwards.
pub(crate) fn snapshot_after_seal(state: &EngineState) -> Manifest {
    let mut manifest = snapshot_current(state);
    let sealing = state.versions.active();
    let next = sealing.next();

    let record = manifest
        .versions
        .get_mut(&sealing)
        .expect("sealing version has a record");
    record.state = VersionState::Sealed;
    manifest.versions.insert(
        next,
        crate::version::VersionRecord {
            state: VersionState::Active,
            tables: std::collections::BTreeMap::new(),
        },
    );
    manifest.active_version = next;
    manifest
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Write authority over one file, bound to the single active version.
pub struct WriteHandle {
    inner: Arc<StoreInner>,
    file: FileId,
}

impl WriteHandle {
    /// The version writes currently land in.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.inner.state.read().versions.active()
    }

    /// Read `buf.len()` bytes from within one page at `offset`, observing
    /// this handle's own in-flight writes. `PageNotFound` if the page has
    /// never been written at the active version.
    pub fn read(&self, page: LogicalPageId, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let state = self.inner.state.read();
        read_at_version(&state, self.file, state.versions.active(), page, offset, buf)
    }

    /// Write `data` into one page at `offset`.
    ///
    /// Copy-on-write: if the current mapping belongs to an ancestor version,
    /// a fresh physical page is allocated, seeded with the ancestor content,
    /// and overridden in the active delta - the ancestor is untouched. A page
    /// the active version itself allocated is rewritten in place.
    pub fn write(&self, page: LogicalPageId, offset: usize, data: &[u8]) -> Result<()> {
        let page_size = self.inner.page_size.as_usize();
        if offset + data.len() > page_size {
            return Err(StrataError::InvalidParameter {
                name: "offset",
                detail: format!(
                    "write of {} bytes at offset {offset} exceeds page size {page_size}",
                    data.len()
                ),
            });
        }

        let mut state = self.inner.state.write();
        let active = state.versions.active();

        if let Some(Mapping::Page(phys)) = state.versions.active_mapping(self.file, page) {
            // Active-owned page: never exposed to a sealed version.
            if data.len() == page_size {
                state.segments.write_page(phys, data)?;
            } else {
                let mut full = vec![0u8; page_size];
                state.segments.read_page(phys, &mut full)?;
                full[offset..offset + data.len()].copy_from_slice(data);
                state.segments.write_page(phys, &full)?;
            }
            return Ok(());
        }

        // Copy-on-write: seed from the ancestor's content when one exists
        // and the write does not cover the whole page.
        let mut full = vec![0u8; page_size];
        if data.len() < page_size {
            match state.versions.resolve(active, self.file, page) {
                Ok(ancestor) => state.segments.read_page(ancestor, &mut full)?,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        full[offset..offset + data.len()].copy_from_slice(data);

        let fresh = state.segments.allocate_page()?;
        state.segments.write_page(fresh, &full)?;
        if let Some(displaced) = state.versions.record_write(self.file, page, fresh) {
            state.pending_free.push(displaced);
        }
        Ok(())
    }

    /// Delete one logical page: a tombstone in the active delta. Ancestors
    /// are untouched.
    pub fn delete(&self, page: LogicalPageId) -> Result<()> {
        let mut state = self.inner.state.write();
        if let Some(displaced) = state.versions.record_tombstone(self.file, page) {
            state.pending_free.push(displaced);
        }
        Ok(())
    }

    /// Drop every logical page at or above `first_dropped`, the page-level
    /// equivalent of a file truncate.
    pub fn truncate(&self, first_dropped: LogicalPageId) -> Result<()> {
        let mut state = self.inner.state.write();
        let active = state.versions.active();
        let doomed: Vec<LogicalPageId> = state
            .versions
            .resolvable_pages(active, self.file)?
            .range(first_dropped..)
            .copied()
            .collect();
        for page in doomed {
            if let Some(displaced) = state.versions.record_tombstone(self.file, page) {
                state.pending_free.push(displaced);
            }
        }
        Ok(())
    }

    /// Logical page count at the active version.
    pub fn logical_pages(&self) -> Result<u32> {
        let state = self.inner.state.read();
        let active = state.versions.active();
        state.versions.logical_page_count(active, self.file)
    }

    /// Durability barrier: flush dirty pages, then persist the manifest.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        state.segments.flush()?;
        snapshot_current(&state).persist(&self.inner.root)
    }
}

/// Read-only capability pinned to one sealed version.
///
/// For the handle's whole lifetime, every page it can legally reach stays
/// resolvable - reclamation defers to the pin count, which drops on `Drop`.
pub struct ReadHandle {
    inner: Arc<StoreInner>,
    file: FileId,
    version: VersionId,
}

impl ReadHandle {
    /// The sealed version this handle is pinned to.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Read `buf.len()` bytes from within one page at `offset`, as of the
    /// pinned version.
    pub fn read(&self, page: LogicalPageId, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let state = self.inner.state.read();
        read_at_version(&state, self.file, self.version, page, offset, buf)
    }

    /// Logical page count at the pinned version.
    pub fn logical_pages(&self) -> Result<u32> {
        let state = self.inner.state.read();
        state.versions.logical_page_count(self.version, self.file)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.inner.pins.unpin(self.version);
    }
}

fn read_at_version(
    state: &EngineState,
    file: FileId,
    version: VersionId,
    page: LogicalPageId,
    offset: usize,
    buf: &mut [u8],
) -> Result<usize> {
    let page_size = state.segments.page_size().as_usize();
    if offset + buf.len() > page_size {
        return Err(StrataError::InvalidParameter {
            name: "offset",
            detail: format!(
                "read of {} bytes at offset {offset} exceeds page size {page_size}",
                buf.len()
            ),
        });
    }
    let phys = state.versions.resolve(version, file, page)?;
    if offset == 0 && buf.len() == page_size {
        state.segments.read_page(phys, buf)?;
    } else {
        let mut full = vec![0u8; page_size];
        state.segments.read_page(phys, &mut full)?;
        buf.copy_from_slice(&full[offset..offset + buf.len()]);
    }
    Ok(buf.len())
}
