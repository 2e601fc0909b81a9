//! Public API facade for the strata versioned page store.
//!
//! Re-exports the store, handle, and VFS surface; the crates underneath stay
//! importable directly for embedders that want a single layer.

pub use strata_error::{Result, StrataError};
pub use strata_store::{
    Manifest, ReadHandle, Store, StoreOptions, VacuumPolicy, VacuumScope, VacuumStats, WriteHandle,
};
pub use strata_types::{
    AccessMode, FileId, LockLevel, LogicalPageId, PageData, PageSize, PhysicalPageId,
    SegmentCapacity, SegmentId, SyncLevel, VersionId,
};
pub use strata_vfs::{FileKind, OpenParams, StrataFile, StrataVfs, Vfs, VfsFile};
