//! Virtual-filesystem adaptor for the strata versioned page store.
//!
//! The host database engine talks to storage through the [`Vfs`] and
//! [`VfsFile`] traits: byte-offset reads and writes, truncate, sync, file
//! size, and the five-level lock ladder. [`StrataVfs`] implements them on top
//! of [`strata_store::Store`], translating byte ranges into logical page
//! operations parameterized by the connection's version and access mode.

mod adaptor;
pub mod params;
pub mod traits;

pub use adaptor::{StrataFile, StrataVfs};
pub use params::{AutoVacuumMode, JournalMode, OpenParams};
pub use traits::{FileKind, Vfs, VfsFile};
