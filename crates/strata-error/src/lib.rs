use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for strata operations.
///
/// Structured variants for the failure cases callers are expected to branch
/// on; free-form detail strings only where no caller decision depends on the
/// payload.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Store lifecycle ===
    /// No store exists at the given root directory.
    #[error("store not found: '{path}'")]
    StoreNotFound { path: PathBuf },

    /// Another process holds the store's write/commit lock.
    #[error("store is locked: '{path}'")]
    StoreLocked { path: PathBuf },

    /// The store was opened read-only and a mutating operation was attempted.
    #[error("store is read-only")]
    ReadOnly,

    /// Page size in the open request does not match the store geometry.
    #[error("page size mismatch: store has {expected}, caller requested {actual}")]
    PageSizeMismatch { expected: u32, actual: u32 },

    /// Segment capacity in the open request does not match the store geometry.
    #[error("segment capacity mismatch: store has {expected}, caller requested {actual}")]
    SegmentCapacityMismatch { expected: u32, actual: u32 },

    /// A connection parameter failed to parse or validate.
    #[error("invalid parameter '{name}': {detail}")]
    InvalidParameter { name: &'static str, detail: String },

    // === Versioning ===
    /// The requested version does not exist (never created, or already purged).
    #[error("unknown version {version}")]
    VersionUnknown { version: u32 },

    /// A read-only handle was requested against a version that is not sealed.
    #[error("version {version} is not sealed")]
    VersionNotSealed { version: u32 },

    /// A write handle was requested against a sealed version.
    #[error("version {version} is sealed and cannot be written")]
    VersionSealed { version: u32 },

    /// A write or commit was attempted while another commit is in flight.
    #[error("write conflict: a commit is already in progress")]
    WriteConflict,

    // === Resolution ===
    /// No mapping for the logical page exists in the version chain.
    #[error("page {page} not found")]
    PageNotFound { page: u32 },

    /// The named file does not exist in the catalog at the resolved version.
    #[error("no such file: '{name}'")]
    FileNotFound { name: String },

    // === I/O and durability ===
    /// Underlying file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes than required were read from a segment or the manifest.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// The manifest failed a consistency check on open.
    #[error("corrupt manifest: {detail}")]
    CorruptManifest { detail: String },

    /// A segment file header failed validation.
    #[error("corrupt segment: {detail}")]
    CorruptSegment { detail: String },
}

impl StrataError {
    /// True if this error means "the page simply is not there", as opposed to
    /// a real I/O failure. The VFS layer relies on this distinction to map
    /// read misses onto the host engine's zero-filled short-read convention.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PageNotFound { .. } | Self::FileNotFound { .. }
        )
    }
}

/// Convenient result alias used across all strata crates.
pub type Result<T, E = StrataError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_are_stable() {
        let err = StrataError::PageSizeMismatch {
            expected: 4096,
            actual: 8192,
        };
        assert_eq!(
            err.to_string(),
            "page size mismatch: store has 4096, caller requested 8192"
        );

        let err = StrataError::PageNotFound { page: 7 };
        assert_eq!(err.to_string(), "page 7 not found");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::other("disk on fire");
        let err: StrataError = io.into();
        assert!(matches!(err, StrataError::Io(_)));
    }

    #[test]
    fn not_found_classification() {
        assert!(StrataError::PageNotFound { page: 1 }.is_not_found());
        assert!(
            StrataError::FileNotFound {
                name: "journal".to_owned()
            }
            .is_not_found()
        );
        assert!(!StrataError::WriteConflict.is_not_found());
    }
}
