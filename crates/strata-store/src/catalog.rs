//! Versioned name → file-id catalog.
//!
//! The host engine opens several files against one store (main database,
//! rollback journal, WAL); each becomes an independently versioned logical
//! page space identified by a [`FileId`]. Creation and deletion are stamped
//! with the active version, so a reader pinned to an older version still sees
//! files deleted later.

use std::collections::BTreeMap;

use tracing::debug;

use strata_types::{FileId, VersionId};

/// Catalog entry for one logical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    /// Version under which the file was created (visible from here on).
    pub created_at: VersionId,
    /// Version under which the file was deleted, if it was. The file is
    /// visible at version `v` iff `created_at <= v` and `v < deleted_at`.
    pub deleted_at: Option<VersionId>,
}

impl FileRecord {
    fn visible_at(&self, v: VersionId) -> bool {
        self.created_at <= v && self.deleted_at.is_none_or(|d| v < d)
    }
}

/// The store's file catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCatalog {
    files: BTreeMap<FileId, FileRecord>,
    next_id: u32,
}

impl FileCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from manifest data.
    #[must_use]
    pub fn from_parts(files: BTreeMap<FileId, FileRecord>, next_id: u32) -> Self {
        Self { files, next_id }
    }

    /// Look up a file by name as visible at `v`.
    #[must_use]
    pub fn lookup_at(&self, name: &str, v: VersionId) -> Option<FileId> {
        self.files
            .iter()
            .find(|(_, r)| r.name == name && r.visible_at(v))
            .map(|(&id, _)| id)
    }

    /// Create a file under the active version. The caller has checked no
    /// visible file of this name exists.
    pub fn create(&mut self, name: &str, active: VersionId) -> FileId {
        let id = FileId::new(self.next_id);
        self.next_id += 1;
        self.files.insert(
            id,
            FileRecord {
                name: name.to_owned(),
                created_at: active,
                deleted_at: None,
            },
        );
        debug!(file = id.get(), name, version = active.get(), "file created");
        id
    }

    /// Mark a file deleted under the active version. Sealed versions below
    /// `active` keep resolving it.
    pub fn mark_deleted(&mut self, id: FileId, active: VersionId) {
        if let Some(record) = self.files.get_mut(&id) {
            record.deleted_at = Some(active);
            debug!(file = id.get(), version = active.get(), "file deleted");
        }
    }

    /// Every record, visible or not (manifest encoding, purge scans).
    pub fn records(&self) -> impl Iterator<Item = (FileId, &FileRecord)> {
        self.files.iter().map(|(&id, r)| (id, r))
    }

    #[must_use]
    pub fn record(&self, id: FileId) -> Option<&FileRecord> {
        self.files.get(&id)
    }

    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// True if no version at or above `floor` can see the file: it was
    /// deleted at or below the floor, so purging history up to `floor`
    /// orphans it completely.
    #[must_use]
    pub fn dead_below(&self, id: FileId, floor: VersionId) -> bool {
        self.files
            .get(&id)
            .and_then(|r| r.deleted_at)
            .is_some_and(|d| d <= floor)
    }

    /// Drop records that `dead_below` the floor. Called by the purge pass
    /// after their pages have been freed.
    pub fn retire_dead(&mut self, floor: VersionId) {
        self.files
            .retain(|_, r| r.deleted_at.is_none_or(|d| d > floor));
    }
}
