//! Version chain management: per-version delta page tables and resolution.
//!
//! Each version holds only the logical pages it changed, as a delta map of
//! logical page → [`Mapping`]. Resolution walks the chain from the requested
//! version backward through ancestors until a delta entry is found; a
//! [`Mapping::Tombstone`] terminates the walk with "not found", so deletions
//! in a newer version never disturb what an older version resolves.
//!
//! Exactly one version is ever writable. A physical page recorded in the
//! active version's delta was allocated by that version and has never been
//! exposed to a sealed snapshot, which is what makes in-place rewrites of
//! such pages safe.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use strata_error::{Result, StrataError};
use strata_types::{FileId, LogicalPageId, PhysicalPageId, VersionId};

/// Lifecycle state of a version.
///
/// `Active → Sealing → Sealed`; the sealing step is driven exclusively by the
/// commit coordinator, and a sealed version never becomes writable again. A
/// failed commit reverts `Sealing` back to `Active` before any durable state
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    Active,
    Sealing,
    Sealed,
}

/// One entry in a version's delta table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// The logical page maps to this physical page from this version onward.
    Page(PhysicalPageId),
    /// The logical page is deleted from this version onward.
    Tombstone,
}

/// Delta page table for one file within one version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTable {
    pub entries: BTreeMap<LogicalPageId, Mapping>,
}

/// One version's record: lifecycle state plus per-file delta tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub state: VersionState,
    pub tables: BTreeMap<FileId, PageTable>,
}

impl VersionRecord {
    fn empty(state: VersionState) -> Self {
        Self {
            state,
            tables: BTreeMap::new(),
        }
    }

    fn lookup(&self, file: FileId, page: LogicalPageId) -> Option<Mapping> {
        self.tables
            .get(&file)
            .and_then(|t| t.entries.get(&page))
            .copied()
    }
}

/// The ordered sequence of retained versions.
pub struct VersionManager {
    min: VersionId,
    active: VersionId,
    records: BTreeMap<VersionId, VersionRecord>,
}

impl VersionManager {
    /// A fresh store: version 1 active, nothing sealed.
    #[must_use]
    pub fn new() -> Self {
        let mut records = BTreeMap::new();
        records.insert(VersionId::FIRST, VersionRecord::empty(VersionState::Active));
        Self {
            min: VersionId::FIRST,
            active: VersionId::FIRST,
            records,
        }
    }

    /// Rebuild from manifest data. The caller (manifest decode) has already
    /// validated structural invariants; this re-checks the cheap ones.
    pub fn from_parts(
        min: VersionId,
        active: VersionId,
        records: BTreeMap<VersionId, VersionRecord>,
    ) -> Result<Self> {
        if min > active {
            return Err(StrataError::CorruptManifest {
                detail: format!("retained floor {min} above active version {active}"),
            });
        }
        for (&v, record) in &records {
            let expected = if v == active {
                VersionState::Active
            } else {
                VersionState::Sealed
            };
            if record.state != expected {
                return Err(StrataError::CorruptManifest {
                    detail: format!("version {v} has state {:?}, expected {expected:?}", record.state),
                });
            }
        }
        if !records.contains_key(&active) {
            return Err(StrataError::CorruptManifest {
                detail: format!("active version {active} has no record"),
            });
        }
        Ok(Self {
            min,
            active,
            records,
        })
    }

    #[must_use]
    pub fn active(&self) -> VersionId {
        self.active
    }

    /// Lowest retained version; anything below has been purged.
    #[must_use]
    pub fn min_version(&self) -> VersionId {
        self.min
    }

    /// Highest sealed version, if any version has been sealed yet.
    #[must_use]
    pub fn latest_sealed(&self) -> Option<VersionId> {
        self.active.prev().filter(|v| *v >= self.min)
    }

    /// True if `v` is a retained, sealed version.
    #[must_use]
    pub fn is_sealed(&self, v: VersionId) -> bool {
        v >= self.min && v < self.active
    }

    pub fn state(&self, v: VersionId) -> Option<VersionState> {
        self.records.get(&v).map(|r| r.state)
    }

    /// Iterate retained versions in ascending order.
    pub fn records(&self) -> impl Iterator<Item = (VersionId, &VersionRecord)> {
        self.records.iter().map(|(&v, r)| (v, r))
    }

    fn check_resolvable(&self, v: VersionId) -> Result<()> {
        if v < self.min || v > self.active {
            return Err(StrataError::VersionUnknown { version: v.get() });
        }
        Ok(())
    }

    /// Resolve a logical page at a version by walking the chain backward.
    pub fn resolve(&self, v: VersionId, file: FileId, page: LogicalPageId) -> Result<PhysicalPageId> {
        self.check_resolvable(v)?;
        for record in self.records.range(..=v).rev().map(|(_, r)| r) {
            match record.lookup(file, page) {
                Some(Mapping::Page(p)) => return Ok(p),
                Some(Mapping::Tombstone) => break,
                None => {}
            }
        }
        Err(StrataError::PageNotFound { page: page.get() })
    }

    /// The active version's own delta entry for a page, if it has one.
    ///
    /// `Some(Mapping::Page(p))` means the active version allocated `p` itself
    /// and may rewrite it in place.
    #[must_use]
    pub fn active_mapping(&self, file: FileId, page: LogicalPageId) -> Option<Mapping> {
        self.records[&self.active].lookup(file, page)
    }

    fn active_table(&mut self, file: FileId) -> &mut PageTable {
        self.records
            .get_mut(&self.active)
            .expect("active record always present")
            .tables
            .entry(file)
            .or_default()
    }

    /// Record a logical → physical override in the active version.
    ///
    /// Returns the physical page this override displaces *within the active
    /// delta itself* - a page only the active version ever referenced, which
    /// the caller returns to the allocator. Ancestor mappings are untouched.
    pub fn record_write(
        &mut self,
        file: FileId,
        page: LogicalPageId,
        phys: PhysicalPageId,
    ) -> Option<PhysicalPageId> {
        match self.active_table(file).entries.insert(page, Mapping::Page(phys)) {
            Some(Mapping::Page(old)) if old != phys => Some(old),
            _ => None,
        }
    }

    /// Record a tombstone in the active version.
    ///
    /// Returns a displaced active-owned physical page, as with
    /// [`record_write`](Self::record_write).
    pub fn record_tombstone(&mut self, file: FileId, page: LogicalPageId) -> Option<PhysicalPageId> {
        match self.active_table(file).entries.insert(page, Mapping::Tombstone) {
            Some(Mapping::Page(old)) => Some(old),
            _ => None,
        }
    }

    /// Every logical page resolvable at version `v` for `file`, in order.
    pub fn resolvable_pages(&self, v: VersionId, file: FileId) -> Result<BTreeSet<LogicalPageId>> {
        self.check_resolvable(v)?;
        let mut decided: BTreeMap<LogicalPageId, bool> = BTreeMap::new();
        for record in self.records.range(..=v).rev().map(|(_, r)| r) {
            if let Some(table) = record.tables.get(&file) {
                for (&page, &mapping) in &table.entries {
                    decided
                        .entry(page)
                        .or_insert(matches!(mapping, Mapping::Page(_)));
                }
            }
        }
        Ok(decided
            .into_iter()
            .filter_map(|(page, live)| live.then_some(page))
            .collect())
    }

    /// Logical page count at `v` for `file`: highest resolvable page + 1.
    pub fn logical_page_count(&self, v: VersionId, file: FileId) -> Result<u32> {
        let pages = self.resolvable_pages(v, file)?;
        Ok(pages.iter().next_back().map_or(0, |p| p.get() + 1))
    }

    // -- seal protocol ------------------------------------------------------

    /// `Active → Sealing`. Only the commit coordinator calls this.
    pub fn begin_seal(&mut self) -> VersionId {
        let v = self.active;
        let record = self.records.get_mut(&v).expect("active record");
        debug_assert_eq!(record.state, VersionState::Active);
        record.state = VersionState::Sealing;
        debug!(version = v.get(), "sealing version");
        v
    }

    /// `Sealing → Sealed`; opens the next version as active with an empty
    /// delta. Returns the new active version id.
    pub fn complete_seal(&mut self) -> VersionId {
        let sealed = self.active;
        let record = self.records.get_mut(&sealed).expect("sealing record");
        debug_assert_eq!(record.state, VersionState::Sealing);
        record.state = VersionState::Sealed;

        let next = sealed.next();
        self.records
            .insert(next, VersionRecord::empty(VersionState::Active));
        self.active = next;
        debug!(
            sealed = sealed.get(),
            active = next.get(),
            "version sealed, next version active"
        );
        next
    }

    /// `Sealing → Active`: a failed commit leaves the version fully writable.
    pub fn abort_seal(&mut self) {
        let record = self.records.get_mut(&self.active).expect("active record");
        debug_assert_eq!(record.state, VersionState::Sealing);
        record.state = VersionState::Active;
        debug!(version = self.active.get(), "seal aborted, version writable again");
    }

    /// Drop the active version's whole delta table for a file, returning the
    /// physical pages it referenced (all active-owned). Used when the file
    /// itself is deleted under the active version.
    pub fn remove_active_table(&mut self, file: FileId) -> Vec<PhysicalPageId> {
        let record = self.records.get_mut(&self.active).expect("active record");
        record
            .tables
            .remove(&file)
            .map(|table| {
                table
                    .entries
                    .into_values()
                    .filter_map(|m| match m {
                        Mapping::Page(p) => Some(p),
                        Mapping::Tombstone => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every page mapping in the active version's delta, for compaction.
    #[must_use]
    pub fn active_entries(&self) -> Vec<(FileId, LogicalPageId, PhysicalPageId)> {
        let record = &self.records[&self.active];
        record
            .tables
            .iter()
            .flat_map(|(&file, table)| {
                table.entries.iter().filter_map(move |(&page, &m)| match m {
                    Mapping::Page(p) => Some((file, page, p)),
                    Mapping::Tombstone => None,
                })
            })
            .collect()
    }

    /// Repoint an existing active delta entry at a relocated physical page.
    pub fn set_active_entry(&mut self, file: FileId, page: LogicalPageId, phys: PhysicalPageId) {
        let entry = self
            .records
            .get_mut(&self.active)
            .expect("active record")
            .tables
            .get_mut(&file)
            .and_then(|t| t.entries.get_mut(&page))
            .expect("relocated entry exists");
        *entry = Mapping::Page(phys);
    }

    /// Every physical page referenced by any retained version's delta.
    #[must_use]
    pub fn referenced_pages(&self) -> BTreeSet<PhysicalPageId> {
        self.records
            .values()
            .flat_map(|r| r.tables.values())
            .flat_map(|t| t.entries.values())
            .filter_map(|m| match m {
                Mapping::Page(p) => Some(*p),
                Mapping::Tombstone => None,
            })
            .collect()
    }

    // -- purge support ------------------------------------------------------

    /// Fold the oldest retained version into its successor and drop it.
    ///
    /// Entries of the floor version survive by moving into the successor's
    /// delta wherever the successor does not override them, so resolution at
    /// the successor and every later version is unchanged. Overridden entries
    /// (and every entry of a file for which `drop_file` returns true) are
    /// returned as newly unreferenced physical pages.
    ///
    /// The caller guarantees the floor version is sealed and unpinned.
    pub fn merge_floor_into_successor(
        &mut self,
        drop_file: impl Fn(FileId) -> bool,
    ) -> Vec<PhysicalPageId> {
        let floor = self.min;
        debug_assert!(floor < self.active, "cannot merge the active version");

        let record = self.records.remove(&floor).expect("floor record");
        let (&successor, _) = self
            .records
            .range(floor..)
            .next()
            .expect("successor exists below active");

        let mut freed = Vec::new();
        let successor_record = self.records.get_mut(&successor).expect("successor record");
        for (file, table) in record.tables {
            if drop_file(file) {
                for mapping in table.entries.into_values() {
                    if let Mapping::Page(p) = mapping {
                        freed.push(p);
                    }
                }
                continue;
            }
            let dest = successor_record.tables.entry(file).or_default();
            for (page, mapping) in table.entries {
                match dest.entries.entry(page) {
                    std::collections::btree_map::Entry::Vacant(e) => {
                        e.insert(mapping);
                    }
                    std::collections::btree_map::Entry::Occupied(_) => {
                        // Successor overrides this page; the floor's copy is
                        // now unreachable from every retained version.
                        if let Mapping::Page(p) = mapping {
                            freed.push(p);
                        }
                    }
                }
            }
        }

        self.min = successor;
        debug!(
            dropped = floor.get(),
            floor = successor.get(),
            freed = freed.len(),
            "merged floor version into successor"
        );
        freed
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::SegmentId;

    fn phys(n: u32) -> PhysicalPageId {
        PhysicalPageId::new(SegmentId::new(0), n)
    }

    fn lp(n: u32) -> LogicalPageId {
        LogicalPageId::new(n)
    }

    const F: FileId = FileId::new(1);

    #[test]
    fn resolve_walks_ancestors() {
        let mut vm = VersionManager::new();
        vm.record_write(F, lp(0), phys(10));
        vm.begin_seal();
        let v2 = vm.complete_seal();
        assert_eq!(v2.get(), 2);

        // Page 0 unchanged in v2: resolves through v1's delta.
        assert_eq!(vm.resolve(v2, F, lp(0)).unwrap(), phys(10));
        assert_eq!(vm.resolve(VersionId::FIRST, F, lp(0)).unwrap(), phys(10));
    }

    #[test]
    fn overwrite_in_new_version_leaves_ancestor_intact() {
        let mut vm = VersionManager::new();
        vm.record_write(F, lp(0), phys(10));
        vm.begin_seal();
        let v2 = vm.complete_seal();

        vm.record_write(F, lp(0), phys(20));
        assert_eq!(vm.resolve(v2, F, lp(0)).unwrap(), phys(20));
        assert_eq!(vm.resolve(VersionId::FIRST, F, lp(0)).unwrap(), phys(10));
    }

    #[test]
    fn tombstone_stops_the_walk() {
        let mut vm = VersionManager::new();
        vm.record_write(F, lp(3), phys(10));
        vm.begin_seal();
        let v2 = vm.complete_seal();

        vm.record_tombstone(F, lp(3));
        assert!(matches!(
            vm.resolve(v2, F, lp(3)),
            Err(StrataError::PageNotFound { page: 3 })
        ));
        assert_eq!(vm.resolve(VersionId::FIRST, F, lp(3)).unwrap(), phys(10));
    }

    #[test]
    fn displaced_active_pages_are_reported() {
        let mut vm = VersionManager::new();
        assert_eq!(vm.record_write(F, lp(0), phys(1)), None);
        assert_eq!(vm.record_write(F, lp(0), phys(2)), Some(phys(1)));
        assert_eq!(vm.record_tombstone(F, lp(0)), Some(phys(2)));
        // Tombstone over a tombstone displaces nothing.
        assert_eq!(vm.record_tombstone(F, lp(0)), None);
    }

    #[test]
    fn resolve_rejects_out_of_range_versions() {
        let vm = VersionManager::new();
        let v9 = VersionId::new(9).unwrap();
        assert!(matches!(
            vm.resolve(v9, F, lp(0)),
            Err(StrataError::VersionUnknown { version: 9 })
        ));
    }

    #[test]
    fn resolvable_pages_applies_tombstones() {
        let mut vm = VersionManager::new();
        vm.record_write(F, lp(0), phys(1));
        vm.record_write(F, lp(1), phys(2));
        vm.record_write(F, lp(5), phys(3));
        vm.begin_seal();
        let v2 = vm.complete_seal();
        vm.record_tombstone(F, lp(1));

        let at_v1 = vm.resolvable_pages(VersionId::FIRST, F).unwrap();
        assert_eq!(at_v1.into_iter().collect::<Vec<_>>(), vec![lp(0), lp(1), lp(5)]);

        let at_v2 = vm.resolvable_pages(v2, F).unwrap();
        assert_eq!(at_v2.into_iter().collect::<Vec<_>>(), vec![lp(0), lp(5)]);

        assert_eq!(vm.logical_page_count(v2, F).unwrap(), 6);
    }

    #[test]
    fn seal_state_machine() {
        let mut vm = VersionManager::new();
        assert_eq!(vm.state(VersionId::FIRST), Some(VersionState::Active));

        vm.begin_seal();
        assert_eq!(vm.state(VersionId::FIRST), Some(VersionState::Sealing));
        vm.abort_seal();
        assert_eq!(vm.state(VersionId::FIRST), Some(VersionState::Active));

        vm.begin_seal();
        let v2 = vm.complete_seal();
        assert_eq!(vm.state(VersionId::FIRST), Some(VersionState::Sealed));
        assert_eq!(vm.state(v2), Some(VersionState::Active));
        assert!(vm.is_sealed(VersionId::FIRST));
        assert!(!vm.is_sealed(v2));
        assert_eq!(vm.latest_sealed(), Some(VersionId::FIRST));
    }

    #[test]
    fn merge_floor_preserves_successor_resolution() {
        let mut vm = VersionManager::new();
        vm.record_write(F, lp(0), phys(1));
        vm.record_write(F, lp(1), phys(2));
        vm.begin_seal();
        let v2 = vm.complete_seal();
        vm.record_write(F, lp(0), phys(3));
        vm.begin_seal();
        let v3 = vm.complete_seal();

        // Drop v1. Page 1 must keep resolving at v2/v3; v1's page 0 copy is
        // shadowed by v2 and comes back as freeable.
        let freed = vm.merge_floor_into_successor(|_| false);
        assert_eq!(freed, vec![phys(1)]);
        assert_eq!(vm.min_version(), v2);

        assert_eq!(vm.resolve(v2, F, lp(0)).unwrap(), phys(3));
        assert_eq!(vm.resolve(v2, F, lp(1)).unwrap(), phys(2));
        assert_eq!(vm.resolve(v3, F, lp(1)).unwrap(), phys(2));
        assert!(matches!(
            vm.resolve(VersionId::FIRST, F, lp(0)),
            Err(StrataError::VersionUnknown { .. })
        ));
    }

    #[test]
    fn merge_floor_drops_dead_files_entirely() {
        let mut vm = VersionManager::new();
        vm.record_write(F, lp(0), phys(1));
        vm.begin_seal();
        vm.complete_seal();
        vm.begin_seal();
        vm.complete_seal();

        let freed = vm.merge_floor_into_successor(|file| file == F);
        assert_eq!(freed, vec![phys(1)]);
    }
}
