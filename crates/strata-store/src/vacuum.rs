//! Reclamation: active-scope compaction and full-history purge.
//!
//! Reclamation never touches a page that a sealed version can still resolve
//! while that version is retained, and never retires a version with an open
//! pinned handle. The pin table is the only synchronization point between
//! readers and reclamation: readers increment on open and decrement on drop,
//! and purge skips everything at or above the lowest pinned version.
//!
//! Active scope reclaims only pages the active version itself shadowed or
//! deleted; by construction no sealed version ever referenced those, so no
//! sealed version's resolution can change.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use strata_error::Result;
use strata_types::VersionId;

use crate::store::{snapshot_current, EngineState};

/// What a vacuum pass is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumScope {
    /// Routine compaction of the active version only.
    Active,
    /// Retire sealed history with no live pinned handles and free every page
    /// that only retired versions referenced.
    Purge,
}

/// How aggressively the active scope compacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VacuumPolicy {
    /// Return freed slots to the allocator; no data movement.
    #[default]
    Incremental,
    /// Also relocate active-owned pages into the lowest free slots and drop
    /// emptied tail segments.
    Full,
}

/// Outcome of a vacuum pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VacuumStats {
    /// Physical pages returned to the allocator.
    pub pages_freed: u64,
    /// Pages rewritten to a lower slot (Full policy only).
    pub pages_moved: u64,
    /// Sealed versions retired (Purge scope only).
    pub versions_dropped: u32,
    /// Tail segments deleted.
    pub segments_removed: u32,
}

// ---------------------------------------------------------------------------
// Pin table
// ---------------------------------------------------------------------------

/// Reference counts of open pinned read-only handles, per sealed version.
#[derive(Debug, Default)]
pub struct PinSet {
    pins: Mutex<HashMap<u32, usize>>,
}

impl PinSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, v: VersionId) {
        *self.pins.lock().entry(v.get()).or_insert(0) += 1;
    }

    pub fn unpin(&self, v: VersionId) {
        let mut pins = self.pins.lock();
        match pins.get_mut(&v.get()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&v.get());
            }
            None => debug_assert!(false, "unpin without pin"),
        }
    }

    #[must_use]
    pub fn count(&self, v: VersionId) -> usize {
        self.pins.lock().get(&v.get()).copied().unwrap_or(0)
    }

    /// Lowest version with at least one open pinned handle.
    #[must_use]
    pub fn min_pinned(&self) -> Option<VersionId> {
        self.pins
            .lock()
            .keys()
            .min()
            .copied()
            .and_then(VersionId::new)
    }
}

// ---------------------------------------------------------------------------
// Vacuum passes
// ---------------------------------------------------------------------------

/// Run a vacuum pass. The caller holds the engine write lock and the same
/// exclusion as commit, so no seal can interleave.
pub(crate) fn run_vacuum(
    state: &mut EngineState,
    pins: &PinSet,
    scope: VacuumScope,
    policy: VacuumPolicy,
    root: &std::path::Path,
) -> Result<VacuumStats> {
    let mut stats = VacuumStats::default();

    match scope {
        VacuumScope::Active => vacuum_active(state, policy, &mut stats)?,
        VacuumScope::Purge => {
            // Purge subsumes the incremental active pass: drain pending
            // frees first so retired history and shadowed pages land in the
            // same allocator sweep.
            vacuum_active(state, VacuumPolicy::Incremental, &mut stats)?;
            purge_history(state, pins, &mut stats)?;
        }
    }

    // Allocation state changed; the manifest is the only durable record of it.
    state.segments.flush()?;
    snapshot_current(state).persist(root)?;

    info!(
        scope = ?scope,
        freed = stats.pages_freed,
        moved = stats.pages_moved,
        versions_dropped = stats.versions_dropped,
        segments_removed = stats.segments_removed,
        "vacuum complete"
    );
    Ok(stats)
}

fn vacuum_active(
    state: &mut EngineState,
    policy: VacuumPolicy,
    stats: &mut VacuumStats,
) -> Result<()> {
    // Pages the active version shadowed or deleted since the last pass.
    for page in std::mem::take(&mut state.pending_free) {
        state.segments.free_page(page)?;
        stats.pages_freed += 1;
    }

    if policy == VacuumPolicy::Full {
        compact_active(state, stats)?;
        let removed = state.segments.remove_empty_tail_segments()?;
        stats.segments_removed += u32::try_from(removed.len()).expect("segment count fits u32");
    }
    Ok(())
}

/// Relocate active-owned pages into the lowest free slots. Only the active
/// version's own pages move; sealed mappings are immutable.
fn compact_active(state: &mut EngineState, stats: &mut VacuumStats) -> Result<()> {
    let mut entries = state.versions.active_entries();
    // Highest physical pages first, so the tail empties fastest.
    entries.sort_by(|a, b| b.2.cmp(&a.2));

    let page_size = state.segments.page_size().as_usize();
    let mut buf = vec![0u8; page_size];

    for (file, page, old) in entries {
        let new = state.segments.allocate_page()?;
        if new >= old {
            // First-fit allocation: nothing lower is free, so no later entry
            // can move either.
            state.segments.free_page(new)?;
            break;
        }
        state.segments.read_page(old, &mut buf)?;
        state.segments.write_page(new, &buf)?;
        state.versions.set_active_entry(file, page, new);
        state.segments.free_page(old)?;
        stats.pages_moved += 1;
        debug!(file = file.get(), page = page.get(), from = %old, to = %new, "page relocated");
    }
    Ok(())
}

/// Retire sealed versions below every live pin and below the latest sealed
/// version, folding their still-live mappings forward so no retained
/// version's resolution changes.
fn purge_history(state: &mut EngineState, pins: &PinSet, stats: &mut VacuumStats) -> Result<()> {
    let Some(latest_sealed) = state.versions.latest_sealed() else {
        return Ok(());
    };
    // The latest sealed version always survives; so does anything a reader
    // still holds open, and everything above it.
    let floor_target = pins.min_pinned().map_or(latest_sealed, |p| p.min(latest_sealed));

    while state.versions.min_version() < floor_target {
        let successor = state
            .versions
            .min_version()
            .next();
        let catalog = &state.catalog;
        let freed = state
            .versions
            .merge_floor_into_successor(|file| catalog.dead_below(file, successor));
        for page in freed {
            state.segments.free_page(page)?;
            stats.pages_freed += 1;
        }
        stats.versions_dropped += 1;
    }

    state.catalog.retire_dead(state.versions.min_version());

    let removed = state.segments.remove_empty_tail_segments()?;
    stats.segments_removed += u32::try_from(removed.len()).expect("segment count fits u32");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: u32) -> VersionId {
        VersionId::new(n).unwrap()
    }

    #[test]
    fn pin_counts_nest() {
        let pins = PinSet::new();
        pins.pin(v(3));
        pins.pin(v(3));
        pins.pin(v(5));
        assert_eq!(pins.count(v(3)), 2);
        assert_eq!(pins.min_pinned(), Some(v(3)));

        pins.unpin(v(3));
        assert_eq!(pins.count(v(3)), 1);
        pins.unpin(v(3));
        assert_eq!(pins.count(v(3)), 0);
        assert_eq!(pins.min_pinned(), Some(v(5)));

        pins.unpin(v(5));
        assert_eq!(pins.min_pinned(), None);
    }
}
