//! End-to-end versioning behavior through the public `Store` surface:
//! snapshot immutability, pinned readers, reclamation isolation.

use strata::{
    LogicalPageId, PageSize, SegmentCapacity, Store, StoreOptions, StrataError, VacuumPolicy,
    VacuumScope, VersionId,
};

const PAGE: usize = 512;

fn options() -> StoreOptions {
    StoreOptions {
        page_size: PageSize::new(512).unwrap(),
        segment_capacity: SegmentCapacity::new(64).unwrap(),
    }
}

fn lp(n: u32) -> LogicalPageId {
    LogicalPageId::new(n)
}

fn v(n: u32) -> VersionId {
    VersionId::new(n).unwrap()
}

/// A page's content tagged by (version, page) so snapshots are tellable apart.
fn content(version: u32, page: u32) -> Vec<u8> {
    let mut data = vec![0u8; PAGE];
    data[0..4].copy_from_slice(&version.to_le_bytes());
    data[4..8].copy_from_slice(&page.to_le_bytes());
    data[8] = 0xA5;
    data
}

fn read_page(handle: &strata::ReadHandle, page: u32) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE];
    handle.read(lp(page), 0, &mut buf).unwrap();
    buf
}

#[test]
fn sealed_pages_survive_later_commits_and_vacuums() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), options()).unwrap();
    let db = store.write_handle("main.db").unwrap();

    for page in 0..20 {
        db.write(lp(page), 0, &content(1, page)).unwrap();
    }
    store.commit().unwrap();

    // Churn: two more generations of overwrites, commits, and vacuums.
    for generation in 2..4u32 {
        for page in 0..20 {
            db.write(lp(page), 0, &content(generation, page)).unwrap();
        }
        store.commit().unwrap();
        store
            .vacuum(VacuumScope::Active, VacuumPolicy::Full)
            .unwrap();
    }

    let pinned = store.read_handle("main.db", v(1)).unwrap();
    for page in 0..20 {
        assert_eq!(read_page(&pinned, page), content(1, page), "page {page} at v1");
    }
}

#[test]
fn insert_seal_insert_counts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), options()).unwrap();
    let db = store.write_handle("rows.db").unwrap();

    // 100 logical rows under version 1.
    for page in 0..100 {
        db.write(lp(page), 0, &content(1, page)).unwrap();
    }
    let active = store.commit().unwrap();
    assert_eq!(active, v(2));

    // 100 more under version 2.
    for page in 100..200 {
        db.write(lp(page), 0, &content(2, page)).unwrap();
    }

    let v1 = store.read_handle("rows.db", v(1)).unwrap();
    assert_eq!(v1.logical_pages().unwrap(), 100);
    assert_eq!(db.logical_pages().unwrap(), 200);
}

#[test]
fn delete_after_commit_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), options()).unwrap();
    let db = store.write_handle("rows.db").unwrap();

    for page in 0..100 {
        db.write(lp(page), 0, &content(1, page)).unwrap();
    }
    store.commit().unwrap(); // seals v1
    for page in 100..200 {
        db.write(lp(page), 0, &content(2, page)).unwrap();
    }
    store.commit().unwrap(); // seals v2 with 200 rows, activates v3

    for page in 0..200 {
        db.delete(lp(page)).unwrap();
    }
    store.commit().unwrap(); // seals v3 empty, activates v4

    // v4 (active) shows nothing.
    assert_eq!(db.logical_pages().unwrap(), 0);

    // v2 pinned still shows all 200 rows.
    let v2 = store.read_handle("rows.db", v(2)).unwrap();
    assert_eq!(v2.logical_pages().unwrap(), 200);
    assert_eq!(read_page(&v2, 0), content(1, 0));
    assert_eq!(read_page(&v2, 150), content(2, 150));

    // v3 pinned shows the emptied state.
    let v3 = store.read_handle("rows.db", v(3)).unwrap();
    assert_eq!(v3.logical_pages().unwrap(), 0);
    let mut buf = vec![0u8; PAGE];
    assert!(matches!(
        v3.read(lp(0), 0, &mut buf),
        Err(StrataError::PageNotFound { page: 0 })
    ));
}

#[test]
fn vacuum_does_not_disturb_sealed_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), options()).unwrap();
    let db = store.write_handle("rows.db").unwrap();

    for page in 0..100 {
        db.write(lp(page), 0, &content(1, page)).unwrap();
    }
    store.commit().unwrap();
    for page in 100..200 {
        db.write(lp(page), 0, &content(2, page)).unwrap();
    }
    store.commit().unwrap();
    for page in 0..200 {
        db.delete(lp(page)).unwrap();
    }
    store.commit().unwrap();

    // Vacuum the active lineage, both policies.
    store
        .vacuum(VacuumScope::Active, VacuumPolicy::Incremental)
        .unwrap();
    store
        .vacuum(VacuumScope::Active, VacuumPolicy::Full)
        .unwrap();

    // The sealed v2 snapshot is exactly the 200 rows it was sealed with.
    let v2 = store.read_handle("rows.db", v(2)).unwrap();
    assert_eq!(v2.logical_pages().unwrap(), 200);
    for page in 0..100 {
        assert_eq!(read_page(&v2, page), content(1, page));
    }
    for page in 100..200 {
        assert_eq!(read_page(&v2, page), content(2, page));
    }
}

#[test]
fn repeated_pinned_opens_resolve_identically() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), options()).unwrap();
    let db = store.write_handle("main.db").unwrap();

    for page in 0..10 {
        db.write(lp(page), 0, &content(1, page)).unwrap();
    }
    store.commit().unwrap();
    for page in 0..10 {
        db.write(lp(page), 0, &content(2, page)).unwrap();
    }
    store.commit().unwrap();

    let first: Vec<Vec<u8>> = {
        let pinned = store.read_handle("main.db", v(1)).unwrap();
        (0..10).map(|p| read_page(&pinned, p)).collect()
    };
    let second: Vec<Vec<u8>> = {
        let pinned = store.read_handle("main.db", v(1)).unwrap();
        (0..10).map(|p| read_page(&pinned, p)).collect()
    };
    assert_eq!(first, second);
}

#[test]
fn purge_defers_to_pinned_readers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), options()).unwrap();
    let db = store.write_handle("main.db").unwrap();

    db.write(lp(0), 0, &content(1, 0)).unwrap();
    store.commit().unwrap(); // v1 sealed
    db.write(lp(0), 0, &content(2, 0)).unwrap();
    store.commit().unwrap(); // v2 sealed
    db.write(lp(0), 0, &content(3, 0)).unwrap();
    store.commit().unwrap(); // v3 sealed

    // Hold v1 open: purge must not retire it.
    let pinned = store.read_handle("main.db", v(1)).unwrap();
    assert_eq!(store.pin_count(v(1)), 1);
    let stats = store
        .vacuum(VacuumScope::Purge, VacuumPolicy::Incremental)
        .unwrap();
    assert_eq!(stats.versions_dropped, 0);
    assert_eq!(read_page(&pinned, 0), content(1, 0));
    drop(pinned);

    // With the pin gone, history below the latest sealed version retires.
    let stats = store
        .vacuum(VacuumScope::Purge, VacuumPolicy::Incremental)
        .unwrap();
    assert_eq!(stats.versions_dropped, 2);
    assert_eq!(store.min_version(), v(3));

    // Retired versions are unknown now; the survivor still reads.
    assert!(matches!(
        store.read_handle("main.db", v(1)),
        Err(StrataError::VersionUnknown { version: 1 })
    ));
    let v3 = store.read_handle("main.db", v(3)).unwrap();
    assert_eq!(read_page(&v3, 0), content(3, 0));
}

#[test]
fn vacuum_reclaims_physical_space() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(
        dir.path(),
        StoreOptions {
            page_size: PageSize::new(512).unwrap(),
            segment_capacity: SegmentCapacity::new(8).unwrap(),
        },
    )
    .unwrap();
    let db = store.write_handle("main.db").unwrap();

    // Fill three segments' worth of pages, then delete them all before any
    // commit: every page is active-owned and reclaimable.
    for page in 0..24 {
        db.write(lp(page), 0, &content(1, page)).unwrap();
    }
    for page in 0..24 {
        db.delete(lp(page)).unwrap();
    }

    let stats = store
        .vacuum(VacuumScope::Active, VacuumPolicy::Full)
        .unwrap();
    assert_eq!(stats.pages_freed, 24);
    assert!(stats.segments_removed >= 2);
}

#[test]
fn store_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::create(dir.path(), options()).unwrap();
        let db = store.write_handle("main.db").unwrap();
        for page in 0..10 {
            db.write(lp(page), 0, &content(1, page)).unwrap();
        }
        store.commit().unwrap();
        for page in 0..5 {
            db.write(lp(page), 0, &content(2, page)).unwrap();
        }
        store.flush().unwrap();
    }

    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.active_version(), v(2));

    // Sealed snapshot intact across restart.
    let v1 = store.read_handle("main.db", v(1)).unwrap();
    for page in 0..10 {
        assert_eq!(read_page(&v1, page), content(1, page));
    }

    // Flushed active-version writes intact too.
    let db = store.write_handle("main.db").unwrap();
    let mut buf = vec![0u8; PAGE];
    db.read(lp(3), 0, &mut buf).unwrap();
    assert_eq!(buf, content(2, 3));
    db.read(lp(7), 0, &mut buf).unwrap();
    assert_eq!(buf, content(1, 7));
}
