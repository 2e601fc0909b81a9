//! Host-engine-shaped flow through the VFS adaptor: connection parameters,
//! byte-offset I/O, journal lifecycle, and pinned read-only reopen.

use std::path::Path;

use strata::{FileKind, OpenParams, StrataVfs, SyncLevel, Vfs, VfsFile};

fn open_main(vfs: &StrataVfs, root: &Path, query: &str) -> strata::StrataFile {
    let params = OpenParams::from_query(query).unwrap();
    vfs.open(root, FileKind::MainDb, Some(&params)).unwrap()
}

#[test]
fn full_connection_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("app.db");
    let vfs = StrataVfs::new();

    // Read-write connection writes a few "database pages" through byte I/O.
    let mut main = open_main(&vfs, &root, "pagesz=4096&pps=64");
    let page0: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
    let page1 = vec![0x42u8; 4096];
    main.write(&page0, 0).unwrap();
    main.write(&page1, 4096).unwrap();

    // The host's journal appears, gets written, and is torn down.
    let journal_path = dir.path().join("app.db-journal");
    let mut journal = vfs.open(&journal_path, FileKind::Journal, None).unwrap();
    journal.write(&[0u8; 512], 0).unwrap();
    journal.sync(SyncLevel::Full).unwrap();
    assert!(vfs.access(&journal_path).unwrap());

    main.sync(SyncLevel::Normal).unwrap();
    vfs.delete(&journal_path).unwrap();
    assert!(!vfs.access(&journal_path).unwrap());

    // External commit: seal version 1.
    let store = vfs.store(&root).unwrap();
    let active = store.commit().unwrap();
    assert_eq!(active.get(), 2);
    assert_eq!(vfs.active_version(&root).unwrap(), active);

    // The writer keeps going on version 2.
    main.write(&vec![0x77u8; 4096], 4096).unwrap();
    main.sync(SyncLevel::Normal).unwrap();

    // A read-only connection pinned to version 1 sees the sealed bytes.
    let mut pinned = open_main(&vfs, &root, "pagesz=4096&pps=64&ver=1&mode=ro");
    assert_eq!(pinned.file_size().unwrap(), 2 * 4096);
    let mut buf = vec![0u8; 4096];
    pinned.read(&mut buf, 0).unwrap();
    assert_eq!(buf, page0);
    pinned.read(&mut buf, 4096).unwrap();
    assert_eq!(buf, page1);

    // The writer's view reflects the version-2 overwrite.
    main.read(&mut buf, 4096).unwrap();
    assert_eq!(buf, vec![0x77u8; 4096]);
}

#[test]
fn reopen_after_restart_resolves_sealed_versions() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("app.db");

    {
        let vfs = StrataVfs::new();
        let mut main = open_main(&vfs, &root, "pagesz=4096&pps=64");
        main.write(&vec![0x11u8; 4096], 0).unwrap();
        main.sync(SyncLevel::Normal).unwrap();
        vfs.store(&root).unwrap().commit().unwrap();
    }

    // A fresh VFS (new process, effectively) pins the sealed version.
    let vfs = StrataVfs::new();
    let mut pinned = open_main(&vfs, &root, "pagesz=4096&pps=64&ver=1&mode=ro");
    let mut buf = vec![0u8; 4096];
    assert_eq!(pinned.read(&mut buf, 0).unwrap(), 4096);
    assert_eq!(buf, vec![0x11u8; 4096]);
}
