//! Property test: sealed snapshots always match a pure in-memory model of
//! the write/delete/commit history, no matter how operations interleave.

use std::collections::HashMap;

use proptest::prelude::*;

use strata::{LogicalPageId, PageSize, SegmentCapacity, Store, StoreOptions, VersionId};

const PAGE: usize = 512;
const PAGE_RANGE: u32 = 8;

#[derive(Debug, Clone)]
enum Op {
    Write { page: u32, tag: u8 },
    Delete { page: u32 },
    Commit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..PAGE_RANGE, any::<u8>()).prop_map(|(page, tag)| Op::Write { page, tag }),
        2 => (0..PAGE_RANGE).prop_map(|page| Op::Delete { page }),
        1 => Just(Op::Commit),
    ]
}

fn fill(tag: u8) -> Vec<u8> {
    vec![tag; PAGE]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sealed_snapshots_match_the_model(ops in proptest::collection::vec(op_strategy(), 1..64)) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create(
            dir.path(),
            StoreOptions {
                page_size: PageSize::new(512).unwrap(),
                segment_capacity: SegmentCapacity::new(16).unwrap(),
            },
        )
        .unwrap();
        let db = store.write_handle("model.db").unwrap();

        // The model: cumulative page → tag map, snapshotted at each commit.
        let mut current: HashMap<u32, u8> = HashMap::new();
        let mut sealed: Vec<HashMap<u32, u8>> = Vec::new();

        for op in &ops {
            match *op {
                Op::Write { page, tag } => {
                    db.write(LogicalPageId::new(page), 0, &fill(tag)).unwrap();
                    current.insert(page, tag);
                }
                Op::Delete { page } => {
                    db.delete(LogicalPageId::new(page)).unwrap();
                    current.remove(&page);
                }
                Op::Commit => {
                    store.commit().unwrap();
                    sealed.push(current.clone());
                }
            }
        }

        // Every sealed version resolves exactly its model snapshot.
        for (index, model) in sealed.iter().enumerate() {
            let version = VersionId::new(u32::try_from(index).unwrap() + 1).unwrap();
            let handle = store.read_handle("model.db", version).unwrap();
            for page in 0..PAGE_RANGE {
                let mut buf = vec![0u8; PAGE];
                match model.get(&page) {
                    Some(&tag) => {
                        handle.read(LogicalPageId::new(page), 0, &mut buf).unwrap();
                        prop_assert_eq!(&buf, &fill(tag), "version {} page {}", version, page);
                    }
                    None => {
                        let result = handle.read(LogicalPageId::new(page), 0, &mut buf);
                        prop_assert!(
                            result.is_err(),
                            "version {} page {} should be unmapped",
                            version,
                            page
                        );
                    }
                }
            }
        }
    }
}
