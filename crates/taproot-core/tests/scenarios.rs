//! End-to-end container scenarios: fresh files, persistence across reopen,
//! split-heavy workloads, duplicate handling, and open-time validation.

use taproot_core::{
    BTree, Error, KeyPolicy, NaturalOrder, OpenFlags, TreeOptions, SIGNATURE_ANY,
};
use tempfile::tempdir;

fn opts128() -> TreeOptions {
    TreeOptions::new().page_size(128).cache_pages(16)
}

#[test]
fn test_empty_tree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
    assert_eq!(tree.size(), 0);
    assert!(tree.is_empty());
    assert!(tree.begin().unwrap().is_none());
    assert!(tree.find(&42).unwrap().is_none());
    assert_eq!(tree.iter().unwrap().count(), 0);
    tree.close().unwrap();
}

#[test]
fn test_single_insert_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        tree.insert(7, 70).unwrap();
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.find(&7).unwrap().unwrap().value(), 70);
        let items: Vec<(i32, i32)> = tree.iter().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(items, vec![(7, 70)]);
        tree.close().unwrap();
    }

    let tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
    assert_eq!(tree.size(), 1);
    let items: Vec<(i32, i32)> = tree.iter().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(items, vec![(7, 70)]);
}

#[test]
fn test_split_forcing_sequential_inserts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
    for k in 1..=100 {
        tree.insert(k, k).unwrap();
    }
    assert_eq!(tree.size(), 100);
    assert!(tree.root_level() >= 1, "128-byte pages must have split");
    let keys: Vec<i32> = tree.iter().unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(keys, (1..=100).collect::<Vec<_>>());
    tree.verify().unwrap();
}

#[test]
fn test_multi_duplicates_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let mut tree: BTree<i32, i32> = BTree::open_multimap(&path, opts128()).unwrap();
    tree.insert(5, 1).unwrap();
    tree.insert(5, 2).unwrap();
    tree.insert(5, 3).unwrap();

    let run: Vec<(i32, i32)> = tree.equal_range(&5).unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(run, vec![(5, 1), (5, 2), (5, 3)]);

    assert_eq!(tree.erase(&5).unwrap(), 3);
    assert!(tree.find(&5).unwrap().is_none());
    assert!(tree.is_empty());
}

#[test]
fn test_forward_and_backward_traversal_agree() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
    for k in [5, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
        tree.insert(k, k * 10).unwrap();
    }
    for extra in 100..160 {
        tree.insert(extra, 0).unwrap();
    }

    let forward: Vec<(i32, i32)> = tree.iter().unwrap().map(|r| r.unwrap()).collect();
    let mut backward: Vec<(i32, i32)> = tree.iter().unwrap().rev().map(|r| r.unwrap()).collect();
    backward.reverse();
    assert_eq!(forward, backward);

    // Cursor stepping agrees with the iterator.
    let mut walked = Vec::new();
    let mut cur = tree.begin().unwrap();
    while let Some(c) = cur {
        walked.push(c.entry());
        cur = c.next().unwrap();
    }
    assert_eq!(walked, forward);

    let mut walked_back = Vec::new();
    let mut cur = tree.last().unwrap();
    while let Some(c) = cur {
        walked_back.push(c.entry());
        cur = c.prev().unwrap();
    }
    walked_back.reverse();
    assert_eq!(walked_back, forward);
}

#[test]
fn test_erase_heavy_persistence_and_page_reuse() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        for k in 0..500 {
            tree.insert(k, k * 2).unwrap();
        }
        for k in (0..500).step_by(2) {
            assert_eq!(tree.erase(&k).unwrap(), 1);
        }
        tree.verify().unwrap();
        tree.close().unwrap();
    }

    let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
    assert_eq!(tree.size(), 250);
    tree.verify().unwrap();
    let keys: Vec<i32> = tree.iter().unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(keys, (0..500).filter(|k| k % 2 == 1).collect::<Vec<_>>());

    // Freed pages survive the reopen and are reused before the file grows.
    let before = std::fs::metadata(&path).unwrap().len();
    for k in (0..500).step_by(2) {
        tree.insert(k, k * 2).unwrap();
    }
    tree.verify().unwrap();
    let after = std::fs::metadata(&path).unwrap().len();
    assert_eq!(tree.size(), 500);
    assert!(
        after <= before + 16 * 128,
        "reinserting into freed pages should not regrow the file much: {before} -> {after}"
    );
}

#[test]
fn test_signature_checked_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let opts = opts128().signature(0xFEED_BEEF).flags(OpenFlags::TRUNCATE);
        let tree: BTree<i32, i32> = BTree::open_map(&path, opts).unwrap();
        tree.close().unwrap();
    }

    let wrong: Result<BTree<i32, i32>, _> =
        BTree::open_map(&path, opts128().signature(0xDEAD_BEEF));
    assert!(matches!(wrong, Err(Error::SignatureMismatch { .. })));

    let skipped: BTree<i32, i32> =
        BTree::open_map(&path, opts128().signature(SIGNATURE_ANY)).unwrap();
    assert_eq!(skipped.signature(), 0xFEED_BEEF);

    drop(skipped);
    let matching: BTree<i32, i32> =
        BTree::open_map(&path, opts128().signature(0xFEED_BEEF)).unwrap();
    assert_eq!(matching.size(), 0);
}

#[test]
fn test_schema_mismatch_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        tree.close().unwrap();
    }
    let wrong_key: Result<BTree<i64, i32>, _> = BTree::open_map(&path, opts128());
    assert!(matches!(wrong_key, Err(Error::SchemaMismatch(_))));
    let wrong_value: Result<BTree<i32, i64>, _> = BTree::open_map(&path, opts128());
    assert!(matches!(wrong_value, Err(Error::SchemaMismatch(_))));
}

#[test]
fn test_cache_minimum_enforced_at_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let too_small: Result<BTree<i32, i32>, _> =
        BTree::open_map(&path, opts128().cache_pages(1));
    assert!(matches!(
        too_small,
        Err(Error::CacheTooSmall {
            required: 2,
            configured: 1
        })
    ));

    // Grow a three-level tree, then reopen with a cache that cannot hold
    // even one descent path.
    {
        let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        for k in 0..2000 {
            tree.insert(k, k).unwrap();
        }
        assert!(tree.root_level() >= 2);
        tree.close().unwrap();
    }
    let reopened: Result<BTree<i32, i32>, _> =
        BTree::open_map(&path, opts128().cache_pages(2));
    assert!(matches!(reopened, Err(Error::CacheTooSmall { .. })));
}

#[test]
fn test_read_only_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        for k in 0..50 {
            tree.insert(k, -k).unwrap();
        }
        tree.close().unwrap();
    }

    let mut tree: BTree<i32, i32> =
        BTree::open_map(&path, opts128().flags(OpenFlags::READ_ONLY)).unwrap();
    assert_eq!(tree.size(), 50);
    assert_eq!(tree.get(&17).unwrap(), Some(-17));
    assert!(matches!(tree.insert(1, 1), Err(Error::Logic(_))));
    assert!(matches!(tree.erase(&1), Err(Error::Logic(_))));
}

#[test]
fn test_two_writers_excluded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let _first: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
    let second: Result<BTree<i32, i32>, _> = BTree::open_map(&path, opts128());
    assert!(matches!(second, Err(Error::FileLocked)));
}

#[test]
fn test_preload_flag() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        for k in 0..300 {
            tree.insert(k, k).unwrap();
        }
        tree.close().unwrap();
    }
    let tree: BTree<i32, i32> = BTree::open_map(
        &path,
        opts128().flags(OpenFlags::READ_WRITE | OpenFlags::PRELOAD),
    )
    .unwrap();
    assert_eq!(tree.size(), 300);
}

#[test]
fn test_truncate_discards_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts128()).unwrap();
        for k in 0..100 {
            tree.insert(k, k).unwrap();
        }
        tree.close().unwrap();
    }
    let tree: BTree<i32, i32> =
        BTree::open_map(&path, opts128().flags(OpenFlags::TRUNCATE)).unwrap();
    assert!(tree.is_empty());
    assert_eq!(tree.root_level(), 0);
}

#[test]
fn test_sets_store_keys_only() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    let mut set: BTree<i32, ()> = BTree::open_set(&path, opts128()).unwrap();
    for k in [3, 1, 4, 1, 5, 9, 2, 6] {
        set.insert(k, ()).unwrap();
    }
    assert_eq!(set.size(), 7);
    let keys: Vec<i32> = set.iter().unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 9]);
    set.close().unwrap();

    let mut multiset: BTree<i32, ()> = BTree::open_multiset(
        &dir.path().join("m.btr"),
        opts128(),
    )
    .unwrap();
    for k in [3, 1, 3, 3, 1] {
        multiset.insert(k, ()).unwrap();
    }
    assert_eq!(multiset.size(), 5);
    assert_eq!(multiset.erase(&3).unwrap(), 3);
}

#[test]
fn test_policy_recorded_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");

    {
        let tree: BTree<i32, i32> = BTree::open_multimap(&path, opts128()).unwrap();
        tree.close().unwrap();
    }
    let as_unique: Result<BTree<i32, i32>, _> = BTree::open(
        &path,
        opts128(),
        KeyPolicy::Unique,
        NaturalOrder,
    );
    assert!(matches!(as_unique, Err(Error::SchemaMismatch(_))));
}
