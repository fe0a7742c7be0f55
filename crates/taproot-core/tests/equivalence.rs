//! Randomized equivalence against the standard library's ordered maps:
//! the same operation stream must produce the same sizes, the same
//! outcomes, and the same traversals.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use taproot_core::{BTree, TreeOptions};
use tempfile::tempdir;

const SEED: u64 = 0x5EED_0001;
const OPS_PER_BATCH: usize = 1_000;
const BATCHES: usize = 10;
const KEY_RANGE: i32 = 20_000;

fn opts() -> TreeOptions {
    TreeOptions::new().page_size(128).cache_pages(16)
}

#[test]
fn test_unique_tree_matches_std_map() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.btr");
    let mut tree: BTree<i32, i32> = BTree::open_map(&path, opts()).unwrap();
    let mut model: BTreeMap<i32, i32> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(SEED);

    for batch in 0..BATCHES {
        for _ in 0..OPS_PER_BATCH {
            let k = rng.gen_range(0..KEY_RANGE);
            if rng.gen_bool(0.6) {
                let v = rng.gen_range(-1_000_000..1_000_000);
                let fresh = !model.contains_key(&k);
                let (_, inserted) = tree.insert(k, v).unwrap();
                assert_eq!(inserted, fresh, "insert({k}) disagreed with the model");
                if fresh {
                    model.insert(k, v);
                }
            } else {
                let removed = tree.erase(&k).unwrap();
                let expected = u64::from(model.remove(&k).is_some());
                assert_eq!(removed, expected, "erase({k}) disagreed with the model");
            }
            assert_eq!(tree.size(), model.len() as u64);
        }

        let got: Vec<(i32, i32)> = tree.iter().unwrap().map(|r| r.unwrap()).collect();
        let want: Vec<(i32, i32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
        assert_eq!(got, want, "forward traversal diverged in batch {batch}");

        let mut got_back: Vec<(i32, i32)> =
            tree.iter().unwrap().rev().map(|r| r.unwrap()).collect();
        got_back.reverse();
        assert_eq!(got_back, want, "backward traversal diverged in batch {batch}");

        tree.verify().unwrap();
    }

    // Contents survive a close and reopen byte-for-byte.
    tree.close().unwrap();
    let tree: BTree<i32, i32> = BTree::open_map(&path, opts()).unwrap();
    let got: Vec<(i32, i32)> = tree.iter().unwrap().map(|r| r.unwrap()).collect();
    let want: Vec<(i32, i32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
    assert_eq!(got, want);
    tree.verify().unwrap();
}

#[test]
fn test_bounds_match_std_map() {
    let dir = tempdir().unwrap();
    let mut tree: BTree<i32, i32> =
        BTree::open_map(&dir.path().join("t.btr"), opts()).unwrap();
    let mut model: BTreeMap<i32, i32> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(SEED ^ 0xB0DD);

    for _ in 0..2_000 {
        let k = rng.gen_range(0..1_000);
        tree.insert(k, k).unwrap();
        model.insert(k, k);
    }
    for _ in 0..2_000 {
        let probe = rng.gen_range(-10..1_010);
        let lb = tree.lower_bound(&probe).unwrap().map(|c| c.key());
        let want_lb = model.range(probe..).next().map(|(&k, _)| k);
        assert_eq!(lb, want_lb, "lower_bound({probe})");

        let ub = tree.upper_bound(&probe).unwrap().map(|c| c.key());
        let want_ub = model.range(probe + 1..).next().map(|(&k, _)| k);
        assert_eq!(ub, want_ub, "upper_bound({probe})");
    }
}

#[test]
fn test_multi_tree_matches_multimap_model() {
    let dir = tempdir().unwrap();
    let mut tree: BTree<i32, i32> =
        BTree::open_multimap(&dir.path().join("t.btr"), opts()).unwrap();
    // Values carry an insertion stamp so stability is visible.
    let mut model: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(SEED ^ 0x0517);

    let mut stamp = 0;
    for _ in 0..5_000 {
        let k = rng.gen_range(0..500);
        if rng.gen_bool(0.7) {
            tree.insert(k, stamp).unwrap();
            model.entry(k).or_default().push(stamp);
            stamp += 1;
        } else {
            let removed = tree.erase(&k).unwrap();
            let expected = model.remove(&k).map_or(0, |v| v.len() as u64);
            assert_eq!(removed, expected, "erase({k})");
        }
        let model_len: usize = model.values().map(Vec::len).sum();
        assert_eq!(tree.size(), model_len as u64);
    }

    let got: Vec<(i32, i32)> = tree.iter().unwrap().map(|r| r.unwrap()).collect();
    let want: Vec<(i32, i32)> = model
        .iter()
        .flat_map(|(&k, vs)| vs.iter().map(move |&v| (k, v)))
        .collect();
    assert_eq!(got, want, "multi traversal must keep insertion order per key");
    tree.verify().unwrap();

    // equal_range agrees with the per-key model.
    for (&k, vs) in &model {
        let run: Vec<i32> = tree.equal_range(&k).unwrap().map(|r| r.unwrap().1).collect();
        assert_eq!(&run, vs, "equal_range({k})");
    }
}
