//! Bulk loading: external merge-sort of a flat record file followed by
//! ordered insertion into a freshly created tree.
//!
//! The source file holds packed `key ‖ value` records. Distribution reads
//! it in memory-budget-sized chunks, stable-sorts each chunk under the
//! tree's comparator, and writes one temporary file per chunk. The merge
//! phase then repeatedly inserts the smallest current record across all
//! temporary files, breaking ties by file index so equal keys keep their
//! source order.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::storage::file::BinaryFile;
use crate::types::{KeyOrder, OpenFlags, Record};

/// Outcome of a bulk load. On a unique tree `inserted` may trail
/// `insert_calls` when the source holds duplicate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkLoadReport {
    pub records_read: u64,
    pub insert_calls: u64,
    pub inserted: u64,
    pub temp_files: usize,
}

/// One temporary run during the merge phase.
struct Run {
    reader: BufReader<File>,
    /// Records still unread in the file (the current record excluded).
    unread: u64,
    current: Vec<u8>,
}

impl Run {
    fn open(path: &Path, records: u64, record_size: usize) -> Result<Self> {
        let mut run = Self {
            reader: BufReader::new(File::open(path)?),
            unread: records,
            current: vec![0u8; record_size],
        };
        let loaded = run.advance()?;
        debug_assert!(loaded, "temporary runs are never empty");
        Ok(run)
    }

    fn advance(&mut self) -> Result<bool> {
        if self.unread == 0 {
            return Ok(false);
        }
        self.reader.read_exact(&mut self.current)?;
        self.unread -= 1;
        Ok(true)
    }
}

/// Load `source` into `tree` through an external merge-sort using at most
/// `max_memory` bytes of record buffer and temporary files under
/// `temp_dir`. Progress is logged every `log_every` insert calls (0
/// disables it).
pub fn bulk_load<K, V, C>(
    source: &Path,
    tree: &mut BTree<K, V, C>,
    temp_dir: &Path,
    max_memory: usize,
    log_every: u64,
) -> Result<BulkLoadReport>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    let record_size = K::SIZE + V::SIZE;
    let infile = BinaryFile::open(source, OpenFlags::READ_ONLY)?;
    let file_size = infile.len()?;
    if file_size % record_size as u64 != 0 {
        return Err(Error::Format(format!(
            "{} length {file_size} is not a multiple of the {record_size}-byte record",
            source.display()
        )));
    }
    let total_records = file_size / record_size as u64;
    let per_file = max_memory / record_size;
    if per_file == 0 {
        return Err(Error::Logic(format!(
            "memory budget {max_memory} is below one {record_size}-byte record"
        )));
    }

    // Distribution: sorted runs of at most `per_file` records each.
    let mut runs: Vec<(PathBuf, u64)> = Vec::new();
    let chunk_cap = per_file.min(total_records.max(1) as usize);
    let mut chunk = vec![0u8; chunk_cap * record_size];
    let mut done = 0u64;
    while done < total_records {
        let take = ((total_records - done) as usize).min(per_file);
        let bytes = take * record_size;
        infile.read_at(done * record_size as u64, &mut chunk[..bytes])?;

        // Stable sort of record indices under the tree comparator.
        let mut order: Vec<usize> = (0..take).collect();
        order.sort_by(|&a, &b| {
            let ka = K::read_from_bytes(&chunk[a * record_size..a * record_size + K::SIZE]).unwrap();
            let kb = K::read_from_bytes(&chunk[b * record_size..b * record_size + K::SIZE]).unwrap();
            tree.cmp.cmp(&ka, &kb)
        });

        let run_path = temp_dir.join(format!("chunk{}.tmp", runs.len()));
        let mut sorted = Vec::with_capacity(bytes);
        for &i in &order {
            sorted.extend_from_slice(&chunk[i * record_size..(i + 1) * record_size]);
        }
        let out = BinaryFile::open(&run_path, OpenFlags::TRUNCATE)?;
        out.write_at(0, &sorted)?;
        debug!(run = runs.len(), records = take, "distributed sorted run");
        runs.push((run_path, take as u64));
        done += take as u64;
    }
    let temp_files = runs.len();

    // Merge: insert the minimum current record until every run drains.
    // A linear min scan that keeps the first (lowest-index) minimum makes
    // the merge stable across runs.
    let mut active: Vec<Run> = runs
        .iter()
        .map(|(path, records)| Run::open(path, *records, record_size))
        .collect::<Result<_>>()?;

    let mut insert_calls = 0u64;
    let mut inserted = 0u64;
    while !active.is_empty() {
        let mut min_i = 0;
        for i in 1..active.len() {
            let ki = K::read_from_bytes(&active[i].current[..K::SIZE]).unwrap();
            let km = K::read_from_bytes(&active[min_i].current[..K::SIZE]).unwrap();
            if tree.cmp.cmp(&ki, &km) == Ordering::Less {
                min_i = i;
            }
        }
        let key = K::read_from_bytes(&active[min_i].current[..K::SIZE]).unwrap();
        let value = V::read_from_bytes(&active[min_i].current[K::SIZE..]).unwrap();
        let (_, fresh) = tree.insert(key, value)?;
        insert_calls += 1;
        if fresh {
            inserted += 1;
        }
        if log_every != 0 && insert_calls % log_every == 0 {
            info!(
                insert_calls,
                inserted,
                active_runs = active.len(),
                "bulk load progress"
            );
        }
        if !active[min_i].advance()? {
            active.remove(min_i);
        }
    }

    assert_eq!(
        insert_calls, total_records,
        "merge phase lost records: {insert_calls} of {total_records}"
    );

    for (path, _) in &runs {
        let _ = std::fs::remove_file(path);
    }

    info!(
        records = total_records,
        inserted,
        temp_files,
        "bulk load complete"
    );
    Ok(BulkLoadReport {
        records_read: total_records,
        insert_calls,
        inserted,
        temp_files,
    })
}

/// Serialize `(key, value)` pairs into the packed record format the loader
/// reads. A test and tooling convenience.
pub fn write_records<K, V>(path: &Path, pairs: &[(K, V)]) -> Result<()>
where
    K: Record,
    V: Record,
{
    let record_size = K::SIZE + V::SIZE;
    let mut bytes = Vec::with_capacity(pairs.len() * record_size);
    for (k, v) in pairs {
        bytes.extend_from_slice(k.as_bytes());
        bytes.extend_from_slice(v.as_bytes());
    }
    let out = BinaryFile::open(path, OpenFlags::TRUNCATE)?;
    out.write_at(0, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TreeOptions;
    use tempfile::tempdir;

    fn opts() -> TreeOptions {
        TreeOptions::new().page_size(128).cache_pages(16)
    }

    #[test]
    fn test_bulk_load_multiple_runs() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("input.dat");
        // Reverse order forces real merge work.
        let pairs: Vec<(i32, i32)> = (0..1000).rev().map(|k| (k, k * 3)).collect();
        write_records(&source, &pairs).unwrap();

        let mut tree = BTree::open_map(&dir.path().join("t.btr"), opts()).unwrap();
        // 100 records per run -> 10 temporary files.
        let report =
            bulk_load(&source, &mut tree, dir.path(), 100 * 8, 0).unwrap();

        assert_eq!(report.records_read, 1000);
        assert_eq!(report.insert_calls, 1000);
        assert_eq!(report.inserted, 1000);
        assert_eq!(report.temp_files, 10);
        assert_eq!(tree.size(), 1000);
        tree.verify().unwrap();
        for k in 0..1000 {
            assert_eq!(tree.get(&k).unwrap(), Some(k * 3));
        }
        // Temporary files are removed.
        assert!(!dir.path().join("chunk0.tmp").exists());
    }

    #[test]
    fn test_bulk_load_preserves_duplicate_order() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("input.dat");
        // Key 5 appears in several chunks; values record source order.
        let mut pairs: Vec<(i32, i32)> = Vec::new();
        for v in 0..30 {
            pairs.push((5, v));
            pairs.push((v, 0));
        }
        write_records(&source, &pairs).unwrap();

        let mut tree = BTree::open_multimap(&dir.path().join("t.btr"), opts()).unwrap();
        bulk_load(&source, &mut tree, dir.path(), 10 * 8, 0).unwrap();

        let run: Vec<i32> = tree
            .equal_range(&5)
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        // One (5, 0) also comes from the `(v, 0)` stream.
        assert_eq!(run.len(), 31);
        let from_dups: Vec<i32> = run.iter().copied().filter(|&v| v != 0).collect();
        assert_eq!(from_dups, (1..30).collect::<Vec<_>>());
    }

    #[test]
    fn test_bulk_load_rejects_partial_record() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("input.dat");
        std::fs::write(&source, [0u8; 13]).unwrap();

        let mut tree: BTree<i32, i32> = BTree::open_map(&dir.path().join("t.btr"), opts()).unwrap();
        let result = bulk_load(&source, &mut tree, dir.path(), 1024, 0);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_bulk_load_empty_source() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("input.dat");
        std::fs::write(&source, []).unwrap();

        let mut tree: BTree<i32, i32> = BTree::open_map(&dir.path().join("t.btr"), opts()).unwrap();
        let report = bulk_load(&source, &mut tree, dir.path(), 1024, 0).unwrap();
        assert_eq!(report.records_read, 0);
        assert_eq!(report.temp_files, 0);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_bulk_load_unique_counts_duplicates() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("input.dat");
        let pairs: Vec<(i32, i32)> = vec![(1, 10), (2, 20), (1, 11), (3, 30), (2, 21)];
        write_records(&source, &pairs).unwrap();

        let mut tree = BTree::open_map(&dir.path().join("t.btr"), opts()).unwrap();
        let report = bulk_load(&source, &mut tree, dir.path(), 2 * 8, 0).unwrap();
        assert_eq!(report.insert_calls, 5);
        assert_eq!(report.inserted, 3);
        assert_eq!(tree.size(), 3);
        // First occurrence wins on a unique tree.
        assert_eq!(tree.get(&1).unwrap(), Some(10));
        assert_eq!(tree.get(&2).unwrap(), Some(20));
    }
}
