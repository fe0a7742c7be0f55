//! Secondary indexing: fixed-size records in an append-only flat file, plus
//! B+ trees that store only byte positions into it. A position tree's
//! comparator dereferences the flat file, so one file may carry several
//! indices that differ only in how they order records.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::debug;

use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::storage::file::BinaryFile;
use crate::storage::lock::FileLock;
use crate::types::{FilePos, KeyOrder, KeyPolicy, OpenFlags, Record, TreeOptions};

/// Strict weak ordering over flat-file records, usually comparing a key
/// projection of the record rather than all of it.
pub trait RecordOrder<R> {
    fn cmp(&self, a: &R, b: &R) -> Ordering;
}

/// The `Ord`-derived record ordering.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalRecordOrder;

impl<R: Ord> RecordOrder<R> for NaturalRecordOrder {
    fn cmp(&self, a: &R, b: &R) -> Ordering {
        a.cmp(b)
    }
}

struct FlatInner {
    map: Option<Mmap>,
    /// Physical file length; at least `logical`, usually padded out to the
    /// reserve so the mapping survives appends without remapping.
    physical: u64,
    /// Bytes of real record data.
    logical: u64,
}

/// An append-only file of fixed-size records, readable by position.
///
/// Reads go through a shared memory mapping so the position-tree
/// comparators can dereference records infallibly; appends go through
/// `pwrite`, which the mapping observes. The file is padded to a caller
/// reserve while open and trimmed back to its logical size on close (or,
/// best-effort, on drop). One writer at a time per file, enforced with the
/// same advisory locks the trees use.
pub struct FlatFile {
    file: BinaryFile,
    record_size: usize,
    writable: bool,
    closed: bool,
    inner: Mutex<FlatInner>,
    path: PathBuf,
    _lock: FileLock,
}

impl FlatFile {
    /// Open or create a record file. `reserve` is the initial physical
    /// size in bytes; growing past it remaps, so a generous reserve keeps
    /// appends cheap.
    pub fn open(path: &Path, flags: OpenFlags, record_size: usize, reserve: u64) -> Result<Self> {
        if record_size == 0 {
            return Err(Error::Logic("zero-size records are not supported".to_string()));
        }
        let writable = flags.writable();
        let lock = if writable {
            FileLock::exclusive(path)?
        } else {
            FileLock::shared(path)?
        };
        let file = BinaryFile::open(path, flags)?;
        let logical = file.len()?;
        if logical % record_size as u64 != 0 {
            return Err(Error::Format(format!(
                "{} length {logical} is not a multiple of the {record_size}-byte record",
                path.display()
            )));
        }

        let mut physical = logical;
        if writable && physical < reserve {
            file.set_len(reserve)?;
            physical = reserve;
        }
        let map = if physical > 0 {
            // SAFETY: the mapping is read-only; writers append through the
            // same descriptor at offsets the readers only reach after the
            // logical length has been advanced past them.
            Some(unsafe { Mmap::map(file.handle())? })
        } else {
            None
        };

        Ok(Self {
            file,
            record_size,
            writable,
            closed: false,
            inner: Mutex::new(FlatInner {
                map,
                physical,
                logical,
            }),
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Bytes of record data (not the padded physical length).
    pub fn size(&self) -> u64 {
        self.inner.lock().logical
    }

    pub fn record_count(&self) -> u64 {
        self.size() / self.record_size as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, returning its position.
    pub fn push_back(&self, record: &[u8]) -> Result<FilePos> {
        debug_assert_eq!(record.len(), self.record_size);
        if !self.writable {
            return Err(Error::Logic("append to a read-only record file".to_string()));
        }
        let mut inner = self.inner.lock();
        let pos = inner.logical;
        let end = pos + self.record_size as u64;
        if end > inner.physical {
            let grown = (inner.physical * 2).max(end);
            inner.map = None;
            self.file.set_len(grown)?;
            // SAFETY: as in `open`.
            inner.map = Some(unsafe { Mmap::map(self.file.handle())? });
            inner.physical = grown;
        }
        self.file.write_at(pos, record)?;
        inner.logical = end;
        Ok(pos)
    }

    /// Copy the record at `pos` into `out`.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is not a record boundary inside the file. Positions
    /// only enter an index through [`Self::push_back`], so a bad position
    /// means a corrupted index tree.
    pub fn read_into(&self, pos: FilePos, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.record_size);
        let inner = self.inner.lock();
        assert!(
            pos % self.record_size as u64 == 0 && pos + self.record_size as u64 <= inner.logical,
            "position {pos} is not a stored record"
        );
        let map = inner.map.as_ref().expect("record file has data but no mapping");
        let start = pos as usize;
        out.copy_from_slice(&map[start..start + self.record_size]);
    }

    /// Decode the record at `pos`.
    ///
    /// # Panics
    ///
    /// Panics on positions that are not stored records, as
    /// [`Self::read_into`] does.
    pub fn get<R: Record>(&self, pos: FilePos) -> R {
        debug_assert_eq!(R::SIZE, self.record_size);
        let inner = self.inner.lock();
        assert!(
            pos % self.record_size as u64 == 0 && pos + self.record_size as u64 <= inner.logical,
            "position {pos} is not a stored record"
        );
        let map = inner.map.as_ref().expect("record file has data but no mapping");
        let start = pos as usize;
        R::read_from_bytes(&map[start..start + self.record_size]).unwrap()
    }

    /// Flush appended records and trim the padding back to the logical
    /// length. Errors after this point cannot be reported; prefer `close`
    /// over relying on drop.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.writable {
            let mut inner = self.inner.lock();
            inner.map = None;
            self.file.set_len(inner.logical)?;
            self.file.sync()?;
            debug!(path = %self.path.display(), bytes = inner.logical, "closed record file");
        }
        Ok(())
    }
}

impl Drop for FlatFile {
    fn drop(&mut self) {
        if self.closed || !self.writable {
            return;
        }
        // Destruction must not fail; trim the reserve padding on a
        // best-effort basis so the next open does not mistake it for
        // zeroed records.
        let mut inner = self.inner.lock();
        inner.map = None;
        let _ = self.file.set_len(inner.logical);
        let _ = self.file.sync();
    }
}

/// Orders stored positions by the records they refer to.
pub struct PositionOrder<R, O> {
    file: Arc<FlatFile>,
    order: O,
    _marker: PhantomData<R>,
}

impl<R, O> KeyOrder<FilePos> for PositionOrder<R, O>
where
    R: Record,
    O: RecordOrder<R>,
{
    fn cmp(&self, a: &FilePos, b: &FilePos) -> Ordering {
        self.order.cmp(&self.file.get::<R>(*a), &self.file.get::<R>(*b))
    }
}

/// A B+ tree over positions in a shared [`FlatFile`], ordered by `O`.
///
/// Search probes are full records; the tree is consulted through ordering
/// closures that read stored records out of the flat file.
pub struct RecordIndex<R, O>
where
    R: Record,
    O: RecordOrder<R> + Clone,
{
    file: Arc<FlatFile>,
    tree: BTree<FilePos, (), PositionOrder<R, O>>,
    order: O,
}

impl<R, O> RecordIndex<R, O>
where
    R: Record,
    O: RecordOrder<R> + Clone,
{
    /// Open an index tree at `index_path` over the given record file.
    /// Records that compare equal under `O` are allowed; they keep
    /// insertion order.
    pub fn open(
        file: Arc<FlatFile>,
        index_path: &Path,
        options: TreeOptions,
        order: O,
    ) -> Result<Self> {
        if file.record_size() != R::SIZE {
            return Err(Error::SchemaMismatch(format!(
                "record file stores {}-byte records, index expects {}",
                file.record_size(),
                R::SIZE
            )));
        }
        let cmp = PositionOrder {
            file: Arc::clone(&file),
            order: order.clone(),
            _marker: PhantomData,
        };
        let tree = BTree::open(index_path, options, KeyPolicy::Multi, cmp)?;
        Ok(Self { file, tree, order })
    }

    pub fn file(&self) -> &Arc<FlatFile> {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Append a record to the flat file without indexing it yet.
    pub fn push_back(&self, record: &R) -> Result<FilePos> {
        self.file.push_back(record.as_bytes())
    }

    /// Index a previously appended record.
    pub fn insert_position(&mut self, pos: FilePos) -> Result<()> {
        self.tree.insert(pos, ())?;
        Ok(())
    }

    /// Position of the first record equal to `probe` under the index
    /// ordering.
    pub fn find(&self, probe: &R) -> Result<Option<FilePos>> {
        match self.lower_bound(probe)? {
            Some(pos) if self.order.cmp(&self.file.get::<R>(pos), probe) == Ordering::Equal => {
                Ok(Some(pos))
            }
            _ => Ok(None),
        }
    }

    pub fn contains(&self, probe: &R) -> Result<bool> {
        Ok(self.find(probe)?.is_some())
    }

    /// Position of the first record not ordered before `probe`.
    pub fn lower_bound(&self, probe: &R) -> Result<Option<FilePos>> {
        let file = &self.file;
        let order = &self.order;
        let cur = self
            .tree
            .lower_bound_by(|pos| order.cmp(&file.get::<R>(*pos), probe))?;
        Ok(cur.map(|c| c.key()))
    }

    /// Position of the first record ordered after `probe`.
    pub fn upper_bound(&self, probe: &R) -> Result<Option<FilePos>> {
        let file = &self.file;
        let order = &self.order;
        let cur = self
            .tree
            .upper_bound_by(|pos| order.cmp(&file.get::<R>(*pos), probe))?;
        Ok(cur.map(|c| c.key()))
    }

    /// Records in index order.
    pub fn iter(&self) -> Result<impl Iterator<Item = Result<R>> + '_> {
        let positions = self.tree.iter()?;
        let file = Arc::clone(&self.file);
        Ok(positions.map(move |item| item.map(|(pos, ())| file.get::<R>(pos))))
    }

    /// Flush the index tree. The flat file is shared and closed separately.
    pub fn close(self) -> Result<()> {
        self.tree.close()
    }
}
