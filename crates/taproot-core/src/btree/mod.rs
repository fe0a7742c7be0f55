//! Disk-resident B+ tree containers: unique-key and multi-key maps (and
//! their set counterparts via `V = ()`) over a single paged file.

pub mod iter;
pub mod node;
mod ops;

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::file::BinaryFile;
use crate::storage::header::FileHeader;
use crate::storage::lock::FileLock;
use crate::storage::page::{node_count, node_level, node_next, node_prev};
use crate::storage::pager::{Intent, PageGuard, Pager};
use crate::types::{
    KeyOrder, KeyPolicy, NaturalOrder, PageId, Record, TreeOptions, MIN_PAGE_SIZE, OpenFlags,
    SIGNATURE_ANY,
};

pub use self::iter::{Cursor, EntryRef, Iter, Range};
use self::node::{search_slots, Layout};

/// Distinguishes trees within one process so that an [`EntryRef`] cannot be
/// replayed against a different open tree.
static NEXT_TREE_NONCE: AtomicU64 = AtomicU64::new(1);

/// An ordered associative container backed by a paged file.
///
/// `K` and `V` must be [`Record`] types (fixed size, no indirection); the
/// set variants use `V = ()`. The comparator `C` must order keys the same
/// way on every open of the same file.
pub struct BTree<K, V, C = NaturalOrder> {
    pub(crate) pager: Pager,
    pub(crate) header: FileHeader,
    pub(crate) layout: Layout,
    pub(crate) cmp: C,
    pub(crate) nonce: u64,
    writable: bool,
    closed: bool,
    path: PathBuf,
    _lock: FileLock,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> BTree<K, V, NaturalOrder>
where
    K: Record + Ord,
    V: Record,
{
    /// Open (or create) a unique-key map ordered by `K: Ord`.
    pub fn open_map(path: &Path, options: TreeOptions) -> Result<Self> {
        Self::open(path, options, KeyPolicy::Unique, NaturalOrder)
    }

    /// Open (or create) a multi-key map ordered by `K: Ord`.
    pub fn open_multimap(path: &Path, options: TreeOptions) -> Result<Self> {
        Self::open(path, options, KeyPolicy::Multi, NaturalOrder)
    }
}

impl<K> BTree<K, (), NaturalOrder>
where
    K: Record + Ord,
{
    /// Open (or create) a unique-key set ordered by `K: Ord`.
    pub fn open_set(path: &Path, options: TreeOptions) -> Result<Self> {
        Self::open(path, options, KeyPolicy::Unique, NaturalOrder)
    }

    /// Open (or create) a multi-key set ordered by `K: Ord`.
    pub fn open_multiset(path: &Path, options: TreeOptions) -> Result<Self> {
        Self::open(path, options, KeyPolicy::Multi, NaturalOrder)
    }
}

impl<K, V, C> BTree<K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    /// Open an existing tree file or create a fresh one, depending on the
    /// flags in `options`.
    ///
    /// On reopen the stored key/value sizes must match `K`/`V`, the stored
    /// policy must match `policy`, and the stored signature must match
    /// `options.signature` unless the caller passes [`SIGNATURE_ANY`].
    /// `options.page_size` applies only at creation.
    pub fn open(path: &Path, options: TreeOptions, policy: KeyPolicy, cmp: C) -> Result<Self> {
        options.validate()?;
        let writable = options.flags.writable();

        let lock = if writable {
            FileLock::exclusive(path)?
        } else {
            FileLock::shared(path)?
        };

        let file = BinaryFile::open(path, options.flags)?;
        let fresh = options.flags.contains(OpenFlags::TRUNCATE) || file.is_empty()?;
        if fresh && !writable {
            return Err(Error::Logic(
                "cannot create a tree through a read-only open".to_string(),
            ));
        }

        let header = if fresh {
            let signature = if options.signature == SIGNATURE_ANY {
                0
            } else {
                options.signature
            };
            FileHeader::new(
                signature,
                options.page_size,
                K::SIZE as u32,
                V::SIZE as u32,
                policy,
            )
        } else {
            // The header fits well inside the smallest legal page.
            let mut buf = vec![0u8; MIN_PAGE_SIZE as usize];
            file.read_at(0, &mut buf)?;
            let header = FileHeader::from_page(&buf)?;
            if header.key_size != K::SIZE as u32 || header.value_size != V::SIZE as u32 {
                return Err(Error::SchemaMismatch(format!(
                    "file stores {}-byte keys and {}-byte values, opened with \
                     {}-byte keys and {}-byte values",
                    header.key_size,
                    header.value_size,
                    K::SIZE,
                    V::SIZE
                )));
            }
            if header.policy != policy {
                return Err(Error::SchemaMismatch(format!(
                    "file stores a {:?} tree, opened as {:?}",
                    header.policy, policy
                )));
            }
            if options.signature != SIGNATURE_ANY && options.signature != header.signature {
                return Err(Error::SignatureMismatch {
                    expected: options.signature,
                    found: header.signature,
                });
            }
            header
        };

        let required = header.root_level as usize + 2;
        if options.cache_pages < required {
            return Err(Error::CacheTooSmall {
                required,
                configured: options.cache_pages,
            });
        }

        let layout = Layout::new(header.page_size as usize, K::SIZE, V::SIZE)?;

        let pager = if fresh {
            // Only the header page exists; the root leaf is allocated below.
            Pager::new(
                file,
                header.page_size as usize,
                options.cache_pages,
                0,
                1,
                writable,
            )
        } else {
            Pager::new(
                file,
                header.page_size as usize,
                options.cache_pages,
                header.free_list_head,
                header.page_count,
                writable,
            )
        };

        if fresh {
            let root = pager.allocate(0)?;
            debug_assert_eq!(root.page_id(), header.root_page_id);
        }

        if options.flags.contains(OpenFlags::PRELOAD) {
            pager.file().preload(header.page_size as usize)?;
        }

        debug!(
            path = %path.display(),
            pages = pager.page_count(),
            elements = header.element_count,
            fresh,
            "opened tree"
        );

        let mut tree = Self {
            pager,
            header,
            layout,
            cmp,
            nonce: NEXT_TREE_NONCE.fetch_add(1, AtomicOrdering::Relaxed),
            writable,
            closed: false,
            path: path.to_path_buf(),
            _lock: lock,
            _marker: PhantomData,
        };
        if fresh {
            tree.flush()?;
        }
        Ok(tree)
    }

    // -- metadata ---------------------------------------------------------

    pub fn size(&self) -> u64 {
        self.header.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.element_count == 0
    }

    pub fn is_unique(&self) -> bool {
        self.header.policy == KeyPolicy::Unique
    }

    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }

    /// Height of the tree above the leaves; 0 means the root is a leaf.
    pub fn root_level(&self) -> u16 {
        self.header.root_level
    }

    pub fn signature(&self) -> u64 {
        self.header.signature
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- lifecycle --------------------------------------------------------

    /// Write all dirty pages and the header back to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.header.free_list_head = self.pager.free_head();
        self.header.page_count = self.pager.page_count();
        let mut buf = vec![0u8; self.header.page_size as usize];
        self.header.write_to(&mut buf);
        self.pager.flush_with_header(&buf)
    }

    /// Flush, sync, and release the tree. Errors after this point cannot be
    /// reported; prefer `close` over relying on drop.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        if self.writable {
            self.flush()?;
            self.pager.sync()?;
        }
        debug!(path = %self.path.display(), elements = self.header.element_count, "closed tree");
        Ok(())
    }

    // -- search -----------------------------------------------------------

    /// Cursor to the first element equal to `key`, if any.
    pub fn find(&self, key: &K) -> Result<Option<Cursor<'_, K, V, C>>> {
        match self.lower_bound(key)? {
            Some(cur) if self.cmp.cmp(&cur.key(), key) == Ordering::Equal => Ok(Some(cur)),
            _ => Ok(None),
        }
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Value of the first element equal to `key`, if any.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.find(key)?.map(|cur| cur.value()))
    }

    /// Cursor to the first element not ordered before `key`.
    pub fn lower_bound(&self, key: &K) -> Result<Option<Cursor<'_, K, V, C>>> {
        self.lower_bound_by(|stored| self.cmp.cmp(stored, key))
    }

    /// Cursor to the first element ordered after `key`.
    pub fn upper_bound(&self, key: &K) -> Result<Option<Cursor<'_, K, V, C>>> {
        self.upper_bound_by(|stored| self.cmp.cmp(stored, key))
    }

    /// `lower_bound` against an arbitrary probe: `ord` reports how a stored
    /// key orders relative to the probe. Used by the secondary index, whose
    /// probes are records rather than stored positions.
    pub fn lower_bound_by(
        &self,
        ord: impl Fn(&K) -> Ordering,
    ) -> Result<Option<Cursor<'_, K, V, C>>> {
        let mut byte_ord = |bytes: &[u8]| ord(&Self::decode_key(bytes));
        let guard = self.descend(&mut byte_ord, false, None, Intent::Read)?;
        let slot = {
            let buf = guard.bytes();
            search_slots(node_count(&buf), false, |i| {
                byte_ord(self.layout.leaf_key(&buf, i))
            })
        };
        self.cursor_at(guard, slot)
    }

    /// `upper_bound` against an arbitrary probe; see [`Self::lower_bound_by`].
    pub fn upper_bound_by(
        &self,
        ord: impl Fn(&K) -> Ordering,
    ) -> Result<Option<Cursor<'_, K, V, C>>> {
        let mut byte_ord = |bytes: &[u8]| ord(&Self::decode_key(bytes));
        let guard = self.descend(&mut byte_ord, true, None, Intent::Read)?;
        let slot = {
            let buf = guard.bytes();
            search_slots(node_count(&buf), true, |i| {
                byte_ord(self.layout.leaf_key(&buf, i))
            })
        };
        self.cursor_at(guard, slot)
    }

    /// Iterator over every element equal to `key`, in insertion order for
    /// multi trees.
    pub fn equal_range(&self, key: &K) -> Result<Range<'_, K, V, C>> {
        let end = match self.upper_bound(key)? {
            Some(cur) => Some(cur.position()),
            None => None,
        };
        let front = self.lower_bound(key)?;
        Ok(Range::new(self, front, end))
    }

    /// Cursor to the smallest element.
    pub fn begin(&self) -> Result<Option<Cursor<'_, K, V, C>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let guard = self.edge_leaf(false)?;
        self.cursor_at(guard, 0)
    }

    /// Cursor to the largest element (the decrement of the end sentinel).
    pub fn last(&self) -> Result<Option<Cursor<'_, K, V, C>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let guard = self.edge_leaf(true)?;
        let slot = node_count(&guard.bytes()) - 1;
        self.cursor_at(guard, slot)
    }

    /// Double-ended iterator over the whole tree in key order.
    pub fn iter(&self) -> Result<Iter<'_, K, V, C>> {
        Iter::new(self)
    }

    /// Re-pin the element a detached [`EntryRef`] points at.
    pub fn at(&self, entry: EntryRef) -> Result<Cursor<'_, K, V, C>> {
        let guard = self.check_entry(&entry)?;
        Ok(Cursor::new(self, guard, entry.leaf, entry.slot as usize))
    }

    // -- internal plumbing ------------------------------------------------

    pub(crate) fn decode_key(bytes: &[u8]) -> K {
        K::read_from_bytes(bytes).unwrap()
    }

    pub(crate) fn decode_value(bytes: &[u8]) -> V {
        V::read_from_bytes(bytes).unwrap()
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::Logic("mutation of a read-only tree".to_string()));
        }
        Ok(())
    }

    /// Descend from the root to a leaf, routing by `ord` (stored key versus
    /// probe). `upper` routes equal keys right (insert/upper-bound);
    /// otherwise equal separators route left (lower-bound). One page is
    /// pinned per level; the parent pin is released as soon as the child is
    /// pinned. When `path` is given, the visited `(branch, child index)`
    /// pairs are recorded for split and merge propagation.
    pub(crate) fn descend(
        &self,
        ord: &mut dyn FnMut(&[u8]) -> Ordering,
        upper: bool,
        mut path: Option<&mut Vec<(PageId, usize)>>,
        leaf_intent: Intent,
    ) -> Result<PageGuard> {
        let mut level = self.header.root_level;
        let mut current = self.header.root_page_id;
        let mut parent: Option<PageGuard> = None;
        loop {
            let intent = if level == 0 { leaf_intent } else { Intent::Read };
            let guard = self.pager.pin(current, intent)?;
            drop(parent.take());
            {
                let buf = guard.bytes();
                if node_level(&buf) != level {
                    return Err(Error::Format(format!(
                        "page {current} has level {}, expected {level}",
                        node_level(&buf)
                    )));
                }
            }
            if level == 0 {
                return Ok(guard);
            }
            let (child, idx) = {
                let buf = guard.bytes();
                let count = node_count(&buf);
                let idx = search_slots(count, upper, |i| ord(self.layout.branch_key(&buf, i)));
                (self.layout.branch_child(&buf, idx), idx)
            };
            if let Some(p) = path.as_mut() {
                p.push((current, idx));
            }
            parent = Some(guard);
            current = child;
            level -= 1;
        }
    }

    /// Leftmost (`rightmost == false`) or rightmost leaf of the tree.
    pub(crate) fn edge_leaf(&self, rightmost: bool) -> Result<PageGuard> {
        let mut ord = |_: &[u8]| {
            if rightmost {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        };
        self.descend(&mut ord, rightmost, None, Intent::Read)
    }

    /// Wrap `(leaf, slot)` as a cursor, stepping to the next leaf when the
    /// slot sits one past the last entry (a lower/upper bound landing at
    /// the end of a leaf).
    pub(crate) fn cursor_at(
        &self,
        guard: PageGuard,
        slot: usize,
    ) -> Result<Option<Cursor<'_, K, V, C>>> {
        let count = node_count(&guard.bytes());
        if slot < count {
            let leaf = guard.page_id();
            return Ok(Some(Cursor::new(self, guard, leaf, slot)));
        }
        let next = node_next(&guard.bytes());
        drop(guard);
        if next == 0 {
            return Ok(None);
        }
        // Non-root leaves are never empty, so slot 0 exists.
        let guard = self.pager.pin(next, Intent::Read)?;
        let leaf = guard.page_id();
        Ok(Some(Cursor::new(self, guard, leaf, 0)))
    }

    /// Validate an [`EntryRef`] against this tree and pin its leaf.
    pub(crate) fn check_entry(&self, entry: &EntryRef) -> Result<PageGuard> {
        if entry.nonce != self.nonce {
            return Err(Error::InvalidIterator("iterator belongs to another tree"));
        }
        let guard = self.pager.pin(entry.leaf, Intent::Read)?;
        {
            let buf = guard.bytes();
            if node_level(&buf) != 0 {
                return Err(Error::InvalidIterator("leaf page no longer exists"));
            }
            if entry.slot as usize >= node_count(&buf) {
                return Err(Error::InvalidIterator("entry slot no longer exists"));
            }
        }
        Ok(guard)
    }

    // -- integrity --------------------------------------------------------

    /// Walk the whole tree and free list, validating ordering, node fill,
    /// level consistency, the leaf chain, and the element count.
    pub fn verify(&self) -> Result<()> {
        let summary = self.verify_node(self.header.root_page_id, self.header.root_level, true)?;
        if summary.elements != self.header.element_count {
            return Err(Error::Format(format!(
                "header counts {} elements, tree holds {}",
                self.header.element_count, summary.elements
            )));
        }
        self.verify_chain(summary.first_leaf, summary.last_leaf, summary.elements)?;
        self.pager.validate_free_list()?;
        Ok(())
    }

    fn verify_node(&self, page_id: PageId, level: u16, is_root: bool) -> Result<NodeSummary<K>> {
        let guard = self.pager.pin(page_id, Intent::Read)?;
        let buf = guard.bytes();
        if node_level(&buf) != level {
            return Err(Error::Format(format!(
                "page {page_id} has level {}, expected {level}",
                node_level(&buf)
            )));
        }
        let count = node_count(&buf);

        if level == 0 {
            if !is_root && count < self.layout.leaf_min() {
                return Err(Error::Format(format!(
                    "leaf {page_id} under-filled: {count} < {}",
                    self.layout.leaf_min()
                )));
            }
            if count > self.layout.leaf_cap {
                return Err(Error::Format(format!("leaf {page_id} over-filled")));
            }
            for i in 1..count {
                let order = self.cmp.cmp(
                    &Self::decode_key(self.layout.leaf_key(&buf, i - 1)),
                    &Self::decode_key(self.layout.leaf_key(&buf, i)),
                );
                let ok = match self.header.policy {
                    KeyPolicy::Unique => order == Ordering::Less,
                    KeyPolicy::Multi => order != Ordering::Greater,
                };
                if !ok {
                    return Err(Error::Format(format!("leaf {page_id} keys out of order")));
                }
            }
            return Ok(NodeSummary {
                first_key: (count > 0).then(|| Self::decode_key(self.layout.leaf_key(&buf, 0))),
                last_key: (count > 0)
                    .then(|| Self::decode_key(self.layout.leaf_key(&buf, count - 1))),
                elements: count as u64,
                first_leaf: page_id,
                last_leaf: page_id,
            });
        }

        let minimum = if is_root { 1 } else { self.layout.branch_min() };
        if count < minimum || count > self.layout.branch_cap {
            return Err(Error::Format(format!(
                "branch {page_id} fill {count} outside [{minimum}, {}]",
                self.layout.branch_cap
            )));
        }
        let keys: Vec<K> = (0..count)
            .map(|i| Self::decode_key(self.layout.branch_key(&buf, i)))
            .collect();
        let children: Vec<PageId> = (0..=count).map(|i| self.layout.branch_child(&buf, i)).collect();
        drop(buf);
        drop(guard);

        for i in 1..count {
            let order = self.cmp.cmp(&keys[i - 1], &keys[i]);
            let ok = match self.header.policy {
                KeyPolicy::Unique => order == Ordering::Less,
                KeyPolicy::Multi => order != Ordering::Greater,
            };
            if !ok {
                return Err(Error::Format(format!("branch {page_id} keys out of order")));
            }
        }

        let mut elements = 0u64;
        let mut first_leaf = 0;
        let mut last_leaf = 0;
        let mut subtree_first: Option<K> = None;
        let mut prev_last: Option<K> = None;
        for (i, &child) in children.iter().enumerate() {
            let child_summary = self.verify_node(child, level - 1, false)?;
            elements += child_summary.elements;
            if i == 0 {
                first_leaf = child_summary.first_leaf;
            }
            last_leaf = child_summary.last_leaf;

            // Child i sits left of separator i; separator i never orders
            // above the first key of child i+1.
            if i < count {
                if let Some(last) = &child_summary.last_key {
                    if self.cmp.cmp(last, &keys[i]) == Ordering::Greater {
                        return Err(Error::Format(format!(
                            "branch {page_id}: child {child} exceeds its separator"
                        )));
                    }
                }
            }
            if i > 0 {
                if let Some(first) = &child_summary.first_key {
                    if self.cmp.cmp(first, &keys[i - 1]) == Ordering::Less {
                        return Err(Error::Format(format!(
                            "branch {page_id}: child {child} underruns its separator"
                        )));
                    }
                }
            }
            if let (Some(prev), Some(first)) = (&prev_last, &child_summary.first_key) {
                if self.cmp.cmp(prev, first) == Ordering::Greater {
                    return Err(Error::Format(format!(
                        "branch {page_id}: children out of order at {child}"
                    )));
                }
            }
            if subtree_first.is_none() {
                subtree_first = child_summary.first_key;
            }
            if child_summary.last_key.is_some() {
                prev_last = child_summary.last_key;
            }
        }

        Ok(NodeSummary {
            first_key: subtree_first,
            last_key: prev_last,
            elements,
            first_leaf,
            last_leaf,
        })
    }

    fn verify_chain(&self, first: PageId, last: PageId, elements: u64) -> Result<()> {
        let mut current = first;
        let mut prev: PageId = 0;
        let mut walked = 0u64;
        loop {
            let guard = self.pager.pin(current, Intent::Read)?;
            let buf = guard.bytes();
            if node_level(&buf) != 0 {
                return Err(Error::Format(format!("chain entry {current} is not a leaf")));
            }
            if node_prev(&buf) != prev {
                return Err(Error::Format(format!(
                    "leaf {current} prev link {} does not match {prev}",
                    node_prev(&buf)
                )));
            }
            walked += node_count(&buf) as u64;
            let next = node_next(&buf);
            if next == 0 {
                if current != last {
                    return Err(Error::Format(format!(
                        "leaf chain ends at {current}, tree ends at {last}"
                    )));
                }
                break;
            }
            prev = current;
            current = next;
        }
        if walked != elements {
            return Err(Error::Format(format!(
                "leaf chain holds {walked} elements, tree holds {elements}"
            )));
        }
        Ok(())
    }
}

struct NodeSummary<K> {
    first_key: Option<K>,
    last_key: Option<K>,
    elements: u64,
    first_leaf: PageId,
    last_leaf: PageId,
}

impl<K, V, C> Drop for BTree<K, V, C> {
    fn drop(&mut self) {
        if self.closed || !self.writable {
            return;
        }
        // Destruction must not fail; flush on a best-effort basis.
        self.header.free_list_head = self.pager.free_head();
        self.header.page_count = self.pager.page_count();
        let mut buf = vec![0u8; self.header.page_size as usize];
        self.header.write_to(&mut buf);
        let _ = self.pager.flush_with_header(&buf);
        let _ = self.pager.sync();
    }
}
