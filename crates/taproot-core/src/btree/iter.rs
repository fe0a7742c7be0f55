//! Cursors and iterators. A cursor pins the leaf it points into, so the
//! cache cannot evict the page out from under a borrowed position; the pin
//! is released when the cursor drops.

use crate::error::Result;
use crate::storage::page::{node_count, node_next, node_prev};
use crate::storage::pager::{Intent, PageGuard};
use crate::types::{KeyOrder, PageId, Record};

use super::BTree;

/// A detached reference to one stored entry: `(leaf page, slot)` plus the
/// identity of the tree that produced it. Unlike [`Cursor`] it holds no pin
/// and can therefore be handed to the mutating operations (`erase_entry`,
/// `set_value`). It is invalidated by any mutation that moves its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef {
    pub(crate) leaf: PageId,
    pub(crate) slot: u32,
    pub(crate) nonce: u64,
}

impl EntryRef {
    pub(crate) fn new(leaf: PageId, slot: usize, nonce: u64) -> Self {
        Self {
            leaf,
            slot: slot as u32,
            nonce,
        }
    }
}

/// A pinned position inside the tree.
pub struct Cursor<'t, K, V, C> {
    tree: &'t BTree<K, V, C>,
    guard: PageGuard,
    leaf: PageId,
    slot: usize,
}

impl<'t, K, V, C> Cursor<'t, K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    pub(crate) fn new(tree: &'t BTree<K, V, C>, guard: PageGuard, leaf: PageId, slot: usize) -> Self {
        debug_assert!(slot < node_count(&guard.bytes()));
        Self {
            tree,
            guard,
            leaf,
            slot,
        }
    }

    pub fn key(&self) -> K {
        let buf = self.guard.bytes();
        BTree::<K, V, C>::decode_key(self.tree.layout.leaf_key(&buf, self.slot))
    }

    pub fn value(&self) -> V {
        let buf = self.guard.bytes();
        BTree::<K, V, C>::decode_value(self.tree.layout.leaf_value(&buf, self.slot))
    }

    pub fn entry(&self) -> (K, V) {
        (self.key(), self.value())
    }

    /// Detach the position for use with the mutating entry operations.
    pub fn entry_ref(&self) -> EntryRef {
        EntryRef::new(self.leaf, self.slot, self.tree.nonce)
    }

    pub(crate) fn position(&self) -> (PageId, usize) {
        (self.leaf, self.slot)
    }

    /// Step to the next element in key order; `None` past the last.
    pub fn next(self) -> Result<Option<Self>> {
        let count = node_count(&self.guard.bytes());
        if self.slot + 1 < count {
            return Ok(Some(Self {
                slot: self.slot + 1,
                ..self
            }));
        }
        let next = node_next(&self.guard.bytes());
        let tree = self.tree;
        drop(self.guard);
        if next == 0 {
            return Ok(None);
        }
        let guard = tree.pager.pin(next, Intent::Read)?;
        Ok(Some(Self {
            tree,
            guard,
            leaf: next,
            slot: 0,
        }))
    }

    /// Step to the previous element in key order; `None` before the first.
    pub fn prev(self) -> Result<Option<Self>> {
        if self.slot > 0 {
            return Ok(Some(Self {
                slot: self.slot - 1,
                ..self
            }));
        }
        let prev = node_prev(&self.guard.bytes());
        let tree = self.tree;
        drop(self.guard);
        if prev == 0 {
            return Ok(None);
        }
        let guard = tree.pager.pin(prev, Intent::Read)?;
        let slot = node_count(&guard.bytes()) - 1;
        Ok(Some(Self {
            tree,
            guard,
            leaf: prev,
            slot,
        }))
    }
}

/// Double-ended iterator over the whole tree. Both ends hold a pin; the
/// element count captured at creation bounds the walk, so the two ends
/// never cross.
pub struct Iter<'t, K, V, C> {
    tree: &'t BTree<K, V, C>,
    front: Option<(PageGuard, usize)>,
    back: Option<(PageGuard, usize)>,
    remaining: u64,
}

impl<'t, K, V, C> Iter<'t, K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    pub(crate) fn new(tree: &'t BTree<K, V, C>) -> Result<Self> {
        let remaining = tree.size();
        if remaining == 0 {
            return Ok(Self {
                tree,
                front: None,
                back: None,
                remaining: 0,
            });
        }
        let front = tree.edge_leaf(false)?;
        let back = tree.edge_leaf(true)?;
        let back_slot = node_count(&back.bytes()) - 1;
        Ok(Self {
            tree,
            front: Some((front, 0)),
            back: Some((back, back_slot)),
            remaining,
        })
    }

    fn read(&self, guard: &PageGuard, slot: usize) -> (K, V) {
        let buf = guard.bytes();
        (
            BTree::<K, V, C>::decode_key(self.tree.layout.leaf_key(&buf, slot)),
            BTree::<K, V, C>::decode_value(self.tree.layout.leaf_value(&buf, slot)),
        )
    }

    fn advance_front(&mut self) -> Result<()> {
        let (guard, slot) = self.front.take().unwrap();
        if slot + 1 < node_count(&guard.bytes()) {
            self.front = Some((guard, slot + 1));
            return Ok(());
        }
        let next = node_next(&guard.bytes());
        drop(guard);
        debug_assert_ne!(next, 0, "remaining count outlived the leaf chain");
        let guard = self.tree.pager.pin(next, Intent::Read)?;
        self.front = Some((guard, 0));
        Ok(())
    }

    fn retreat_back(&mut self) -> Result<()> {
        let (guard, slot) = self.back.take().unwrap();
        if slot > 0 {
            self.back = Some((guard, slot - 1));
            return Ok(());
        }
        let prev = node_prev(&guard.bytes());
        drop(guard);
        debug_assert_ne!(prev, 0, "remaining count outlived the leaf chain");
        let guard = self.tree.pager.pin(prev, Intent::Read)?;
        let slot = node_count(&guard.bytes()) - 1;
        self.back = Some((guard, slot));
        Ok(())
    }
}

impl<K, V, C> Iterator for Iter<'_, K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.front = None;
            self.back = None;
            return None;
        }
        let (guard, slot) = self.front.as_ref()?;
        let item = self.read(guard, *slot);
        self.remaining -= 1;
        if self.remaining > 0 {
            if let Err(e) = self.advance_front() {
                self.remaining = 0;
                return Some(Err(e));
            }
        }
        Some(Ok(item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

impl<K, V, C> DoubleEndedIterator for Iter<'_, K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.front = None;
            self.back = None;
            return None;
        }
        let (guard, slot) = self.back.as_ref()?;
        let item = self.read(guard, *slot);
        self.remaining -= 1;
        if self.remaining > 0 {
            if let Err(e) = self.retreat_back() {
                self.remaining = 0;
                return Some(Err(e));
            }
        }
        Some(Ok(item))
    }
}

/// Forward iterator bounded by an exclusive end position; the shape behind
/// `equal_range`.
pub struct Range<'t, K, V, C> {
    tree: &'t BTree<K, V, C>,
    front: Option<(PageGuard, usize)>,
    end: Option<(PageId, usize)>,
    done: bool,
}

impl<'t, K, V, C> Range<'t, K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    pub(crate) fn new(
        tree: &'t BTree<K, V, C>,
        front: Option<Cursor<'t, K, V, C>>,
        end: Option<(PageId, usize)>,
    ) -> Self {
        match front {
            Some(cur) => Self {
                tree,
                end,
                done: end == Some((cur.leaf, cur.slot)),
                front: Some((cur.guard, cur.slot)),
            },
            None => Self {
                tree,
                end,
                done: true,
                front: None,
            },
        }
    }
}

impl<K, V, C> Iterator for Range<'_, K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            self.front = None;
            return None;
        }
        let (guard, slot) = self.front.take()?;
        let item = {
            let buf = guard.bytes();
            (
                BTree::<K, V, C>::decode_key(self.tree.layout.leaf_key(&buf, slot)),
                BTree::<K, V, C>::decode_value(self.tree.layout.leaf_value(&buf, slot)),
            )
        };

        // Advance, stopping at the captured end position or the last leaf.
        if slot + 1 < node_count(&guard.bytes()) {
            if self.end == Some((guard.page_id(), slot + 1)) {
                self.done = true;
            } else {
                self.front = Some((guard, slot + 1));
            }
        } else {
            let next = node_next(&guard.bytes());
            drop(guard);
            if next == 0 || self.end == Some((next, 0)) {
                self.done = true;
            } else {
                match self.tree.pager.pin(next, Intent::Read) {
                    Ok(g) => self.front = Some((g, 0)),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
        }
        Some(Ok(item))
    }
}
