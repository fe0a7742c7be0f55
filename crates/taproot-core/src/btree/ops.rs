//! Mutating tree operations: insert with node splits, erase with
//! redistribution and merge, and the entry-level edits reached through
//! cursors.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::storage::page::{
    node_count, node_level, node_next, node_set_count, node_set_next, node_set_prev,
};
use crate::storage::pager::{Intent, PageGuard};
use crate::types::{KeyOrder, PageId, Record};

use super::iter::EntryRef;
use super::node::search_slots;
use super::BTree;

/// How an under-filled leaf was repaired, with enough context to place the
/// erased entry's successor.
enum LeafFix {
    None { next: PageId },
    BorrowedLeft { next: PageId },
    BorrowedRight,
    MergedIntoLeft {
        left: PageId,
        left_old: usize,
        next: PageId,
    },
    MergedRightIn,
}

impl<K, V, C> BTree<K, V, C>
where
    K: Record,
    V: Record,
    C: KeyOrder<K>,
{
    /// Insert an element.
    ///
    /// On a unique tree an equal key refuses the insert and returns the
    /// existing entry with `false`. On a multi tree the element lands after
    /// every equal one and the result is always `true`.
    pub fn insert(&mut self, key: K, value: V) -> Result<(EntryRef, bool)> {
        self.ensure_writable()?;
        let mut path = Vec::with_capacity(self.header.root_level as usize);
        let guard = {
            let mut ord = |bytes: &[u8]| self.cmp.cmp(&Self::decode_key(bytes), &key);
            self.descend(&mut ord, true, Some(&mut path), Intent::Write)?
        };
        let leaf_id = guard.page_id();

        let (count, slot) = {
            let buf = guard.bytes();
            let count = node_count(&buf);
            let slot = search_slots(count, true, |i| {
                self.cmp
                    .cmp(&Self::decode_key(self.layout.leaf_key(&buf, i)), &key)
            });
            (count, slot)
        };

        if self.is_unique() && slot > 0 {
            let equal = {
                let buf = guard.bytes();
                self.cmp
                    .cmp(&Self::decode_key(self.layout.leaf_key(&buf, slot - 1)), &key)
                    == Ordering::Equal
            };
            if equal {
                return Ok((EntryRef::new(leaf_id, slot - 1, self.nonce), false));
            }
        }

        let entry = if count < self.layout.leaf_cap {
            {
                let mut buf = guard.bytes_mut();
                self.layout
                    .leaf_insert(&mut buf, slot, count, key.as_bytes(), value.as_bytes());
                node_set_count(&mut buf, count + 1);
            }
            drop(guard);
            EntryRef::new(leaf_id, slot, self.nonce)
        } else {
            self.split_leaf_insert(guard, &mut path, slot, key.as_bytes(), value.as_bytes())?
        };

        self.header.element_count += 1;
        Ok((entry, true))
    }

    /// Erase every element equal to `key`; returns how many were removed.
    pub fn erase(&mut self, key: &K) -> Result<u64> {
        self.ensure_writable()?;
        let mut removed = 0u64;
        loop {
            let mut path = Vec::with_capacity(self.header.root_level as usize);
            let landed = {
                let mut ord = |bytes: &[u8]| self.cmp.cmp(&Self::decode_key(bytes), key);
                self.descend(&mut ord, false, Some(&mut path), Intent::Write)?
            };
            let slot = {
                let buf = landed.bytes();
                search_slots(node_count(&buf), false, |i| {
                    self.cmp
                        .cmp(&Self::decode_key(self.layout.leaf_key(&buf, i)), key)
                })
            };
            // A lower bound landing one past the last entry continues in the
            // next leaf (equal separators route the descent left of a run).
            let (guard, slot) = if slot == node_count(&landed.bytes()) {
                drop(landed);
                match self.path_step_right(&mut path, Intent::Write)? {
                    Some(g) => (g, 0),
                    None => break,
                }
            } else {
                (landed, slot)
            };
            let equal = {
                let buf = guard.bytes();
                node_count(&buf) > slot
                    && self
                        .cmp
                        .cmp(&Self::decode_key(self.layout.leaf_key(&buf, slot)), key)
                        == Ordering::Equal
            };
            if !equal {
                break;
            }
            self.erase_at_path(&path, guard, slot)?;
            removed += 1;
            if self.is_unique() {
                break;
            }
        }
        Ok(removed)
    }

    /// Erase the element a cursor points at; returns its successor, or
    /// `None` when the erased element was the largest.
    pub fn erase_entry(&mut self, entry: EntryRef) -> Result<Option<EntryRef>> {
        self.ensure_writable()?;
        let key = {
            let guard = self.check_entry(&entry)?;
            let buf = guard.bytes();
            Self::decode_key(self.layout.leaf_key(&buf, entry.slot as usize))
        };

        // Re-descend with an explicit path, then walk right along the equal
        // run until the cursor's leaf comes up.
        let mut path = Vec::with_capacity(self.header.root_level as usize);
        let mut guard = {
            let mut ord = |bytes: &[u8]| self.cmp.cmp(&Self::decode_key(bytes), &key);
            self.descend(&mut ord, false, Some(&mut path), Intent::Write)?
        };
        while guard.page_id() != entry.leaf {
            let overshot = {
                let buf = guard.bytes();
                let count = node_count(&buf);
                count > 0
                    && self
                        .cmp
                        .cmp(&Self::decode_key(self.layout.leaf_key(&buf, count - 1)), &key)
                        == Ordering::Greater
            };
            if overshot {
                return Err(Error::InvalidIterator("entry leaf is no longer reachable"));
            }
            drop(guard);
            match self.path_step_right(&mut path, Intent::Write)? {
                Some(g) => guard = g,
                None => {
                    return Err(Error::InvalidIterator("entry leaf is no longer reachable"))
                }
            }
        }

        let slot = entry.slot as usize;
        {
            let buf = guard.bytes();
            if slot >= node_count(&buf)
                || self
                    .cmp
                    .cmp(&Self::decode_key(self.layout.leaf_key(&buf, slot)), &key)
                    != Ordering::Equal
            {
                return Err(Error::InvalidIterator("entry slot no longer matches"));
            }
        }

        let successor = self.erase_at_path(&path, guard, slot)?;
        Ok(successor.map(|(leaf, slot)| EntryRef::new(leaf, slot, self.nonce)))
    }

    /// Overwrite the value half of an existing entry. Keys are immutable;
    /// this is the writable-iterator cast of the container interface.
    pub fn set_value(&mut self, entry: &EntryRef, value: V) -> Result<()> {
        self.ensure_writable()?;
        drop(self.check_entry(entry)?);
        let guard = self.pager.pin(entry.leaf, Intent::Write)?;
        let mut buf = guard.bytes_mut();
        self.layout
            .leaf_set_value(&mut buf, entry.slot as usize, value.as_bytes());
        Ok(())
    }

    // -- split machinery --------------------------------------------------

    /// Split a full leaf while inserting `(key, value)` at `slot`. The
    /// incoming entry counts toward the distribution, so both halves end at
    /// or above the minimum fill.
    fn split_leaf_insert(
        &mut self,
        guard: PageGuard,
        path: &mut Vec<(PageId, usize)>,
        slot: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<EntryRef> {
        let leaf_id = guard.page_id();
        let m = self.layout.leaf_cap;
        let total = m + 1;
        let left_n = total - total / 2;

        let new_guard = self.pager.allocate(0)?;
        let new_id = new_guard.page_id();

        let old_next;
        let separator;
        let entry;
        {
            let mut buf = guard.bytes_mut();
            let mut nbuf = new_guard.bytes_mut();
            old_next = node_next(&buf);

            if slot < left_n {
                // The new entry lands in the left half.
                self.layout
                    .leaf_move(&buf, &mut nbuf, left_n - 1, m - (left_n - 1), 0);
                node_set_count(&mut nbuf, total - left_n);
                self.layout.leaf_insert(&mut buf, slot, left_n - 1, key, value);
                node_set_count(&mut buf, left_n);
                entry = EntryRef::new(leaf_id, slot, self.nonce);
            } else {
                self.layout.leaf_move(&buf, &mut nbuf, left_n, m - left_n, 0);
                let rslot = slot - left_n;
                self.layout.leaf_insert(&mut nbuf, rslot, m - left_n, key, value);
                node_set_count(&mut nbuf, total - left_n);
                node_set_count(&mut buf, left_n);
                entry = EntryRef::new(new_id, rslot, self.nonce);
            }

            node_set_prev(&mut nbuf, leaf_id);
            node_set_next(&mut nbuf, old_next);
            node_set_next(&mut buf, new_id);
            separator = self.layout.leaf_key(&nbuf, 0).to_vec();
        }
        drop(new_guard);
        drop(guard);

        if old_next != 0 {
            let ng = self.pager.pin(old_next, Intent::Write)?;
            node_set_prev(&mut ng.bytes_mut(), new_id);
        }

        self.insert_into_parents(path, separator, new_id)?;
        Ok(entry)
    }

    /// Propagate a split upward: insert `(separator, new_child)` into each
    /// recorded branch, splitting further as needed, growing a new root if
    /// the split reaches it.
    fn insert_into_parents(
        &mut self,
        path: &mut Vec<(PageId, usize)>,
        mut separator: Vec<u8>,
        mut new_child: PageId,
    ) -> Result<()> {
        while let Some((branch_id, child_idx)) = path.pop() {
            let guard = self.pager.pin(branch_id, Intent::Write)?;
            let count = node_count(&guard.bytes());
            if count < self.layout.branch_cap {
                let mut buf = guard.bytes_mut();
                self.layout
                    .branch_insert(&mut buf, child_idx, count, &separator, new_child);
                node_set_count(&mut buf, count + 1);
                return Ok(());
            }
            let (promoted, new_branch) =
                self.split_branch_insert(&guard, child_idx, &separator, new_child)?;
            separator = promoted;
            new_child = new_branch;
        }

        // The split reached the root: grow the tree by one level.
        let old_root = self.header.root_page_id;
        let new_level = self.header.root_level + 1;
        let guard = self.pager.allocate(new_level)?;
        {
            let mut buf = guard.bytes_mut();
            self.layout.branch_set_child(&mut buf, 0, old_root);
            self.layout.branch_insert(&mut buf, 0, 0, &separator, new_child);
            node_set_count(&mut buf, 1);
        }
        self.header.root_page_id = guard.page_id();
        self.header.root_level = new_level;
        Ok(())
    }

    /// Split a full branch while inserting `(separator, new_child)` at key
    /// index `insert_idx`. The middle key is promoted, not kept in either
    /// half.
    fn split_branch_insert(
        &mut self,
        guard: &PageGuard,
        insert_idx: usize,
        separator: &[u8],
        new_child: PageId,
    ) -> Result<(Vec<u8>, PageId)> {
        let level = node_level(&guard.bytes());
        let m = node_count(&guard.bytes());
        debug_assert_eq!(m, self.layout.branch_cap);

        let (mut keys, mut children) = {
            let buf = guard.bytes();
            let keys: Vec<Vec<u8>> = (0..m)
                .map(|i| self.layout.branch_key(&buf, i).to_vec())
                .collect();
            let children: Vec<PageId> = (0..=m).map(|i| self.layout.branch_child(&buf, i)).collect();
            (keys, children)
        };
        keys.insert(insert_idx, separator.to_vec());
        children.insert(insert_idx + 1, new_child);

        let total = m + 1;
        let left_n = total / 2;
        let right_n = total - left_n - 1;
        let promoted = keys[left_n].clone();

        let new_guard = self.pager.allocate(level)?;
        {
            let mut nbuf = new_guard.bytes_mut();
            self.layout.branch_set_child(&mut nbuf, 0, children[left_n + 1]);
            for j in 0..right_n {
                self.layout.branch_set_key(&mut nbuf, j, &keys[left_n + 1 + j]);
                self.layout
                    .branch_set_child(&mut nbuf, j + 1, children[left_n + 2 + j]);
            }
            node_set_count(&mut nbuf, right_n);
        }
        {
            let mut buf = guard.bytes_mut();
            self.layout.branch_set_child(&mut buf, 0, children[0]);
            for i in 0..left_n {
                self.layout.branch_set_key(&mut buf, i, &keys[i]);
                self.layout.branch_set_child(&mut buf, i + 1, children[i + 1]);
            }
            node_set_count(&mut buf, left_n);
        }
        Ok((promoted, new_guard.page_id()))
    }

    // -- erase machinery --------------------------------------------------

    /// Remove the entry at `slot` of the pinned leaf, rebalance as needed,
    /// and report where the erased entry's successor ended up.
    fn erase_at_path(
        &mut self,
        path: &[(PageId, usize)],
        guard: PageGuard,
        slot: usize,
    ) -> Result<Option<(PageId, usize)>> {
        let leaf_id = guard.page_id();
        let old_count = node_count(&guard.bytes());
        debug_assert!(slot < old_count);
        {
            let mut buf = guard.bytes_mut();
            self.layout.leaf_remove(&mut buf, slot, old_count);
            node_set_count(&mut buf, old_count - 1);
        }
        self.header.element_count -= 1;
        let new_count = old_count - 1;

        let fix = if path.is_empty() || new_count >= self.layout.leaf_min() {
            let next = node_next(&guard.bytes());
            drop(guard);
            LeafFix::None { next }
        } else {
            self.rebalance_leaf(path, guard)?
        };

        let successor = if slot < new_count {
            match fix {
                LeafFix::None { .. } | LeafFix::BorrowedRight | LeafFix::MergedRightIn => {
                    Some((leaf_id, slot))
                }
                LeafFix::BorrowedLeft { .. } => Some((leaf_id, slot + 1)),
                LeafFix::MergedIntoLeft { left, left_old, .. } => Some((left, left_old + slot)),
            }
        } else {
            match fix {
                LeafFix::BorrowedRight | LeafFix::MergedRightIn => Some((leaf_id, new_count)),
                LeafFix::None { next }
                | LeafFix::BorrowedLeft { next }
                | LeafFix::MergedIntoLeft { next, .. } => {
                    if next == 0 {
                        None
                    } else {
                        Some((next, 0))
                    }
                }
            }
        };
        Ok(successor)
    }

    /// Repair an under-filled non-root leaf: borrow from the richer
    /// immediate sibling when it has entries to spare, merge otherwise.
    fn rebalance_leaf(&mut self, path: &[(PageId, usize)], guard: PageGuard) -> Result<LeafFix> {
        let (parent_id, child_idx) = *path.last().unwrap();
        let leaf_id = guard.page_id();
        let pguard = self.pager.pin(parent_id, Intent::Write)?;
        let pcount = node_count(&pguard.bytes());
        debug_assert_eq!(
            self.layout.branch_child(&pguard.bytes(), child_idx),
            leaf_id
        );

        let left_id = if child_idx > 0 {
            self.layout.branch_child(&pguard.bytes(), child_idx - 1)
        } else {
            0
        };
        let right_id = if child_idx < pcount {
            self.layout.branch_child(&pguard.bytes(), child_idx + 1)
        } else {
            0
        };
        let left_count = if left_id != 0 {
            node_count(&self.pager.pin(left_id, Intent::Read)?.bytes())
        } else {
            0
        };
        let right_count = if right_id != 0 {
            node_count(&self.pager.pin(right_id, Intent::Read)?.bytes())
        } else {
            0
        };

        let min = self.layout.leaf_min();
        if left_count > min || right_count > min {
            if left_count >= right_count {
                let lg = self.pager.pin(left_id, Intent::Write)?;
                {
                    let mut lbuf = lg.bytes_mut();
                    let mut buf = guard.bytes_mut();
                    let donor_slot = left_count - 1;
                    let k = self.layout.leaf_key(&lbuf, donor_slot).to_vec();
                    let v = self.layout.leaf_value(&lbuf, donor_slot).to_vec();
                    let cur = node_count(&buf);
                    self.layout.leaf_insert(&mut buf, 0, cur, &k, &v);
                    node_set_count(&mut buf, cur + 1);
                    node_set_count(&mut lbuf, donor_slot);
                    // Separator left of the leaf becomes the right
                    // participant's new first key.
                    let mut pbuf = pguard.bytes_mut();
                    self.layout.branch_set_key(&mut pbuf, child_idx - 1, &k);
                }
                let next = node_next(&guard.bytes());
                Ok(LeafFix::BorrowedLeft { next })
            } else {
                let rg = self.pager.pin(right_id, Intent::Write)?;
                {
                    let mut rbuf = rg.bytes_mut();
                    let mut buf = guard.bytes_mut();
                    let k = self.layout.leaf_key(&rbuf, 0).to_vec();
                    let v = self.layout.leaf_value(&rbuf, 0).to_vec();
                    let cur = node_count(&buf);
                    self.layout.leaf_insert(&mut buf, cur, cur, &k, &v);
                    node_set_count(&mut buf, cur + 1);
                    self.layout.leaf_remove(&mut rbuf, 0, right_count);
                    node_set_count(&mut rbuf, right_count - 1);
                    let mut pbuf = pguard.bytes_mut();
                    self.layout
                        .branch_set_key(&mut pbuf, child_idx, self.layout.leaf_key(&rbuf, 0));
                }
                Ok(LeafFix::BorrowedRight)
            }
        } else if left_id != 0 {
            // Merge: all entries move into the left participant; the right
            // one leaves the chain and its page goes back to the free list.
            let lg = self.pager.pin(left_id, Intent::Write)?;
            let next;
            {
                let mut lbuf = lg.bytes_mut();
                let buf = guard.bytes();
                let cur = node_count(&buf);
                self.layout.leaf_move(&buf, &mut lbuf, 0, cur, left_count);
                node_set_count(&mut lbuf, left_count + cur);
                next = node_next(&buf);
                node_set_next(&mut lbuf, next);
            }
            drop(guard);
            drop(lg);
            if next != 0 {
                let ng = self.pager.pin(next, Intent::Write)?;
                node_set_prev(&mut ng.bytes_mut(), left_id);
            }
            self.pager.free(leaf_id)?;
            {
                let mut pbuf = pguard.bytes_mut();
                self.layout.branch_remove(&mut pbuf, child_idx - 1, pcount);
                node_set_count(&mut pbuf, pcount - 1);
            }
            drop(pguard);
            self.rebalance_branches(path)?;
            Ok(LeafFix::MergedIntoLeft {
                left: left_id,
                left_old: left_count,
                next,
            })
        } else {
            let rg = self.pager.pin(right_id, Intent::Write)?;
            let next;
            {
                let mut buf = guard.bytes_mut();
                let rbuf = rg.bytes();
                let cur = node_count(&buf);
                self.layout.leaf_move(&rbuf, &mut buf, 0, right_count, cur);
                node_set_count(&mut buf, cur + right_count);
                next = node_next(&rbuf);
                node_set_next(&mut buf, next);
            }
            drop(rg);
            drop(guard);
            if next != 0 {
                let ng = self.pager.pin(next, Intent::Write)?;
                node_set_prev(&mut ng.bytes_mut(), leaf_id);
            }
            self.pager.free(right_id)?;
            {
                let mut pbuf = pguard.bytes_mut();
                self.layout.branch_remove(&mut pbuf, child_idx, pcount);
                node_set_count(&mut pbuf, pcount - 1);
            }
            drop(pguard);
            self.rebalance_branches(path)?;
            Ok(LeafFix::MergedRightIn)
        }
    }

    /// Walk the recorded path bottom-up repairing under-filled branches,
    /// lowering the root when it is left with a single child.
    fn rebalance_branches(&mut self, path: &[(PageId, usize)]) -> Result<()> {
        let mut depth = path.len();
        while depth > 0 {
            let (node_id, _) = path[depth - 1];
            let count = node_count(&self.pager.pin(node_id, Intent::Read)?.bytes());
            if depth == 1 {
                // The root branch: it may hold a single key, but once the
                // last separator is gone the tree loses a level.
                if count == 0 {
                    let child = {
                        let g = self.pager.pin(node_id, Intent::Read)?;
                        let buf = g.bytes();
                        self.layout.branch_child(&buf, 0)
                    };
                    self.pager.free(node_id)?;
                    self.header.root_page_id = child;
                    self.header.root_level -= 1;
                }
                break;
            }
            if count >= self.layout.branch_min() {
                break;
            }
            let (parent_id, node_idx) = path[depth - 2];
            if !self.rebalance_branch_level(parent_id, node_idx, node_id)? {
                break;
            }
            depth -= 1;
        }
        Ok(())
    }

    /// Repair one under-filled branch. Returns `true` when a merge removed
    /// a separator from the parent and the repair must continue upward.
    fn rebalance_branch_level(
        &mut self,
        parent_id: PageId,
        node_idx: usize,
        node_id: PageId,
    ) -> Result<bool> {
        let pguard = self.pager.pin(parent_id, Intent::Write)?;
        let pcount = node_count(&pguard.bytes());
        debug_assert_eq!(self.layout.branch_child(&pguard.bytes(), node_idx), node_id);
        let nguard = self.pager.pin(node_id, Intent::Write)?;
        let ncount = node_count(&nguard.bytes());

        let left_id = if node_idx > 0 {
            self.layout.branch_child(&pguard.bytes(), node_idx - 1)
        } else {
            0
        };
        let right_id = if node_idx < pcount {
            self.layout.branch_child(&pguard.bytes(), node_idx + 1)
        } else {
            0
        };
        let left_count = if left_id != 0 {
            node_count(&self.pager.pin(left_id, Intent::Read)?.bytes())
        } else {
            0
        };
        let right_count = if right_id != 0 {
            node_count(&self.pager.pin(right_id, Intent::Read)?.bytes())
        } else {
            0
        };

        let min = self.layout.branch_min();
        if left_count > min || right_count > min {
            if left_count >= right_count {
                // Rotate through the parent: the separator comes down as
                // the node's first key, the donor's last child crosses over,
                // and the donor's last key replaces the separator.
                let lg = self.pager.pin(left_id, Intent::Write)?;
                let mut lbuf = lg.bytes_mut();
                let mut nbuf = nguard.bytes_mut();
                let mut pbuf = pguard.bytes_mut();
                let sep = self.layout.branch_key(&pbuf, node_idx - 1).to_vec();
                let donor_child = self.layout.branch_child(&lbuf, left_count);
                let old_first = self.layout.branch_child(&nbuf, 0);
                self.layout.branch_insert(&mut nbuf, 0, ncount, &sep, old_first);
                self.layout.branch_set_child(&mut nbuf, 0, donor_child);
                node_set_count(&mut nbuf, ncount + 1);
                self.layout.branch_set_key(
                    &mut pbuf,
                    node_idx - 1,
                    self.layout.branch_key(&lbuf, left_count - 1),
                );
                node_set_count(&mut lbuf, left_count - 1);
            } else {
                let rg = self.pager.pin(right_id, Intent::Write)?;
                let mut rbuf = rg.bytes_mut();
                let mut nbuf = nguard.bytes_mut();
                let mut pbuf = pguard.bytes_mut();
                let sep = self.layout.branch_key(&pbuf, node_idx).to_vec();
                let donor_child = self.layout.branch_child(&rbuf, 0);
                self.layout.branch_insert(&mut nbuf, ncount, ncount, &sep, donor_child);
                node_set_count(&mut nbuf, ncount + 1);
                self.layout
                    .branch_set_key(&mut pbuf, node_idx, self.layout.branch_key(&rbuf, 0));
                let shifted = self.layout.branch_child(&rbuf, 1);
                self.layout.branch_set_child(&mut rbuf, 0, shifted);
                self.layout.branch_remove(&mut rbuf, 0, right_count);
                node_set_count(&mut rbuf, right_count - 1);
            }
            return Ok(false);
        }

        if left_id != 0 {
            // Merge the node into its left sibling; the separator between
            // them comes down between the two key sequences.
            let lg = self.pager.pin(left_id, Intent::Write)?;
            {
                let mut lbuf = lg.bytes_mut();
                let nbuf = nguard.bytes();
                let mut pbuf = pguard.bytes_mut();
                let sep = self.layout.branch_key(&pbuf, node_idx - 1).to_vec();
                let first_child = self.layout.branch_child(&nbuf, 0);
                self.layout
                    .branch_insert(&mut lbuf, left_count, left_count, &sep, first_child);
                self.layout.branch_move(&nbuf, &mut lbuf, 0, ncount, left_count + 1);
                node_set_count(&mut lbuf, left_count + 1 + ncount);
                self.layout.branch_remove(&mut pbuf, node_idx - 1, pcount);
                node_set_count(&mut pbuf, pcount - 1);
            }
            drop(nguard);
            self.pager.free(node_id)?;
        } else {
            let rg = self.pager.pin(right_id, Intent::Write)?;
            {
                let mut nbuf = nguard.bytes_mut();
                let rbuf = rg.bytes();
                let mut pbuf = pguard.bytes_mut();
                let sep = self.layout.branch_key(&pbuf, node_idx).to_vec();
                let first_child = self.layout.branch_child(&rbuf, 0);
                self.layout
                    .branch_insert(&mut nbuf, ncount, ncount, &sep, first_child);
                self.layout.branch_move(&rbuf, &mut nbuf, 0, right_count, ncount + 1);
                node_set_count(&mut nbuf, ncount + 1 + right_count);
                self.layout.branch_remove(&mut pbuf, node_idx, pcount);
                node_set_count(&mut pbuf, pcount - 1);
            }
            drop(rg);
            self.pager.free(right_id)?;
        }
        Ok(true)
    }

    /// Advance the recorded descent path to the next leaf to the right,
    /// pinning and returning it. `None` at the right edge of the tree.
    pub(crate) fn path_step_right(
        &self,
        path: &mut Vec<(PageId, usize)>,
        leaf_intent: Intent,
    ) -> Result<Option<PageGuard>> {
        loop {
            let Some(&(branch_id, idx)) = path.last() else {
                return Ok(None);
            };
            let guard = self.pager.pin(branch_id, Intent::Read)?;
            let count = node_count(&guard.bytes());
            if idx >= count {
                drop(guard);
                path.pop();
                continue;
            }
            path.last_mut().unwrap().1 = idx + 1;
            let mut child = self.layout.branch_child(&guard.bytes(), idx + 1);
            let mut level = node_level(&guard.bytes()) - 1;
            let mut parent = Some(guard);
            loop {
                let intent = if level == 0 { leaf_intent } else { Intent::Read };
                let g = self.pager.pin(child, intent)?;
                drop(parent.take());
                if level == 0 {
                    return Ok(Some(g));
                }
                path.push((child, 0));
                child = self.layout.branch_child(&g.bytes(), 0);
                parent = Some(g);
                level -= 1;
            }
        }
    }
}
