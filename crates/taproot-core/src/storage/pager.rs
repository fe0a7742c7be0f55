use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::storage::file::BinaryFile;
use crate::storage::page::{
    node_init, node_is_free, node_mark_free, node_next, node_page_id,
};
use crate::types::PageId;

/// Declared access intent for a pinned page. Releasing a write-intent pin
/// marks the page dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

/// A cached page buffer with its pin count and dirty flag.
#[derive(Debug)]
struct Frame {
    page_id: PageId,
    buf: RwLock<Box<[u8]>>,
    pins: AtomicU32,
    dirty: AtomicBool,
}

impl Frame {
    fn new(page_id: PageId, buf: Box<[u8]>, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            page_id,
            buf: RwLock::new(buf),
            pins: AtomicU32::new(0),
            dirty: AtomicBool::new(dirty),
        })
    }

    fn pinned(&self) -> bool {
        self.pins.load(Ordering::Relaxed) > 0
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }
}

/// Pin handle for one page. The pin is released on drop; a write-intent
/// handle marks the page dirty when released.
#[derive(Debug)]
pub struct PageGuard {
    frame: Arc<Frame>,
    intent: Intent,
}

impl PageGuard {
    fn new(frame: Arc<Frame>, intent: Intent) -> Self {
        frame.pins.fetch_add(1, Ordering::Relaxed);
        Self { frame, intent }
    }

    pub fn page_id(&self) -> PageId {
        self.frame.page_id
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Immutable view of the page bytes.
    pub fn bytes(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.buf.read()
    }

    /// Mutable view of the page bytes. Requires write intent.
    pub fn bytes_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        debug_assert!(
            matches!(self.intent, Intent::Write),
            "mutable access through a read pin"
        );
        self.frame.buf.write()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if matches!(self.intent, Intent::Write) {
            self.frame.dirty.store(true, Ordering::Relaxed);
        }
        self.frame.pins.fetch_sub(1, Ordering::Relaxed);
    }
}

struct PagerInner {
    /// Unbounded LRU map; the pager enforces `capacity` itself so that
    /// eviction can respect pin counts and write dirty victims back.
    cache: LruCache<PageId, Arc<Frame>>,
    free_head: PageId,
    page_count: u64,
}

/// Maps page ids to cached buffers over a [`BinaryFile`].
///
/// Holds at most `capacity` resident pages. On a miss with a full cache the
/// least-recently-used unpinned clean page is evicted first; failing that,
/// the least-recently-used unpinned dirty page is written back and evicted;
/// if every resident page is pinned the operation fails.
pub struct Pager {
    file: BinaryFile,
    page_size: usize,
    capacity: usize,
    writable: bool,
    inner: Mutex<PagerInner>,
}

impl Pager {
    pub fn new(
        file: BinaryFile,
        page_size: usize,
        capacity: usize,
        free_head: PageId,
        page_count: u64,
        writable: bool,
    ) -> Self {
        Self {
            file,
            page_size,
            capacity,
            writable,
            inner: Mutex::new(PagerInner {
                cache: LruCache::unbounded(),
                free_head,
                page_count,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn page_count(&self) -> u64 {
        self.inner.lock().page_count
    }

    pub fn free_head(&self) -> PageId {
        self.inner.lock().free_head
    }

    pub fn file(&self) -> &BinaryFile {
        &self.file
    }

    /// Bring `page_id` into the cache (if absent) and pin it.
    pub fn pin(&self, page_id: PageId, intent: Intent) -> Result<PageGuard> {
        if matches!(intent, Intent::Write) && !self.writable {
            return Err(Error::Logic("write pin on a read-only tree".to_string()));
        }
        let mut inner = self.inner.lock();
        let frame = self.lookup(&mut inner, page_id)?;
        Ok(PageGuard::new(frame, intent))
    }

    /// Allocate a fresh page: reuse the free-list head when available,
    /// otherwise extend the file by one page. The page comes back
    /// zero-initialized, stamped as a level-`level` node, dirty, and pinned
    /// for writing.
    pub fn allocate(&self, level: u16) -> Result<PageGuard> {
        if !self.writable {
            return Err(Error::Logic("allocate on a read-only tree".to_string()));
        }
        let mut inner = self.inner.lock();
        let frame = if inner.free_head != 0 {
            let page_id = inner.free_head;
            let frame = self.lookup(&mut inner, page_id)?;
            {
                let mut buf = frame.buf.write();
                if !node_is_free(&buf) {
                    return Err(Error::Format(format!(
                        "free-list head {page_id} is not marked free"
                    )));
                }
                inner.free_head = node_next(&buf);
                buf.fill(0);
                node_init(&mut buf, page_id, level);
            }
            frame.dirty.store(true, Ordering::Relaxed);
            frame
        } else {
            self.make_room(&mut inner)?;
            let page_id = inner.page_count;
            inner.page_count += 1;
            let mut buf = vec![0u8; self.page_size].into_boxed_slice();
            node_init(&mut buf, page_id, level);
            let frame = Frame::new(page_id, buf, true);
            inner.cache.put(page_id, Arc::clone(&frame));
            frame
        };
        Ok(PageGuard::new(frame, Intent::Write))
    }

    /// Return `page_id` to the free list. Freeing a page that is already on
    /// the list is a logic error.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        if !self.writable {
            return Err(Error::Logic("free on a read-only tree".to_string()));
        }
        let mut inner = self.inner.lock();
        if page_id == 0 || page_id >= inner.page_count {
            return Err(Error::Logic(format!("free of invalid page {page_id}")));
        }
        let frame = self.lookup(&mut inner, page_id)?;
        {
            let mut buf = frame.buf.write();
            if node_is_free(&buf) {
                return Err(Error::Logic(format!("double free of page {page_id}")));
            }
            node_mark_free(&mut buf, page_id, inner.free_head);
        }
        frame.dirty.store(true, Ordering::Relaxed);
        inner.free_head = page_id;
        Ok(())
    }

    /// Write every dirty page back, free-list nodes after live nodes, then
    /// the header page.
    pub fn flush_with_header(&self, header: &[u8]) -> Result<()> {
        debug_assert_eq!(header.len(), self.page_size);
        let inner = self.inner.lock();

        let mut live = Vec::new();
        let mut freed = Vec::new();
        for (_, frame) in inner.cache.iter() {
            if !frame.is_dirty() {
                continue;
            }
            if node_is_free(&frame.buf.read()) {
                freed.push(Arc::clone(frame));
            } else {
                live.push(Arc::clone(frame));
            }
        }
        for frame in live.iter().chain(freed.iter()) {
            self.write_back(frame)?;
        }
        self.file.write_at(0, header)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Walk the free list, verifying markers and the absence of cycles.
    /// Returns the chain length.
    pub fn validate_free_list(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut current = inner.free_head;
        let mut steps = 0u64;
        let limit = inner.page_count;
        while current != 0 {
            if steps >= limit {
                return Err(Error::Format("free-list cycle detected".to_string()));
            }
            if current >= inner.page_count {
                return Err(Error::Format(format!(
                    "free-list entry {current} out of bounds"
                )));
            }
            let frame = self.lookup(&mut inner, current)?;
            let buf = frame.buf.read();
            if !node_is_free(&buf) {
                return Err(Error::Format(format!(
                    "free-list entry {current} is not marked free"
                )));
            }
            current = node_next(&buf);
            steps += 1;
        }
        Ok(steps)
    }

    fn lookup(&self, inner: &mut PagerInner, page_id: PageId) -> Result<Arc<Frame>> {
        if page_id == 0 || page_id >= inner.page_count {
            return Err(Error::Format(format!(
                "page {page_id} out of bounds (file holds {} pages)",
                inner.page_count
            )));
        }
        if let Some(frame) = inner.cache.get(&page_id) {
            return Ok(Arc::clone(frame));
        }
        self.make_room(inner)?;
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        self.file.read_at(page_id * self.page_size as u64, &mut buf)?;
        if !node_is_free(&buf) && node_page_id(&buf) != page_id {
            return Err(Error::Format(format!(
                "node header of page {page_id} carries id {}",
                node_page_id(&buf)
            )));
        }
        let frame = Frame::new(page_id, buf, false);
        inner.cache.put(page_id, Arc::clone(&frame));
        Ok(frame)
    }

    /// Evict until a fresh page can be admitted. Prefers the LRU unpinned
    /// clean page; otherwise writes back and evicts the LRU unpinned dirty
    /// page; fails when everything resident is pinned.
    fn make_room(&self, inner: &mut PagerInner) -> Result<()> {
        while inner.cache.len() >= self.capacity {
            // `iter()` runs most-recently-used first, so `last()` picks the
            // least-recently-used candidate.
            let clean = inner
                .cache
                .iter()
                .filter(|(_, f)| !f.pinned() && !f.is_dirty())
                .last()
                .map(|(id, _)| *id);
            let victim = match clean {
                Some(id) => id,
                None => {
                    let dirty = inner
                        .cache
                        .iter()
                        .filter(|(_, f)| !f.pinned())
                        .last()
                        .map(|(id, _)| *id);
                    match dirty {
                        Some(id) => id,
                        None => {
                            return Err(Error::CacheExhausted {
                                capacity: self.capacity,
                            })
                        }
                    }
                }
            };
            let frame = inner.cache.pop(&victim).unwrap();
            if frame.is_dirty() {
                self.write_back(&frame)?;
            }
        }
        Ok(())
    }

    fn write_back(&self, frame: &Frame) -> Result<()> {
        let buf = frame.buf.read();
        self.file
            .write_at(frame.page_id * self.page_size as u64, &buf)?;
        frame.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }
}
