//! Bounded LRU cache over page images.
//!
//! Capacity is expressed in bytes and converted into a frame count. Dirty
//! frames are written back through a caller-supplied flush callback; eviction
//! prefers the least-recently-used clean frame and only flushes a dirty one
//! when no clean frame exists.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::{DirError, Result};

use super::{Page, PageId};

/// Default buffer pool capacity in bytes.
pub const DEFAULT_POOL_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
struct Frame {
    page: Page,
    dirty: bool,
}

/// Write-back page cache.
#[derive(Debug)]
pub struct BufferPool {
    frames: LruCache<PageId, Frame>,
    capacity: usize,
}

pub type FlushFn<'a> = dyn FnMut(&Page) -> Result<()> + 'a;

impl BufferPool {
    /// Creates a pool holding `capacity_bytes / page_size` frames (at least one).
    pub fn new(capacity_bytes: u64, page_size: u32) -> Result<Self> {
        let frames = (capacity_bytes / u64::from(page_size)).max(1) as usize;
        let capacity = NonZeroUsize::new(frames).ok_or_else(|| {
            DirError::InvalidArgument("buffer pool capacity must be non-zero".into())
        })?;
        Ok(Self {
            frames: LruCache::new(capacity),
            capacity: frames,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.frames.iter().filter(|(_, f)| f.dirty).count()
    }

    /// Fetches a page, promoting it to most-recently-used.
    pub fn get(&mut self, id: PageId) -> Option<&Page> {
        self.frames.get(&id).map(|f| &f.page)
    }

    /// Inserts or replaces a page. A replaced frame keeps its dirty bit if
    /// the incoming write is clean (a read must not hide a pending write).
    pub fn put(&mut self, page: Page, dirty: bool, flush: &mut FlushFn<'_>) -> Result<()> {
        let id = page.id;
        if let Some(frame) = self.frames.get_mut(&id) {
            let keep_dirty = frame.dirty || dirty;
            frame.page = page;
            frame.dirty = keep_dirty;
            return Ok(());
        }
        if self.frames.len() >= self.capacity {
            self.evict_one(flush)?;
        }
        self.frames.push(id, Frame { page, dirty });
        Ok(())
    }

    /// Marks a cached page dirty.
    pub fn mark_dirty(&mut self, id: PageId) {
        if let Some(frame) = self.frames.get_mut(&id) {
            frame.dirty = true;
        }
    }

    /// Drops a frame without flushing. Used when the page is freed.
    pub fn remove(&mut self, id: PageId) {
        self.frames.pop(&id);
    }

    /// Writes every dirty frame through `flush` and clears the dirty bits.
    pub fn flush_all(&mut self, flush: &mut FlushFn<'_>) -> Result<()> {
        let dirty_ids: Vec<PageId> = self
            .frames
            .iter()
            .filter_map(|(&id, f)| if f.dirty { Some(id) } else { None })
            .collect();
        for id in dirty_ids {
            if let Some(frame) = self.frames.peek(&id) {
                flush(&frame.page)?;
            }
            if let Some(frame) = self.frames.get_mut(&id) {
                frame.dirty = false;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    fn evict_one(&mut self, flush: &mut FlushFn<'_>) -> Result<()> {
        // lru iterates most-recently-used first; the last clean frame seen is
        // therefore the least-recently-used clean one.
        let mut victim_clean: Option<PageId> = None;
        for (&id, frame) in self.frames.iter() {
            if !frame.dirty {
                victim_clean = Some(id);
            }
        }
        if let Some(id) = victim_clean {
            self.frames.pop(&id);
            return Ok(());
        }
        // All frames dirty: flush the LRU frame, then evict it.
        if let Some((_, frame)) = self.frames.pop_lru() {
            flush(&frame.page)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::PageType;

    fn page(id: PageId) -> Page {
        let mut page = Page::new(id, PageType::Data, 64);
        page.payload[0] = id as u8;
        page
    }

    fn no_flush() -> impl FnMut(&Page) -> Result<()> {
        |_page: &Page| panic!("flush should not run")
    }

    #[test]
    fn caches_and_promotes() {
        let mut pool = BufferPool::new(4 * 4096, 4096).expect("pool");
        assert_eq!(pool.capacity(), 4);
        pool.put(page(1), false, &mut no_flush()).expect("put");
        pool.put(page(2), true, &mut no_flush()).expect("put");
        assert_eq!(pool.get(1).expect("hit").payload[0], 1);
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn eviction_prefers_clean_frames() {
        let mut pool = BufferPool::new(2 * 4096, 4096).expect("pool");
        pool.put(page(1), true, &mut no_flush()).expect("put dirty");
        pool.put(page(2), false, &mut no_flush()).expect("put clean");
        // Touch the clean page so it is most recently used; it must still be
        // the eviction victim because the other frame is dirty.
        pool.get(2);
        pool.put(page(3), false, &mut no_flush()).expect("trigger eviction");
        assert!(pool.get(1).is_some(), "dirty frame survives");
        assert!(pool.get(2).is_none(), "clean frame evicted");
    }

    #[test]
    fn all_dirty_eviction_flushes_lru() {
        let mut pool = BufferPool::new(2 * 4096, 4096).expect("pool");
        let mut flushed: Vec<PageId> = Vec::new();
        let mut flush = |p: &Page| {
            flushed.push(p.id);
            Ok(())
        };
        pool.put(page(1), true, &mut flush).expect("put");
        pool.put(page(2), true, &mut flush).expect("put");
        pool.put(page(3), true, &mut flush).expect("evicting put");
        assert_eq!(flushed, vec![1], "LRU dirty frame flushed before eviction");
        assert!(pool.get(2).is_some());
        assert!(pool.get(3).is_some());
    }

    #[test]
    fn clean_put_does_not_clear_dirty_bit() {
        let mut pool = BufferPool::new(4 * 4096, 4096).expect("pool");
        pool.put(page(1), true, &mut no_flush()).expect("dirty put");
        pool.put(page(1), false, &mut no_flush()).expect("clean re-put");
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn flush_all_clears_dirty_bits() {
        let mut pool = BufferPool::new(4 * 4096, 4096).expect("pool");
        let mut flushed = 0usize;
        let mut flush = |_: &Page| {
            flushed += 1;
            Ok(())
        };
        pool.put(page(1), true, &mut flush).expect("put");
        pool.put(page(2), true, &mut flush).expect("put");
        pool.flush_all(&mut flush).expect("flush all");
        assert_eq!(flushed, 2);
        assert_eq!(pool.dirty_count(), 0);
    }
}
