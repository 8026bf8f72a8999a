//! Bounded LRU cache of pages on top of the [`super::pager::Pager`].
//!
//! Generalizes the page cache `cryo::storage::pager::Pager` keeps inline (a
//! `VecDeque` of `(page_id, Page)` flushed when it overflows) into its own
//! component with real LRU eviction, pin/dirty tracking, and observable
//! statistics.
use std::collections::HashMap;

use log::{debug, trace, warn};
use thiserror::Error;

use super::page::{Page, PageType};
use super::pager::{Pager, PagerError};

pub const MIN_POOL_SIZE: usize = 16;
pub const DEFAULT_POOL_SIZE: usize = 1024;
/// Fraction of the pool proactively flushed once dirty pages exceed it.
pub const FLUSH_RATIO: f64 = 0.25;

#[derive(Debug, Error)]
pub enum BufferPoolError {
    #[error("pager error: {0}")]
    Pager(#[from] PagerError),
    #[error("buffer pool exhausted: all {0} slots are pinned")]
    PoolExhausted(usize),
    #[error("page {0} is not cached")]
    NotCached(u32),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BufferPoolStats {
    pub fetch_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub write_count: u64,
}

struct Frame {
    page: Page,
    last_access: u64,
}

/// LRU-ordered cache of pages, keyed by page id. `last_access` is a logical
/// clock (incremented on every touch) rather than a wall clock, since the
/// pool is only ever touched from the single thread that owns the database.
pub struct BufferPool {
    pager: Pager,
    frames: HashMap<u32, Frame>,
    capacity: usize,
    clock: u64,
    stats: BufferPoolStats,
}

impl BufferPool {
    pub fn new(pager: Pager, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_POOL_SIZE);
        Self {
            pager,
            frames: HashMap::with_capacity(capacity),
            capacity,
            clock: 0,
            stats: BufferPoolStats::default(),
        }
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.stats
    }

    pub fn cached_pages(&self) -> usize {
        self.frames.len()
    }

    pub fn dirty_pages(&self) -> usize {
        self.frames.values().filter(|f| f.page.is_dirty()).count()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Fetches a page, pinning it. A cache hit touches LRU order; a miss loads
    /// through the pager and may evict to make room.
    pub fn fetch_page(&mut self, id: u32) -> Result<&mut Page, BufferPoolError> {
        self.stats.fetch_count += 1;
        if self.frames.contains_key(&id) {
            self.stats.hit_count += 1;
        } else {
            self.stats.miss_count += 1;
            if !self.frames.contains_key(&id) && self.frames.len() >= self.capacity {
                self.evict_one()?;
            }
            let page = self.pager.read_page(id)?;
            let clock = self.tick();
            self.frames.insert(
                id,
                Frame {
                    page,
                    last_access: clock,
                },
            );
        }
        let clock = self.tick();
        let frame = self.frames.get_mut(&id).expect("just inserted or present");
        frame.last_access = clock;
        frame.page.pin();
        Ok(&mut frame.page)
    }

    /// Allocates a new page via the pager and inserts it pinned and dirty.
    pub fn allocate_page(&mut self, page_type: PageType) -> Result<&mut Page, BufferPoolError> {
        if self.frames.len() >= self.capacity {
            self.evict_one()?;
        }
        let mut page = self.pager.allocate_page(page_type)?;
        page.pin();
        page.set_flag(super::page::FLAG_DIRTY);
        let id = page.page_id();
        let clock = self.tick();
        self.frames.insert(id, Frame {
            page,
            last_access: clock,
        });
        Ok(&mut self.frames.get_mut(&id).unwrap().page)
    }

    /// Reads a page without pinning it, for diagnostics.
    pub fn peek_page(&self, id: u32) -> Option<&Page> {
        self.frames.get(&id).map(|f| &f.page)
    }

    pub fn pin_page(&mut self, id: u32) -> Result<(), BufferPoolError> {
        let frame = self.frames.get_mut(&id).ok_or(BufferPoolError::NotCached(id))?;
        frame.page.pin();
        Ok(())
    }

    pub fn unpin_page(&mut self, id: u32) -> Result<(), BufferPoolError> {
        let frame = self.frames.get_mut(&id).ok_or(BufferPoolError::NotCached(id))?;
        frame.page.unpin();
        Ok(())
    }

    pub fn mark_dirty(&mut self, id: u32) -> Result<(), BufferPoolError> {
        let frame = self.frames.get_mut(&id).ok_or(BufferPoolError::NotCached(id))?;
        frame.page.set_flag(super::page::FLAG_DIRTY);
        self.maybe_flush_dirty_ratio()
    }

    pub fn flush_page(&mut self, id: u32) -> Result<(), BufferPoolError> {
        let frame = self.frames.get_mut(&id).ok_or(BufferPoolError::NotCached(id))?;
        if frame.page.is_dirty() {
            self.pager.write_page(&frame.page)?;
            frame.page.mark_clean();
            self.stats.write_count += 1;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<(), BufferPoolError> {
        let ids: Vec<u32> = self.frames.keys().copied().collect();
        for id in ids {
            self.flush_page(id)?;
        }
        self.pager.flush()?;
        Ok(())
    }

    fn maybe_flush_dirty_ratio(&mut self) -> Result<(), BufferPoolError> {
        let threshold = (self.capacity as f64 * FLUSH_RATIO) as usize;
        if self.dirty_pages() > threshold {
            debug!("dirty pages exceed flush ratio; proactively flushing");
            let ids: Vec<u32> = self
                .frames
                .iter()
                .filter(|(_, f)| f.page.is_dirty() && f.page.pin_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                self.flush_page(id)?;
            }
        }
        Ok(())
    }

    /// Explicitly evicts one page, flushing it first if dirty.
    pub fn evict_page(&mut self, id: u32) -> Result<(), BufferPoolError> {
        {
            let frame = self.frames.get(&id).ok_or(BufferPoolError::NotCached(id))?;
            if frame.page.pin_count() > 0 {
                return Err(BufferPoolError::PoolExhausted(1));
            }
        }
        self.flush_page(id)?;
        self.frames.remove(&id);
        Ok(())
    }

    fn evict_one(&mut self) -> Result<(), BufferPoolError> {
        let victim = self
            .frames
            .iter()
            .filter(|(_, f)| f.page.pin_count() == 0)
            .min_by_key(|(_, f)| f.last_access)
            .map(|(id, _)| *id);

        match victim {
            Some(id) => {
                trace!("evicting page {id}");
                self.flush_page(id)?;
                self.frames.remove(&id);
                Ok(())
            }
            None => {
                warn!("buffer pool exhausted: {} pages all pinned", self.frames.len());
                Err(BufferPoolError::PoolExhausted(self.frames.len()))
            }
        }
    }

    pub fn prefetch(&mut self, ids: &[u32]) -> Result<(), BufferPoolError> {
        for &id in ids {
            self.fetch_page(id)?;
            self.unpin_page(id)?;
        }
        Ok(())
    }

    pub fn clear_cache(&mut self) -> Result<(), BufferPoolError> {
        self.flush_all()?;
        self.frames.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn pool(capacity: usize) -> (TempDir, BufferPool) {
        let temp = TempDir::new("bufferpool").unwrap();
        let pager = Pager::create(temp.path().join("db"), super::super::page::DEFAULT_PAGE_SIZE)
            .unwrap();
        (temp, BufferPool::new(pager, capacity))
    }

    #[test]
    fn fetch_pins_and_caches() {
        let (_tmp, mut pool) = pool(MIN_POOL_SIZE);
        let page = pool.allocate_page(PageType::Data).unwrap();
        let id = page.page_id();
        pool.unpin_page(id).unwrap();

        let fetched = pool.fetch_page(id).unwrap();
        assert_eq!(fetched.page_id(), id);
        assert_eq!(pool.stats().hit_count, 1);
    }

    #[test]
    fn cached_pages_never_exceeds_capacity() {
        let (_tmp, mut pool) = pool(MIN_POOL_SIZE);
        for _ in 0..(MIN_POOL_SIZE * 2) {
            let page = pool.allocate_page(PageType::Data).unwrap();
            let id = page.page_id();
            pool.unpin_page(id).unwrap();
            assert!(pool.cached_pages() <= MIN_POOL_SIZE);
        }
    }

    #[test]
    fn pool_exhausted_when_everything_pinned() {
        let (_tmp, mut pool) = pool(MIN_POOL_SIZE);
        for _ in 0..MIN_POOL_SIZE {
            pool.allocate_page(PageType::Data).unwrap();
        }
        let err = pool.allocate_page(PageType::Data);
        assert!(matches!(err, Err(BufferPoolError::PoolExhausted(_))));
    }

    #[test]
    fn unpin_without_pin_fails_loudly() {
        let (_tmp, mut pool) = pool(MIN_POOL_SIZE);
        let page = pool.allocate_page(PageType::Data).unwrap();
        let id = page.page_id();
        pool.unpin_page(id).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.unpin_page(id).unwrap();
        }));
        assert!(result.is_err());
    }
}
