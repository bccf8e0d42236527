//! Size-indexed, LRU-ordered cache of freed buffers
//!
//! Every cache entry belongs to two structures at once: a size-indexed
//! multimap (best-fit lookup) and a doubly-linked LRU list from head (most
//! recently freed) to tail (eviction candidate). Entries live in a slab and
//! link by index, so links stay valid as the slab grows. An entry is either
//! in both structures or in neither, and `pool_size` is always the sum of
//! cached lengths.
//!
//! The cache is not synchronized; the owning allocator serializes access
//! under its mutex.

use std::collections::{BTreeMap, VecDeque};

use crate::backend::RawBuffer;
use crate::memory::residency::ResidencySet;

/// Fraction of the pool above which a partial release degrades to `clear`
const CLEAR_FRACTION: f64 = 0.9;

#[derive(Debug)]
struct Entry {
    buf: Option<RawBuffer>,
    len: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Recycling pool of previously-freed buffers
#[derive(Debug)]
pub struct BufferCache {
    page_size: usize,
    entries: Vec<Entry>,
    free_slots: Vec<usize>,
    /// length -> slab slots, oldest-recycled first within a size class
    buckets: BTreeMap<usize, VecDeque<usize>>,
    head: Option<usize>,
    tail: Option<usize>,
    pool_size: usize,
}

impl BufferCache {
    pub fn new(page_size: usize) -> Self {
        BufferCache {
            page_size,
            entries: Vec::new(),
            free_slots: Vec::new(),
            buckets: BTreeMap::new(),
            head: None,
            tail: None,
            pool_size: 0,
        }
    }

    /// Total bytes currently held by the cache
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of cached buffers
    pub fn entry_count(&self) -> usize {
        self.buckets.values().map(|slots| slots.len()).sum()
    }

    /// Best-fit lookup: the smallest cached buffer with
    /// `length in [size, min(2*size, size + 2*page_size))`
    ///
    /// The upper bound caps internal fragmentation at 2x waste while
    /// tolerating two pages of slop near page-boundary sizes. On a hit the
    /// buffer leaves both structures and ownership moves to the caller.
    pub fn reuse_from_cache(&mut self, size: usize) -> Option<RawBuffer> {
        let upper = size
            .saturating_mul(2)
            .min(size.saturating_add(2 * self.page_size));
        let (&len, _) = self.buckets.range(size..).next()?;
        if len >= upper {
            return None;
        }
        let slot = self.pop_bucket_front(len)?;
        self.unlink(slot);
        let buf = self.release_slot(slot);
        self.pool_size -= len;
        tracing::trace!(requested = size, reused = len, "cache hit");
        Some(buf)
    }

    /// Insert a freed buffer at the LRU head
    ///
    /// The buffer must be unreferenced by any caller; the cache takes
    /// ownership.
    pub fn recycle_to_cache(&mut self, buf: RawBuffer) {
        let len = buf.length();
        let slot = self.alloc_slot(buf, len);
        self.link_at_head(slot);
        self.buckets.entry(len).or_default().push_back(slot);
        self.pool_size += len;
    }

    /// Release buffers from the LRU tail until at least `min_bytes` bytes
    /// are freed or the cache is empty. Returns the number of buffers
    /// released to the driver.
    ///
    /// When nearly everything must go, a full `clear` skips the per-entry
    /// bookkeeping.
    pub fn release_cached_buffers(
        &mut self,
        min_bytes: usize,
        residency: &mut ResidencySet,
    ) -> usize {
        if min_bytes as f64 >= CLEAR_FRACTION * self.pool_size as f64 {
            return self.clear(residency);
        }
        let mut n_release = 0;
        let mut total_freed = 0;
        while total_freed < min_bytes {
            let Some(slot) = self.tail else { break };
            let len = self.entries[slot].len;
            self.remove_from_bucket(len, slot);
            self.unlink(slot);
            let buf = self.release_slot(slot);
            if !buf.is_heap() {
                residency.erase(&buf);
            }
            drop(buf);
            total_freed += len;
            n_release += 1;
        }
        self.pool_size -= total_freed;
        tracing::trace!(
            released = n_release,
            bytes = total_freed,
            "cache eviction sweep"
        );
        n_release
    }

    /// Release every cached buffer, resetting the cache to empty.
    /// Returns the number of buffers released to the driver.
    pub fn clear(&mut self, residency: &mut ResidencySet) -> usize {
        let mut n_release = 0;
        let mut slot = self.head;
        while let Some(idx) = slot {
            slot = self.entries[idx].next;
            if let Some(buf) = self.entries[idx].buf.take() {
                if !buf.is_heap() {
                    residency.erase(&buf);
                }
                n_release += 1;
            }
        }
        self.entries.clear();
        self.free_slots.clear();
        self.buckets.clear();
        self.head = None;
        self.tail = None;
        self.pool_size = 0;
        n_release
    }

    fn alloc_slot(&mut self, buf: RawBuffer, len: usize) -> usize {
        let entry = Entry {
            buf: Some(buf),
            len,
            prev: None,
            next: None,
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    fn release_slot(&mut self, slot: usize) -> RawBuffer {
        self.free_slots.push(slot);
        self.entries[slot]
            .buf
            .take()
            .expect("cache entry released twice")
    }

    fn link_at_head(&mut self, slot: usize) {
        match self.head {
            None => {
                self.head = Some(slot);
                self.tail = Some(slot);
            }
            Some(old_head) => {
                self.entries[old_head].prev = Some(slot);
                self.entries[slot].next = Some(old_head);
                self.head = Some(slot);
            }
        }
    }

    fn unlink(&mut self, slot: usize) {
        let prev = self.entries[slot].prev;
        let next = self.entries[slot].next;
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[slot].prev = None;
        self.entries[slot].next = None;
    }

    fn pop_bucket_front(&mut self, len: usize) -> Option<usize> {
        let slots = self.buckets.get_mut(&len)?;
        let slot = slots.pop_front();
        if slots.is_empty() {
            self.buckets.remove(&len);
        }
        slot
    }

    fn remove_from_bucket(&mut self, len: usize, slot: usize) {
        if let Some(slots) = self.buckets.get_mut(&len) {
            if let Some(pos) = slots.iter().position(|&s| s == slot) {
                slots.remove(pos);
            }
            if slots.is_empty() {
                self.buckets.remove(&len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::RESOURCE_OPTIONS;
    use crate::backend::{DeviceDriver, MockDriver};

    const PAGE: usize = 4096;

    fn buffers(mock: &MockDriver, sizes: &[usize]) -> Vec<RawBuffer> {
        sizes
            .iter()
            .map(|&s| mock.new_buffer(s, RESOURCE_OPTIONS).unwrap())
            .collect()
    }

    impl BufferCache {
        /// Lengths in LRU order, head to tail
        fn lru_lengths(&self) -> Vec<usize> {
            let mut out = Vec::new();
            let mut slot = self.head;
            while let Some(idx) = slot {
                out.push(self.entries[idx].len);
                slot = self.entries[idx].next;
            }
            out
        }

        /// Check the structural invariants the allocator relies on
        fn assert_invariants(&self) {
            // head is None iff tail is None iff empty
            assert_eq!(self.head.is_none(), self.tail.is_none());
            assert_eq!(self.head.is_none(), self.entry_count() == 0);

            // LRU list and multimap hold the same multiset of lengths
            let mut from_list = self.lru_lengths();
            let mut from_map: Vec<usize> = self
                .buckets
                .iter()
                .flat_map(|(&len, slots)| std::iter::repeat(len).take(slots.len()))
                .collect();
            from_list.sort_unstable();
            from_map.sort_unstable();
            assert_eq!(from_list, from_map);

            // pool_size is the sum of cached lengths
            assert_eq!(self.pool_size, from_list.iter().sum::<usize>());

            // prev/next chain is bidirectionally consistent
            let mut slot = self.head;
            let mut prev = None;
            while let Some(idx) = slot {
                assert_eq!(self.entries[idx].prev, prev);
                prev = slot;
                slot = self.entries[idx].next;
            }
            assert_eq!(self.tail, prev);
        }
    }

    #[test]
    fn test_recycle_then_reuse_preserves_identity() {
        let mock = MockDriver::new();
        let mut cache = BufferCache::new(PAGE);
        let bufs = buffers(&mock, &[4096]);
        let id = bufs[0].id();

        cache.recycle_to_cache(bufs.into_iter().next().unwrap());
        cache.assert_invariants();
        assert_eq!(cache.pool_size(), 4096);

        let hit = cache.reuse_from_cache(4096).unwrap();
        assert_eq!(hit.id(), id);
        assert_eq!(cache.pool_size(), 0);
        cache.assert_invariants();
    }

    #[test]
    fn test_best_fit_window() {
        let mock = MockDriver::new();
        let mut cache = BufferCache::new(PAGE);
        for buf in buffers(&mock, &[4096]) {
            cache.recycle_to_cache(buf);
        }
        // A cached 4096 cannot serve a rounded 8192 request
        assert!(cache.reuse_from_cache(8192).is_none());
        // An exact match hits
        assert!(cache.reuse_from_cache(4096).is_some());
        cache.assert_invariants();
    }

    #[test]
    fn test_window_upper_bound_exclusive() {
        let mock = MockDriver::new();
        let mut cache = BufferCache::new(PAGE);
        // Cached buffer of exactly 2x the request is NOT reusable
        for buf in buffers(&mock, &[8192]) {
            cache.recycle_to_cache(buf);
        }
        assert!(cache.reuse_from_cache(4096).is_none());
        // One byte under 2x is
        let mut cache = BufferCache::new(PAGE);
        for buf in buffers(&mock, &[8191]) {
            cache.recycle_to_cache(buf);
        }
        assert!(cache.reuse_from_cache(4096).is_some());
    }

    #[test]
    fn test_large_sizes_capped_at_two_page_slop() {
        let mock = MockDriver::new();
        let mut cache = BufferCache::new(PAGE);
        // For size 16384 the window is [16384, min(32768, 24576)): two
        // pages of slop win over the 2x bound, so a cached 24576 misses
        // while 20480 hits
        for buf in buffers(&mock, &[24576, 20480]) {
            cache.recycle_to_cache(buf);
        }
        let hit = cache.reuse_from_cache(16384).unwrap();
        assert_eq!(hit.length(), 20480);
        assert!(cache.reuse_from_cache(16384).is_none());
        cache.assert_invariants();
    }

    #[test]
    fn test_fifo_within_size_class() {
        let mock = MockDriver::new();
        let mut cache = BufferCache::new(PAGE);
        let bufs = buffers(&mock, &[4096, 4096]);
        let first = bufs[0].id();
        for buf in bufs {
            cache.recycle_to_cache(buf);
        }
        // Equal sizes come back oldest-recycled first
        assert_eq!(cache.reuse_from_cache(4096).unwrap().id(), first);
    }

    #[test]
    fn test_eviction_drains_from_tail() {
        let mock = MockDriver::new();
        let mut rs = ResidencySet::detached();
        let mut cache = BufferCache::new(PAGE);
        let bufs = buffers(&mock, &[4096, 8192, 12288]);
        for buf in bufs {
            cache.recycle_to_cache(buf);
        }
        // Head is 12288 (most recent), tail is 4096
        assert_eq!(cache.lru_lengths(), vec![12288, 8192, 4096]);

        let released = cache.release_cached_buffers(1, &mut rs);
        assert_eq!(released, 1);
        assert_eq!(cache.lru_lengths(), vec![12288, 8192]);
        assert_eq!(cache.pool_size(), 20480);
        cache.assert_invariants();
    }

    #[test]
    fn test_release_stops_once_satisfied() {
        let mock = MockDriver::new();
        let mut rs = ResidencySet::detached();
        let mut cache = BufferCache::new(PAGE);
        for buf in buffers(&mock, &[4096; 8]) {
            cache.recycle_to_cache(buf);
        }
        // 8192 of 32768 requested: two tail entries go, six stay
        let released = cache.release_cached_buffers(8192, &mut rs);
        assert_eq!(released, 2);
        assert_eq!(cache.entry_count(), 6);
        cache.assert_invariants();
    }

    #[test]
    fn test_release_fast_path_clears() {
        let mock = MockDriver::new();
        let mut rs = ResidencySet::detached();
        let mut cache = BufferCache::new(PAGE);
        for buf in buffers(&mock, &[4096; 4]) {
            cache.recycle_to_cache(buf);
        }
        // 15565 >= 0.9 * 16384 so the whole pool goes
        let released = cache.release_cached_buffers(15565, &mut rs);
        assert_eq!(released, 4);
        assert_eq!(cache.pool_size(), 0);
        assert_eq!(cache.entry_count(), 0);
        cache.assert_invariants();
    }

    #[test]
    fn test_clear_releases_to_driver() {
        let mock = MockDriver::new();
        let mut rs = ResidencySet::detached();
        let mut cache = BufferCache::new(PAGE);
        for buf in buffers(&mock, &[4096, 8192]) {
            cache.recycle_to_cache(buf);
        }
        assert_eq!(
            mock.stats()
                .device_releases
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        let released = cache.clear(&mut rs);
        assert_eq!(released, 2);
        assert_eq!(
            mock.stats()
                .device_releases
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
        cache.assert_invariants();
    }

    #[test]
    fn test_slab_slots_are_reused() {
        let mock = MockDriver::new();
        let mut cache = BufferCache::new(PAGE);
        for round in 0..3 {
            for buf in buffers(&mock, &[4096, 8192]) {
                cache.recycle_to_cache(buf);
            }
            assert!(cache.reuse_from_cache(4096).is_some());
            assert!(cache.reuse_from_cache(8192).is_some());
            assert_eq!(cache.entry_count(), 0, "round {round}");
        }
        // Two slots churned three times without growing the slab past two
        assert!(cache.entries.len() <= 2);
    }
}
