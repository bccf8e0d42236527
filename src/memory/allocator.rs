//! The buffer allocator
//!
//! Public surface over the buffer cache, the residency set, and the
//! driver: page-aligned malloc with best-fit reuse, pressure-driven
//! eviction against `gc_limit`, idle retention capped by `max_pool_size`,
//! and wired-memory budgeting. One mutex serializes counters, cache, and
//! residency state; it is released around driver allocation and release
//! calls so slow driver operations do not head-of-line-block other
//! tensor-op threads.

use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{
    DeviceDriver, DeviceInfo, HeapDriver, PARAVIRTUAL_DEVICE_NAME, RESOURCE_OPTIONS,
};
use crate::error::{AllocError, AllocResult};
use crate::memory::cache::BufferCache;
use crate::memory::residency::ResidencySet;
use crate::memory::Buffer;

/// Requests under this many bytes target the sub-heap first
const DEFAULT_SMALL_SIZE: usize = 1 << 15;

/// Fixed size of the small-buffer sub-heap
const DEFAULT_HEAP_SIZE: usize = 1 << 26;

/// Tunables fixed at allocator construction
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Threshold under which allocations try the sub-heap
    pub small_size: usize,
    /// Bytes reserved for the sub-heap
    pub heap_size: usize,
    /// Initial wired-memory budget
    pub wired_limit: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            small_size: DEFAULT_SMALL_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            wired_limit: 0,
        }
    }
}

impl AllocatorConfig {
    pub fn with_small_size(mut self, small_size: usize) -> Self {
        self.small_size = small_size;
        self
    }

    pub fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    pub fn with_wired_limit(mut self, wired_limit: usize) -> Self {
        self.wired_limit = wired_limit;
        self
    }
}

/// State guarded by the allocator mutex
#[derive(Debug)]
struct AllocatorState {
    cache: BufferCache,
    residency: ResidencySet,
    /// Bytes handed out and not yet freed
    active_memory: usize,
    /// Historical maximum of `active_memory`
    peak_memory: usize,
    /// Raw driver resources alive: in-use + cached + the sub-heap
    num_resources: usize,
    /// Soft cap on active + cached bytes
    block_limit: usize,
    /// Pressure threshold that triggers cache eviction
    gc_limit: usize,
    /// Upper bound on cached bytes
    max_pool_size: usize,
    /// Wired-memory budget
    wired_limit: usize,
}

/// Page-aligned, size-indexed, LRU-ordered buffer allocator
#[derive(Debug)]
pub struct BufferAllocator {
    device: Arc<dyn DeviceDriver>,
    heap: Option<Arc<dyn HeapDriver>>,
    page_size: usize,
    small_size: usize,
    max_buffer_length: usize,
    resource_limit: usize,
    recommended_working_set: usize,
    state: Mutex<AllocatorState>,
}

impl BufferAllocator {
    /// Allocator with default tunables
    pub fn new(device: Arc<dyn DeviceDriver>) -> Self {
        Self::with_config(device, AllocatorConfig::default())
    }

    /// Allocator with explicit tunables
    ///
    /// Reads the device property table once, derives the memory limits,
    /// creates the sub-heap (unless the device is the paravirtual one,
    /// where heap semantics are unreliable), and registers the heap's
    /// backing region with the residency set.
    pub fn with_config(device: Arc<dyn DeviceDriver>, config: AllocatorConfig) -> Self {
        let _scratch = device.scratch_scope();
        let info = device.info().clone();
        let memsize = info.memory_size as f64;
        let max_rec = info.max_recommended_working_set_size as f64;
        let block_limit = (1.5 * max_rec).min(0.95 * memsize) as usize;
        let gc_limit = ((0.95 * max_rec) as usize).min(block_limit);

        let mut residency = ResidencySet::new(device.residency(), config.wired_limit);
        let mut heap = None;
        let mut num_resources = 0;
        if info.device_name != PARAVIRTUAL_DEVICE_NAME {
            if let Some(created) = device.new_heap(config.heap_size, RESOURCE_OPTIONS) {
                if let Some(region) = created.region() {
                    residency.insert(&region);
                }
                num_resources += 1;
                heap = Some(created);
            }
        }

        tracing::debug!(
            device_name = %info.device_name,
            block_limit,
            gc_limit,
            heap = heap.is_some(),
            "buffer allocator created"
        );

        BufferAllocator {
            device,
            heap,
            page_size: info.page_size,
            small_size: config.small_size,
            max_buffer_length: info.max_buffer_length,
            resource_limit: info.resource_limit,
            recommended_working_set: info.max_recommended_working_set_size,
            state: Mutex::new(AllocatorState {
                cache: BufferCache::new(info.page_size),
                residency,
                active_memory: 0,
                peak_memory: 0,
                num_resources,
                block_limit,
                gc_limit,
                max_pool_size: block_limit,
                wired_limit: config.wired_limit,
            }),
        }
    }

    /// Allocate a GPU-addressable buffer of at least `size` bytes
    ///
    /// Zero-size requests return the null buffer (drivers reject empty
    /// buffers). Requests above `page_size` are rounded up to the next
    /// page multiple so recycled buffers match future requests; sub-page
    /// requests are not padded because the sub-heap handles them. Driver
    /// out-of-memory also returns the null buffer; the caller decides
    /// whether to retry or shrink its working set.
    ///
    /// # Errors
    /// - `BufferTooLarge` when `size` exceeds the driver's maximum
    /// - `ResourceLimitExceeded` when the live resource count stays at the
    ///   driver limit even after evicting the cache
    pub fn malloc(&self, size: usize) -> AllocResult<Buffer> {
        if size == 0 {
            return Ok(Buffer::null());
        }
        if size > self.max_buffer_length {
            return Err(AllocError::BufferTooLarge {
                requested: size,
                max: self.max_buffer_length,
            });
        }
        let size = if size > self.page_size {
            self.page_size * size.div_ceil(self.page_size)
        } else {
            size
        };

        let mut state = self.state.lock()?;
        let buf = match state.cache.reuse_from_cache(size) {
            Some(buf) => buf,
            None => {
                let mem_required = state.active_memory + state.cache.pool_size() + size;
                let _scratch = self.device.scratch_scope();

                // Under memory pressure or at the resource ceiling,
                // reclaim from the cache first. Resource pressure with no
                // byte pressure drains the whole cache.
                if mem_required >= state.gc_limit || state.num_resources >= self.resource_limit {
                    let min_bytes = mem_required
                        .checked_sub(state.gc_limit)
                        .unwrap_or(usize::MAX);
                    let st = &mut *state;
                    st.num_resources -=
                        st.cache.release_cached_buffers(min_bytes, &mut st.residency);
                }
                if state.num_resources >= self.resource_limit {
                    return Err(AllocError::ResourceLimitExceeded(self.resource_limit));
                }

                // Driver calls may be slow and need no shared state; the
                // buffer in flight is invisible to other threads until
                // the lock is retaken.
                drop(state);
                let mut created = None;
                if size < self.small_size {
                    if let Some(heap) = &self.heap {
                        created = heap.new_buffer(size, RESOURCE_OPTIONS);
                    }
                }
                if created.is_none() {
                    created = self.device.new_buffer(size, RESOURCE_OPTIONS);
                }
                let Some(buf) = created else {
                    tracing::warn!(size, "driver out of memory, returning null buffer");
                    return Ok(Buffer::null());
                };

                state = self.state.lock()?;
                state.num_resources += 1;
                if !buf.is_heap() {
                    state.residency.insert(&buf);
                }
                buf
            }
        };

        state.active_memory += buf.length();
        state.peak_memory = state.peak_memory.max(state.active_memory);

        // Maintain the cache below the requested limit
        if state.cache.pool_size() > state.max_pool_size {
            let _scratch = self.device.scratch_scope();
            let excess = state.cache.pool_size() - state.max_pool_size;
            let st = &mut *state;
            st.num_resources -= st.cache.release_cached_buffers(excess, &mut st.residency);
        }

        Ok(Buffer::from_raw(buf))
    }

    /// Return a buffer to the allocator
    ///
    /// Recycles into the cache while the cache is under `max_pool_size`,
    /// otherwise releases straight to the driver (outside the lock). Null
    /// buffers are a no-op. Never raises.
    pub fn free(&self, buffer: Buffer) {
        let Some(buf) = buffer.into_raw() else {
            return;
        };
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.active_memory = state.active_memory.saturating_sub(buf.length());
        if state.cache.pool_size() < state.max_pool_size {
            state.cache.recycle_to_cache(buf);
            // The recycled buffer lands at the head; trim the tail so the
            // cache never sits above its cap between calls
            if state.cache.pool_size() > state.max_pool_size {
                let _scratch = self.device.scratch_scope();
                let excess = state.cache.pool_size() - state.max_pool_size;
                let st = &mut *state;
                let released = st.cache.release_cached_buffers(excess, &mut st.residency);
                st.num_resources = st.num_resources.saturating_sub(released);
            }
        } else {
            state.num_resources = state.num_resources.saturating_sub(1);
            if !buf.is_heap() {
                state.residency.erase(&buf);
            }
            drop(state);
            let _scratch = self.device.scratch_scope();
            drop(buf);
        }
    }

    /// Driver-reported length of `buffer` in bytes
    ///
    /// This is the page-aligned truth, not the requested size. Zero for
    /// the null buffer.
    pub fn size(&self, buffer: &Buffer) -> usize {
        buffer.raw_ref().map(|buf| buf.length()).unwrap_or(0)
    }

    /// Cap the bytes the cache may retain; returns the previous limit
    ///
    /// Shrinks the cache immediately when the new limit is below the
    /// current pool size.
    pub fn set_cache_limit(&self, mut limit: usize) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut limit, &mut state.max_pool_size);
        if state.cache.pool_size() > state.max_pool_size {
            let _scratch = self.device.scratch_scope();
            let excess = state.cache.pool_size() - state.max_pool_size;
            let st = &mut *state;
            st.num_resources -= st.cache.release_cached_buffers(excess, &mut st.residency);
        }
        limit
    }

    /// Set the soft cap on active + cached bytes; returns the previous
    /// limit and re-derives the eviction threshold
    pub fn set_memory_limit(&self, mut limit: usize) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut limit, &mut state.block_limit);
        state.gc_limit = state
            .block_limit
            .min((0.95 * self.recommended_working_set as f64) as usize);
        limit
    }

    /// Current soft cap on active + cached bytes
    pub fn get_memory_limit(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .block_limit
    }

    /// Set the wired-memory budget; returns the previous one
    ///
    /// Re-derives the eviction threshold and resizes the residency set,
    /// re-wiring oldest-inserted buffers first.
    ///
    /// # Errors
    /// `WiredLimitTooLarge` when `limit` exceeds the recommended working
    /// set size.
    pub fn set_wired_limit(&self, mut limit: usize) -> AllocResult<usize> {
        if limit > self.recommended_working_set {
            return Err(AllocError::WiredLimitTooLarge {
                requested: limit,
                max: self.recommended_working_set,
            });
        }
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::swap(&mut limit, &mut state.wired_limit);
        state.gc_limit = state
            .block_limit
            .min((0.95 * self.recommended_working_set as f64) as usize);
        let new_limit = state.wired_limit;
        state.residency.resize(new_limit);
        Ok(limit)
    }

    /// Release every cached buffer
    pub fn clear_cache(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _scratch = self.device.scratch_scope();
        let st = &mut *state;
        let released = st.cache.clear(&mut st.residency);
        st.num_resources = st.num_resources.saturating_sub(released);
    }

    /// Bytes handed out and not yet freed
    pub fn get_active_memory(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active_memory
    }

    /// Historical maximum of active bytes since the last reset
    pub fn get_peak_memory(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peak_memory
    }

    /// Reset the peak to the current active bytes
    pub fn reset_peak_memory(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.peak_memory = state.active_memory;
    }

    /// Bytes currently held by the cache
    pub fn get_cache_memory(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cache
            .pool_size()
    }

    /// Count of live driver resources (in-use + cached + sub-heap)
    pub fn num_resources(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .num_resources
    }

    /// The device property table read at startup
    pub fn device_info(&self) -> &DeviceInfo {
        self.device.info()
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        // Cached buffers go back to the driver inside a scratch scope.
        // The process-wide instance is leaked and never reaches this
        // path; it exists for embedder-owned allocators and must not
        // panic.
        let _scratch = self.device.scratch_scope();
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        state.cache.clear(&mut state.residency);
    }
}
