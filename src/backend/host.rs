//! Host driver for unified shared memory
//!
//! The shipped backend: every buffer is a page-aligned host allocation,
//! which on a unified-memory platform is GPU-addressable as-is. An
//! outstanding-bytes meter models driver out-of-memory (allocations past
//! `memory_size` return `None`), and the small-buffer sub-heap is a single
//! fixed allocation subdivided by best-fit free-block placement.

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::device::{
    BufferOptions, DeviceDriver, DeviceInfo, HeapDriver, ResidencyDriver,
};
use crate::backend::{BufferDriver, RawBuffer};

/// Default unified memory size assumed when the platform is not probed
const DEFAULT_MEMORY_SIZE: usize = 16 * 1024 * 1024 * 1024;

/// Driver-imposed cap on live resources
const DEFAULT_RESOURCE_LIMIT: usize = 499_000;

/// Virtual memory page size used for alignment
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Sub-allocation alignment within the heap
const HEAP_ALIGNMENT: usize = 256;

/// Free fragments smaller than this are discarded rather than tracked
const MIN_FRAGMENT_SIZE: usize = 64;

/// Outstanding-bytes meter shared by every buffer the driver hands out
#[derive(Debug, Default)]
struct HostMeter {
    outstanding: AtomicUsize,
}

impl HostMeter {
    /// Reserve `size` bytes against `budget`; false when it would not fit
    fn reserve(&self, size: usize, budget: usize) -> bool {
        let mut current = self.outstanding.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(size) else {
                return false;
            };
            if next > budget {
                return false;
            }
            match self.outstanding.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, size: usize) {
        self.outstanding.fetch_sub(size, Ordering::Relaxed);
    }
}

/// Unified shared-memory device driver
#[derive(Debug)]
pub struct HostDriver {
    info: DeviceInfo,
    meter: Arc<HostMeter>,
    residency: Arc<HostResidency>,
}

impl HostDriver {
    /// Driver with the default property table
    pub fn new() -> Self {
        Self::with_info(DeviceInfo {
            device_name: "UMA host device".to_string(),
            memory_size: DEFAULT_MEMORY_SIZE,
            max_buffer_length: DEFAULT_MEMORY_SIZE / 2,
            max_recommended_working_set_size: DEFAULT_MEMORY_SIZE / 4 * 3,
            resource_limit: DEFAULT_RESOURCE_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Driver with an explicit property table
    ///
    /// `page_size` must be a power of two; it is the allocation alignment.
    pub fn with_info(info: DeviceInfo) -> Self {
        assert!(
            info.page_size.is_power_of_two(),
            "page_size must be a power of two, got {}",
            info.page_size
        );
        tracing::debug!(
            device_name = %info.device_name,
            memory_size = info.memory_size,
            page_size = info.page_size,
            "host driver created"
        );
        HostDriver {
            info,
            meter: Arc::new(HostMeter::default()),
            residency: Arc::new(HostResidency::default()),
        }
    }

    /// Bytes currently allocated and not yet released
    pub fn outstanding_bytes(&self) -> usize {
        self.meter.outstanding.load(Ordering::Relaxed)
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for HostDriver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn new_buffer(&self, size: usize, _options: BufferOptions) -> Option<RawBuffer> {
        if size == 0 || size > self.info.max_buffer_length {
            return None;
        }
        if !self.meter.reserve(size, self.info.memory_size) {
            tracing::warn!(size, "host driver out of memory");
            return None;
        }
        let layout = match Layout::from_size_align(size, self.info.page_size) {
            Ok(layout) => layout,
            Err(_) => {
                self.meter.release(size);
                return None;
            }
        };
        // SAFETY: layout has non-zero size and power-of-two alignment.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            self.meter.release(size);
            tracing::warn!(size, "host allocation returned null");
            return None;
        }
        tracing::trace!(size, ptr = ?ptr, "host buffer allocated");
        Some(RawBuffer::new(Arc::new(HostDeviceBuffer {
            ptr,
            layout,
            meter: Arc::clone(&self.meter),
        })))
    }

    fn new_heap(&self, size: usize, options: BufferOptions) -> Option<Arc<dyn HeapDriver>> {
        let backing = self.new_buffer(size, options)?;
        Some(Arc::new(HostHeap::new(backing)))
    }

    fn residency(&self) -> Option<Arc<dyn ResidencyDriver>> {
        Some(Arc::clone(&self.residency) as Arc<dyn ResidencyDriver>)
    }
}

/// One direct host allocation
struct HostDeviceBuffer {
    ptr: *mut u8,
    layout: Layout,
    meter: Arc<HostMeter>,
}

// SAFETY: the raw pointer is an exclusive allocation handed out by
// std::alloc; all shared access is synchronized by the allocator's mutex
// and the runtime's command encoders.
unsafe impl Send for HostDeviceBuffer {}
unsafe impl Sync for HostDeviceBuffer {}

impl std::fmt::Debug for HostDeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDeviceBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.layout.size())
            .finish()
    }
}

impl BufferDriver for HostDeviceBuffer {
    fn length(&self) -> usize {
        self.layout.size()
    }
    fn contents(&self) -> *mut u8 {
        self.ptr
    }
    fn is_heap(&self) -> bool {
        false
    }
}

impl Drop for HostDeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc with exactly this layout and
        // is deallocated exactly once.
        unsafe { dealloc(self.ptr, self.layout) };
        self.meter.release(self.layout.size());
    }
}

/// Free region within the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    /// Byte offset from heap start
    offset: usize,
    /// Size in bytes
    size: usize,
}

impl FreeBlock {
    fn new(offset: usize, size: usize) -> Self {
        FreeBlock { offset, size }
    }

    /// Check if this block is immediately before another block
    fn is_adjacent_to(&self, other: &FreeBlock) -> bool {
        self.offset + self.size == other.offset
    }
}

#[derive(Debug)]
struct HeapState {
    free_blocks: Vec<FreeBlock>,
}

impl HeapState {
    /// Find best-fit free block: the smallest block that can satisfy the
    /// request after alignment. Minimizes fragmentation and leaves larger
    /// blocks available.
    fn find_best_fit(&self, size: usize, alignment: usize) -> Option<usize> {
        self.free_blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, block)| {
                let aligned_offset = align_up(block.offset, alignment);
                if aligned_offset >= block.offset + block.size {
                    return None;
                }
                let padding = aligned_offset - block.offset;
                let usable = block.size - padding;
                if usable >= size {
                    Some((idx, usable))
                } else {
                    None
                }
            })
            .min_by_key(|&(_, usable)| usable)
            .map(|(idx, _)| idx)
    }

    /// Sort free blocks by offset and merge adjacent ones
    fn sort_and_coalesce(&mut self) {
        self.free_blocks.sort_by_key(|b| b.offset);
        let mut i = 0;
        while i + 1 < self.free_blocks.len() {
            let current = self.free_blocks[i];
            let next = self.free_blocks[i + 1];
            if current.is_adjacent_to(&next) {
                self.free_blocks[i].size += next.size;
                self.free_blocks.remove(i + 1);
                // New current may be adjacent to the following block too
            } else {
                i += 1;
            }
        }
    }

    fn free_bytes(&self) -> usize {
        self.free_blocks.iter().map(|b| b.size).sum()
    }
}

/// Shared heap storage, alive as long as any sub-allocation or the heap
/// handle itself
#[derive(Debug)]
struct HostHeapShared {
    backing: RawBuffer,
    state: Mutex<HeapState>,
}

impl HostHeapShared {
    fn return_block(&self, offset: usize, size: usize) {
        // Entered from buffer Drop; must not panic on a poisoned lock
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.free_blocks.push(FreeBlock::new(offset, size));
        state.sort_and_coalesce();
    }
}

/// Fixed-size sub-heap for small buffers
#[derive(Debug)]
pub struct HostHeap {
    shared: Arc<HostHeapShared>,
}

impl HostHeap {
    fn new(backing: RawBuffer) -> Self {
        let capacity = backing.length();
        HostHeap {
            shared: Arc::new(HostHeapShared {
                backing,
                state: Mutex::new(HeapState {
                    free_blocks: vec![FreeBlock::new(0, capacity)],
                }),
            }),
        }
    }

    /// Bytes still placeable, ignoring fragmentation
    pub fn free_bytes(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .free_bytes()
    }
}

impl HeapDriver for HostHeap {
    fn new_buffer(&self, size: usize, _options: BufferOptions) -> Option<RawBuffer> {
        if size == 0 {
            return None;
        }
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let best_idx = state.find_best_fit(size, HEAP_ALIGNMENT)?;
        let block = state.free_blocks[best_idx];
        let offset = align_up(block.offset, HEAP_ALIGNMENT);
        let padding = offset - block.offset;
        let remaining = block.size - padding - size;

        state.free_blocks.remove(best_idx);
        if remaining >= MIN_FRAGMENT_SIZE {
            state.free_blocks.push(FreeBlock::new(offset + size, remaining));
        }
        if padding >= MIN_FRAGMENT_SIZE {
            state.free_blocks.push(FreeBlock::new(block.offset, padding));
        }
        state.sort_and_coalesce();
        drop(state);

        tracing::trace!(size, offset, "heap buffer placed");
        Some(RawBuffer::new(Arc::new(HostHeapBuffer {
            offset,
            size,
            shared: Arc::clone(&self.shared),
        })))
    }

    fn region(&self) -> Option<RawBuffer> {
        Some(self.shared.backing.clone())
    }
}

/// One sub-allocation within the heap
struct HostHeapBuffer {
    offset: usize,
    size: usize,
    shared: Arc<HostHeapShared>,
}

// SAFETY: see HostDeviceBuffer; the derived pointer stays within the
// backing allocation, which outlives every sub-allocation via the Arc.
unsafe impl Send for HostHeapBuffer {}
unsafe impl Sync for HostHeapBuffer {}

impl std::fmt::Debug for HostHeapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHeapBuffer")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl BufferDriver for HostHeapBuffer {
    fn length(&self) -> usize {
        self.size
    }
    fn contents(&self) -> *mut u8 {
        // SAFETY: offset + size was validated against the backing length
        // at placement time.
        unsafe { self.shared.backing.contents().add(self.offset) }
    }
    fn is_heap(&self) -> bool {
        true
    }
}

impl Drop for HostHeapBuffer {
    fn drop(&mut self) {
        self.shared.return_block(self.offset, self.size);
    }
}

/// Wired-memory facility of the host driver
///
/// Unified host memory is always resident from the CPU's point of view;
/// wiring is accepted unconditionally and tracked for introspection.
#[derive(Debug, Default)]
pub struct HostResidency {
    wired_bytes: AtomicUsize,
}

impl HostResidency {
    pub fn wired_bytes(&self) -> usize {
        self.wired_bytes.load(Ordering::Relaxed)
    }
}

impl ResidencyDriver for HostResidency {
    fn wire(&self, buffer: &RawBuffer) -> bool {
        self.wired_bytes.fetch_add(buffer.length(), Ordering::Relaxed);
        true
    }

    fn unwire(&self, buffer: &RawBuffer) {
        self.wired_bytes.fetch_sub(buffer.length(), Ordering::Relaxed);
    }
}

/// Align `offset` up to `alignment` (power of two)
fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::device::RESOURCE_OPTIONS;

    fn small_driver() -> HostDriver {
        HostDriver::with_info(DeviceInfo {
            device_name: "test host".to_string(),
            memory_size: 1 << 20,
            max_buffer_length: 1 << 19,
            max_recommended_working_set_size: 1 << 19,
            resource_limit: 64,
            page_size: 4096,
        })
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_buffer_is_page_aligned_and_released() {
        let driver = small_driver();
        let buf = driver.new_buffer(8192, RESOURCE_OPTIONS).unwrap();
        assert_eq!(buf.length(), 8192);
        assert_eq!(buf.contents() as usize % 4096, 0);
        assert!(!buf.is_heap());
        assert_eq!(driver.outstanding_bytes(), 8192);
        drop(buf);
        assert_eq!(driver.outstanding_bytes(), 0);
    }

    #[test]
    fn test_oom_returns_none() {
        let driver = small_driver();
        // max_buffer_length gate
        assert!(driver.new_buffer((1 << 19) + 1, RESOURCE_OPTIONS).is_none());
    }

    #[test]
    fn test_memory_budget_enforced() {
        let driver = small_driver();
        let a = driver.new_buffer(1 << 19, RESOURCE_OPTIONS).unwrap();
        let b = driver.new_buffer(1 << 19, RESOURCE_OPTIONS).unwrap();
        // Budget exhausted
        assert!(driver.new_buffer(4096, RESOURCE_OPTIONS).is_none());
        drop(a);
        assert!(driver.new_buffer(4096, RESOURCE_OPTIONS).is_some());
        drop(b);
    }

    #[test]
    fn test_heap_places_and_reclaims() {
        let driver = small_driver();
        let heap = driver.new_heap(64 * 1024, RESOURCE_OPTIONS).unwrap();
        let buf = heap.new_buffer(1000, RESOURCE_OPTIONS).unwrap();
        assert!(buf.is_heap());
        assert_eq!(buf.length(), 1000);
        assert_eq!(buf.contents() as usize % HEAP_ALIGNMENT, 0);
        drop(buf);
        // Full capacity visible again after coalescing
        let big = heap.new_buffer(63 * 1024, RESOURCE_OPTIONS);
        assert!(big.is_some());
    }

    #[test]
    fn test_heap_full_returns_none() {
        let driver = small_driver();
        let heap = driver.new_heap(16 * 1024, RESOURCE_OPTIONS).unwrap();
        let _a = heap.new_buffer(15 * 1024, RESOURCE_OPTIONS).unwrap();
        assert!(heap.new_buffer(8 * 1024, RESOURCE_OPTIONS).is_none());
    }

    #[test]
    fn test_heap_region_is_not_heap_backed() {
        let driver = small_driver();
        let heap = driver.new_heap(16 * 1024, RESOURCE_OPTIONS).unwrap();
        let region = heap.region().unwrap();
        assert!(!region.is_heap());
        assert_eq!(region.length(), 16 * 1024);
    }

    #[test]
    fn test_best_fit_prefers_tightest_block() {
        let state = HeapState {
            free_blocks: vec![FreeBlock::new(0, 4096), FreeBlock::new(8192, 1024)],
        };
        // 1000 bytes fits both; the 1024-byte block is tighter
        assert_eq!(state.find_best_fit(1000, 256), Some(1));
    }

    #[test]
    fn test_residency_accounting() {
        let driver = small_driver();
        let residency = driver.residency().unwrap();
        let buf = driver.new_buffer(4096, RESOURCE_OPTIONS).unwrap();
        assert!(residency.wire(&buf));
        residency.unwire(&buf);
    }
}
