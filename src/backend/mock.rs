//! Deterministic in-memory driver for tests and benches
//!
//! Serves synthetic buffer addresses from a finite byte pool and records
//! every driver interaction (allocations, releases, wires, unwires,
//! scratch scopes) so suites can assert on exactly what the allocator did.
//!
//! Addresses handed out by this driver are synthetic and MUST NOT be
//! dereferenced; they exist only so identity and alignment checks work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::device::{
    BufferOptions, DeviceDriver, DeviceInfo, HeapDriver, ResidencyDriver, ScratchScope,
    PARAVIRTUAL_DEVICE_NAME,
};
use crate::backend::{BufferDriver, RawBuffer};

/// Base of the synthetic address space
const ADDR_BASE: usize = 0x1000_0000;

/// Counters for every driver interaction
#[derive(Debug, Default)]
pub struct MockStats {
    pub device_allocations: AtomicUsize,
    pub device_releases: AtomicUsize,
    pub heap_allocations: AtomicUsize,
    pub heap_releases: AtomicUsize,
    pub wires: AtomicUsize,
    pub unwires: AtomicUsize,
    pub scopes_opened: AtomicUsize,
    pub scopes_closed: AtomicUsize,
}

impl MockStats {
    /// Scratch scopes currently open; zero whenever the allocator is idle
    pub fn open_scopes(&self) -> usize {
        self.scopes_opened.load(Ordering::SeqCst) - self.scopes_closed.load(Ordering::SeqCst)
    }
}

/// Finite byte pool the mock serves device allocations from
#[derive(Debug)]
struct MockPool {
    remaining: AtomicUsize,
}

impl MockPool {
    fn reserve(&self, size: usize) -> bool {
        let mut current = self.remaining.load(Ordering::Relaxed);
        loop {
            if current < size {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn refund(&self, size: usize) {
        self.remaining.fetch_add(size, Ordering::Relaxed);
    }
}

/// Deterministic mock device driver
#[derive(Debug)]
pub struct MockDriver {
    info: DeviceInfo,
    stats: Arc<MockStats>,
    pool: Arc<MockPool>,
    residency: Arc<MockResidency>,
    next_addr: AtomicUsize,
    heap_enabled: bool,
}

impl MockDriver {
    /// Mock with a roomy default property table
    pub fn new() -> Self {
        Self::with_info(DeviceInfo {
            device_name: "UniForge mock device".to_string(),
            memory_size: 1 << 30,
            max_buffer_length: 1 << 28,
            max_recommended_working_set_size: 1 << 29,
            resource_limit: 499_000,
            page_size: 4096,
        })
    }

    /// Mock with an explicit property table; the byte pool starts at
    /// `memory_size`
    pub fn with_info(info: DeviceInfo) -> Self {
        let pool = Arc::new(MockPool {
            remaining: AtomicUsize::new(info.memory_size),
        });
        let stats = Arc::new(MockStats::default());
        let residency = Arc::new(MockResidency {
            wired_bytes: AtomicUsize::new(0),
            deny: AtomicBool::new(false),
            stats: Arc::clone(&stats),
        });
        MockDriver {
            info,
            stats,
            pool,
            residency,
            next_addr: AtomicUsize::new(ADDR_BASE),
            heap_enabled: true,
        }
    }

    /// Mock reporting the paravirtual device name, under which the
    /// allocator must not create a sub-heap
    pub fn paravirtual() -> Self {
        let mut mock = Self::new();
        mock.info.device_name = PARAVIRTUAL_DEVICE_NAME.to_string();
        mock
    }

    /// Refuse every `new_heap` call
    pub fn without_heap(mut self) -> Self {
        self.heap_enabled = false;
        self
    }

    /// Shrink or grow the remaining byte pool
    pub fn set_pool_remaining(&self, bytes: usize) {
        self.pool.remaining.store(bytes, Ordering::SeqCst);
    }

    /// Make subsequent wire calls report failure
    pub fn deny_wiring(&self, deny: bool) {
        self.residency.deny.store(deny, Ordering::SeqCst);
    }

    /// Interaction counters
    pub fn stats(&self) -> &Arc<MockStats> {
        &self.stats
    }

    /// Bytes the residency facility currently has wired
    pub fn wired_bytes(&self) -> usize {
        self.residency.wired_bytes.load(Ordering::SeqCst)
    }

    fn alloc_addr(&self, size: usize) -> usize {
        let span = size.max(1).next_multiple_of(self.info.page_size);
        self.next_addr.fetch_add(span, Ordering::Relaxed)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDriver for MockDriver {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn new_buffer(&self, size: usize, _options: BufferOptions) -> Option<RawBuffer> {
        if size == 0 || size > self.info.max_buffer_length {
            return None;
        }
        if !self.pool.reserve(size) {
            return None;
        }
        self.stats.device_allocations.fetch_add(1, Ordering::SeqCst);
        Some(RawBuffer::new(Arc::new(MockBuffer {
            addr: self.alloc_addr(size),
            len: size,
            heap: false,
            stats: Arc::clone(&self.stats),
            pool: Some(Arc::clone(&self.pool)),
            heap_used: None,
        })))
    }

    fn new_heap(&self, size: usize, _options: BufferOptions) -> Option<Arc<dyn HeapDriver>> {
        if !self.heap_enabled || size == 0 {
            return None;
        }
        if !self.pool.reserve(size) {
            return None;
        }
        Some(Arc::new(MockHeap {
            region_addr: self.alloc_addr(size),
            capacity: size,
            used: Arc::new(AtomicUsize::new(0)),
            stats: Arc::clone(&self.stats),
            page_size: self.info.page_size,
            next_offset: AtomicUsize::new(0),
        }))
    }

    fn residency(&self) -> Option<Arc<dyn ResidencyDriver>> {
        Some(Arc::clone(&self.residency) as Arc<dyn ResidencyDriver>)
    }

    fn scratch_scope(&self) -> ScratchScope {
        self.stats.scopes_opened.fetch_add(1, Ordering::SeqCst);
        let stats = Arc::clone(&self.stats);
        ScratchScope::new(move || {
            stats.scopes_closed.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// One mock allocation, device- or heap-backed
#[derive(Debug)]
struct MockBuffer {
    addr: usize,
    len: usize,
    heap: bool,
    stats: Arc<MockStats>,
    pool: Option<Arc<MockPool>>,
    heap_used: Option<Arc<AtomicUsize>>,
}

impl BufferDriver for MockBuffer {
    fn length(&self) -> usize {
        self.len
    }
    fn contents(&self) -> *mut u8 {
        self.addr as *mut u8
    }
    fn is_heap(&self) -> bool {
        self.heap
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        if self.heap {
            self.stats.heap_releases.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.device_releases.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(pool) = &self.pool {
            pool.refund(self.len);
        }
        if let Some(used) = &self.heap_used {
            used.fetch_sub(self.len, Ordering::SeqCst);
        }
    }
}

/// Mock sub-heap: a capacity meter over a synthetic address range
#[derive(Debug)]
struct MockHeap {
    region_addr: usize,
    capacity: usize,
    used: Arc<AtomicUsize>,
    stats: Arc<MockStats>,
    page_size: usize,
    next_offset: AtomicUsize,
}

impl HeapDriver for MockHeap {
    fn new_buffer(&self, size: usize, _options: BufferOptions) -> Option<RawBuffer> {
        if size == 0 {
            return None;
        }
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            if current + size > self.capacity {
                return None;
            }
            match self.used.compare_exchange_weak(
                current,
                current + size,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.stats.heap_allocations.fetch_add(1, Ordering::SeqCst);
        let offset = self
            .next_offset
            .fetch_add(size.next_multiple_of(self.page_size), Ordering::Relaxed);
        Some(RawBuffer::new(Arc::new(MockBuffer {
            addr: self.region_addr + offset,
            len: size,
            heap: true,
            stats: Arc::clone(&self.stats),
            pool: None,
            heap_used: Some(Arc::clone(&self.used)),
        })))
    }

    fn region(&self) -> Option<RawBuffer> {
        Some(RawBuffer::new(Arc::new(MockHeapRegion {
            addr: self.region_addr,
            len: self.capacity,
        })))
    }
}

/// View of the whole mock heap, for residency registration
#[derive(Debug)]
struct MockHeapRegion {
    addr: usize,
    len: usize,
}

impl BufferDriver for MockHeapRegion {
    fn length(&self) -> usize {
        self.len
    }
    fn contents(&self) -> *mut u8 {
        self.addr as *mut u8
    }
    fn is_heap(&self) -> bool {
        false
    }
}

/// Mock wired-memory facility
#[derive(Debug)]
struct MockResidency {
    wired_bytes: AtomicUsize,
    deny: AtomicBool,
    stats: Arc<MockStats>,
}

impl ResidencyDriver for MockResidency {
    fn wire(&self, buffer: &RawBuffer) -> bool {
        if self.deny.load(Ordering::SeqCst) {
            return false;
        }
        self.stats.wires.fetch_add(1, Ordering::SeqCst);
        self.wired_bytes.fetch_add(buffer.length(), Ordering::SeqCst);
        true
    }

    fn unwire(&self, buffer: &RawBuffer) {
        self.stats.unwires.fetch_add(1, Ordering::SeqCst);
        self.wired_bytes.fetch_sub(buffer.length(), Ordering::SeqCst);
    }
}
