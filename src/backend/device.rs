//! Driver traits and device information
//!
//! The allocator treats the platform driver as an opaque provider of four
//! primitives: direct buffer allocation, sub-heap allocation, release (via
//! `RawBuffer` drop), and a wired-memory facility. These traits are the
//! seam; `host` implements them for unified shared memory and `mock`
//! implements them for tests.

use std::fmt;
use std::sync::Arc;

use crate::backend::RawBuffer;

/// Device property table read once at startup
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Marketing name of the device, e.g. "UMA GPU 0"
    pub device_name: String,
    /// Total bytes of unified memory on the device
    pub memory_size: usize,
    /// Largest single buffer the driver will allocate
    pub max_buffer_length: usize,
    /// Working set size the driver recommends staying under
    pub max_recommended_working_set_size: usize,
    /// Maximum count of live driver resources (buffers + heaps)
    pub resource_limit: usize,
    /// Virtual memory page size, the alignment granularity for
    /// non-small allocations
    pub page_size: usize,
}

/// Device name under which heap semantics are unreliable and the
/// sub-heap must not be created.
pub const PARAVIRTUAL_DEVICE_NAME: &str = "Apple Paravirtual device";

/// Storage placement for a new buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Unified memory visible to both CPU and GPU
    #[default]
    Shared,
}

/// Driver-side hazard tracking for a new buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HazardTracking {
    /// Driver tracks read/write hazards itself
    Tracked,
    /// The runtime orders access externally via command encoders
    #[default]
    Untracked,
}

/// Allocation options passed on every driver call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferOptions {
    pub storage_mode: StorageMode,
    pub hazard_tracking: HazardTracking,
}

/// Options the allocator uses for all of its buffers: shared storage,
/// hazard tracking left to the command encoders.
pub const RESOURCE_OPTIONS: BufferOptions = BufferOptions {
    storage_mode: StorageMode::Shared,
    hazard_tracking: HazardTracking::Untracked,
};

/// Guard for a driver scratch-memory scope
///
/// Drivers may require allocation and release calls to run inside a scope
/// that reclaims transient driver objects on exit. Holding a `ScratchScope`
/// keeps the scope open; dropping it closes the scope on every exit path,
/// including unwinding.
pub struct ScratchScope {
    on_exit: Option<Box<dyn FnOnce() + Send>>,
}

impl ScratchScope {
    /// Scope that runs `on_exit` when dropped
    pub fn new(on_exit: impl FnOnce() + Send + 'static) -> Self {
        ScratchScope {
            on_exit: Some(Box::new(on_exit)),
        }
    }

    /// Scope with no driver-side state to reclaim
    pub fn noop() -> Self {
        ScratchScope { on_exit: None }
    }
}

impl Drop for ScratchScope {
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit();
        }
    }
}

impl fmt::Debug for ScratchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchScope")
            .field("armed", &self.on_exit.is_some())
            .finish()
    }
}

/// The device driver the allocator is built over
pub trait DeviceDriver: Send + Sync + fmt::Debug {
    /// Device property table; immutable after construction
    fn info(&self) -> &DeviceInfo;

    /// Allocate an untracked buffer of exactly `size` bytes directly from
    /// the device. Returns `None` when the driver is out of memory.
    fn new_buffer(&self, size: usize, options: BufferOptions) -> Option<RawBuffer>;

    /// Create a fixed-size heap for small-buffer sub-allocation.
    /// Returns `None` when the driver cannot back a heap.
    fn new_heap(&self, size: usize, options: BufferOptions) -> Option<Arc<dyn HeapDriver>>;

    /// The driver's wired-memory facility, if it has one
    fn residency(&self) -> Option<Arc<dyn ResidencyDriver>>;

    /// Open a scratch-memory scope around driver calls
    fn scratch_scope(&self) -> ScratchScope {
        ScratchScope::noop()
    }
}

/// A fixed-size driver heap used as a packed arena for small buffers
pub trait HeapDriver: Send + Sync + fmt::Debug {
    /// Sub-allocate from the heap. Returns `None` when the heap cannot
    /// place the request (full or too fragmented).
    fn new_buffer(&self, size: usize, options: BufferOptions) -> Option<RawBuffer>;

    /// The heap's backing allocation as a buffer, registered once with the
    /// residency set at startup so the whole heap stays wired.
    fn region(&self) -> Option<RawBuffer>;
}

/// Driver facility that keeps buffers wired into physical memory
///
/// Both operations are best-effort: `wire` reports whether the buffer is
/// now wired, `unwire` never fails meaningfully. Callers log failures and
/// move on; wired status is advisory for the GPU scheduler, not
/// correctness-bearing.
pub trait ResidencyDriver: Send + Sync + fmt::Debug {
    fn wire(&self, buffer: &RawBuffer) -> bool;
    fn unwire(&self, buffer: &RawBuffer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_scratch_scope_runs_on_drop() {
        static FIRED: AtomicBool = AtomicBool::new(false);
        {
            let _scope = ScratchScope::new(|| FIRED.store(true, Ordering::SeqCst));
            assert!(!FIRED.load(Ordering::SeqCst));
        }
        assert!(FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_noop_scope_is_silent() {
        let scope = ScratchScope::noop();
        drop(scope);
    }

    #[test]
    fn test_default_options_are_shared_untracked() {
        assert_eq!(RESOURCE_OPTIONS.storage_mode, StorageMode::Shared);
        assert_eq!(RESOURCE_OPTIONS.hazard_tracking, HazardTracking::Untracked);
        assert_eq!(BufferOptions::default(), RESOURCE_OPTIONS);
    }
}
