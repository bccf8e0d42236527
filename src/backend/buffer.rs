//! Raw buffer handle shared between the allocator and its drivers

use std::fmt;
use std::sync::Arc;

/// Driver-side state of one allocation
///
/// Implementations hold whatever the driver needs to describe and later
/// release the allocation; release happens in the implementation's `Drop`.
pub trait BufferDriver: Send + Sync + fmt::Debug {
    /// Driver-reported length in bytes
    fn length(&self) -> usize;

    /// Pointer into shared memory
    fn contents(&self) -> *mut u8;

    /// True iff sub-allocated from the small-buffer heap. Heap-backed
    /// buffers never participate in the residency set; the heap itself is
    /// registered once.
    fn is_heap(&self) -> bool;
}

/// Opaque handle to one raw driver allocation
///
/// Cloning shares the allocation; dropping the last handle releases it
/// back to the driver. The allocator relies on this when it hands a cached
/// buffer back to a caller (identity preserved) and when it releases one
/// under pressure (last handle dropped outside the lock).
#[derive(Clone)]
pub struct RawBuffer {
    inner: Arc<dyn BufferDriver>,
}

impl RawBuffer {
    pub fn new(inner: Arc<dyn BufferDriver>) -> Self {
        RawBuffer { inner }
    }

    /// Driver-reported length in bytes
    pub fn length(&self) -> usize {
        self.inner.length()
    }

    /// Pointer into shared memory
    pub fn contents(&self) -> *mut u8 {
        self.inner.contents()
    }

    /// True iff sub-allocated from the small-buffer heap
    pub fn is_heap(&self) -> bool {
        self.inner.is_heap()
    }

    /// Stable identity of the underlying allocation
    ///
    /// Two handles compare equal iff they refer to the same driver
    /// allocation, regardless of how often either was cloned.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Whether both handles refer to the same driver allocation
    pub fn same_allocation(&self, other: &RawBuffer) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("length", &self.length())
            .field("is_heap", &self.is_heap())
            .finish()
    }
}
