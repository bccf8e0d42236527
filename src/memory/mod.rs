//! Buffer allocation for unified-memory tensor runtimes
//!
//! The public surface: an opaque [`Buffer`] handle, the [`BufferAllocator`]
//! type for embedders that bring their own driver, and module-level
//! functions wrapping the process-wide allocator over the host driver.
//!
//! The process-wide allocator is created on first use and deliberately
//! leaked: releasing every cached buffer at process exit is slower than
//! letting the OS reclaim the address space.

pub mod allocator;
pub mod cache;
pub mod residency;

pub use allocator::{AllocatorConfig, BufferAllocator};
pub use cache::BufferCache;
pub use residency::ResidencySet;

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::{DeviceInfo, HostDriver, RawBuffer};
use crate::error::AllocResult;

/// Opaque handle to an allocated buffer
///
/// May be null: zero-size requests and driver out-of-memory both return
/// the null buffer rather than an error. Whether the buffer came from the
/// sub-heap or the device is internal to the allocator.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    raw: Option<RawBuffer>,
}

impl Buffer {
    /// The null buffer sentinel
    pub fn null() -> Self {
        Buffer { raw: None }
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Pointer into shared memory; null for the null buffer
    pub fn raw_ptr(&self) -> *mut u8 {
        self.raw
            .as_ref()
            .map(|buf| buf.contents())
            .unwrap_or(std::ptr::null_mut())
    }

    pub(crate) fn from_raw(raw: RawBuffer) -> Self {
        Buffer { raw: Some(raw) }
    }

    pub(crate) fn into_raw(self) -> Option<RawBuffer> {
        self.raw
    }

    pub(crate) fn raw_ref(&self) -> Option<&RawBuffer> {
        self.raw.as_ref()
    }
}

static GLOBAL: OnceCell<&'static BufferAllocator> = OnceCell::new();

/// The process-wide allocator over the host driver
///
/// Created on first use with a leaked lifetime; there is no teardown.
pub fn global() -> &'static BufferAllocator {
    GLOBAL.get_or_init(|| {
        Box::leak(Box::new(BufferAllocator::new(Arc::new(HostDriver::new()))))
    })
}

/// Allocate a buffer of at least `size` bytes from the process-wide
/// allocator
pub fn malloc(size: usize) -> AllocResult<Buffer> {
    global().malloc(size)
}

/// Return a buffer to the process-wide allocator
pub fn free(buffer: Buffer) {
    global().free(buffer)
}

/// Driver-reported length of `buffer` in bytes
pub fn size(buffer: &Buffer) -> usize {
    global().size(buffer)
}

/// Cap the bytes the cache may retain; returns the previous limit
pub fn set_cache_limit(limit: usize) -> usize {
    global().set_cache_limit(limit)
}

/// Bytes currently held by the cache
pub fn get_cache_memory() -> usize {
    global().get_cache_memory()
}

/// Release every cached buffer
pub fn clear_cache() {
    global().clear_cache()
}

/// Set the soft cap on active + cached bytes; returns the previous limit
pub fn set_memory_limit(limit: usize) -> usize {
    global().set_memory_limit(limit)
}

/// Current soft cap on active + cached bytes
pub fn get_memory_limit() -> usize {
    global().get_memory_limit()
}

/// Set the wired-memory budget; returns the previous one
///
/// # Errors
/// `WiredLimitTooLarge` when `limit` exceeds the device's recommended
/// working set size.
pub fn set_wired_limit(limit: usize) -> AllocResult<usize> {
    global().set_wired_limit(limit)
}

/// Bytes handed out and not yet freed
pub fn get_active_memory() -> usize {
    global().get_active_memory()
}

/// Historical maximum of active bytes since the last reset
pub fn get_peak_memory() -> usize {
    global().get_peak_memory()
}

/// Reset the peak to the current active bytes
pub fn reset_peak_memory() {
    global().reset_peak_memory()
}

/// Snapshot of the device property table read at startup
pub fn device_info() -> DeviceInfo {
    global().device_info().clone()
}

/// Whether the backing device initialized with usable memory
pub fn is_available() -> bool {
    global().device_info().memory_size > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_buffer() {
        let buf = Buffer::null();
        assert!(buf.is_null());
        assert!(buf.raw_ptr().is_null());
        assert!(Buffer::default().is_null());
    }

    #[test]
    fn test_clone_shares_allocation() {
        let alloc = BufferAllocator::new(Arc::new(crate::backend::MockDriver::new()));
        let buf = alloc.malloc(4096).unwrap();
        let clone = buf.clone();
        assert_eq!(buf.raw_ptr(), clone.raw_ptr());
        alloc.free(buf);
    }
}
