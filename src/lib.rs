//! UniForge - GPU buffer allocator for unified-memory tensor runtimes
//!
//! Tensor operators request raw GPU-addressable buffers of arbitrary byte
//! sizes at high frequency. UniForge serves them from a page-aligned,
//! size-indexed, LRU-ordered cache layered over raw driver allocations and
//! a small-buffer sub-heap, with pressure-driven eviction, wired-memory
//! tracking, and a single mutex shared by all tensor-op threads.
//!
//! The typical entry points are the module-level functions in [`memory`]:
//!
//! ```
//! use uniforge::memory;
//!
//! let buf = memory::malloc(4096).unwrap();
//! assert!(memory::size(&buf) >= 4096);
//! memory::free(buf);
//! ```
//!
//! Embedders with their own platform driver implement the traits in
//! [`backend`] and construct a [`memory::BufferAllocator`] directly.

pub mod backend;
pub mod error;
pub mod logging;
pub mod memory;

pub use backend::{DeviceDriver, DeviceInfo, HostDriver, MockDriver, RawBuffer};
pub use error::{AllocError, AllocResult, ErrorCategory};
pub use memory::{AllocatorConfig, Buffer, BufferAllocator};
