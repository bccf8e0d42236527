//! Platform driver abstraction
//!
//! Object-safe traits the allocation core is written against, plus the two
//! shipped implementations: the unified shared-memory host driver and the
//! deterministic mock used by tests and benches.

pub mod buffer;
pub mod device;
pub mod host;
pub mod mock;

pub use buffer::{BufferDriver, RawBuffer};
pub use device::{
    BufferOptions, DeviceDriver, DeviceInfo, HazardTracking, HeapDriver, ResidencyDriver,
    ScratchScope, StorageMode, PARAVIRTUAL_DEVICE_NAME, RESOURCE_OPTIONS,
};
pub use host::HostDriver;
pub use mock::MockDriver;
