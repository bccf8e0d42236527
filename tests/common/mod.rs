//! Shared fixtures for allocator integration tests
//!
//! Every suite runs against the deterministic mock driver so assertions
//! can count exactly what the allocator asked the driver to do.

// Each integration binary compiles this module separately and uses a
// different subset of the helpers.
#![allow(dead_code)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use uniforge::backend::{DeviceDriver, DeviceInfo, MockDriver};
use uniforge::{AllocatorConfig, BufferAllocator};

pub const PAGE: usize = 4096;

/// Property table with room to spare and a 4 KiB page
pub fn roomy_info() -> DeviceInfo {
    DeviceInfo {
        device_name: "UniForge mock device".to_string(),
        memory_size: 1 << 30,
        max_buffer_length: 1 << 28,
        max_recommended_working_set_size: 1 << 29,
        resource_limit: 499_000,
        page_size: PAGE,
    }
}

/// Allocator whose every allocation goes directly to the device
///
/// The mock refuses to create a sub-heap, so resource counts and driver
/// statistics read exactly as the scenario arithmetic expects.
pub fn direct_allocator() -> (Arc<MockDriver>, BufferAllocator) {
    direct_allocator_with(roomy_info())
}

pub fn direct_allocator_with(info: DeviceInfo) -> (Arc<MockDriver>, BufferAllocator) {
    let mock = Arc::new(MockDriver::with_info(info).without_heap());
    let allocator = BufferAllocator::new(Arc::clone(&mock) as Arc<dyn DeviceDriver>);
    (mock, allocator)
}

/// Allocator with the sub-heap enabled and a wired budget so residency
/// traffic is observable
pub fn wired_allocator(wired_limit: usize) -> (Arc<MockDriver>, BufferAllocator) {
    let mock = Arc::new(MockDriver::with_info(roomy_info()));
    let allocator = BufferAllocator::with_config(
        Arc::clone(&mock) as Arc<dyn DeviceDriver>,
        AllocatorConfig::default().with_wired_limit(wired_limit),
    );
    (mock, allocator)
}

pub fn device_allocs(mock: &MockDriver) -> usize {
    mock.stats().device_allocations.load(Ordering::SeqCst)
}

pub fn device_releases(mock: &MockDriver) -> usize {
    mock.stats().device_releases.load(Ordering::SeqCst)
}

pub fn heap_allocs(mock: &MockDriver) -> usize {
    mock.stats().heap_allocations.load(Ordering::SeqCst)
}

pub fn wires(mock: &MockDriver) -> usize {
    mock.stats().wires.load(Ordering::SeqCst)
}

pub fn unwires(mock: &MockDriver) -> usize {
    mock.stats().unwires.load(Ordering::SeqCst)
}

/// Live driver buffers: allocations minus releases, device and heap
pub fn live_driver_buffers(mock: &MockDriver) -> usize {
    let stats = mock.stats();
    stats.device_allocations.load(Ordering::SeqCst)
        + stats.heap_allocations.load(Ordering::SeqCst)
        - stats.device_releases.load(Ordering::SeqCst)
        - stats.heap_releases.load(Ordering::SeqCst)
}

/// The mock's property table, for limit arithmetic in tests
pub fn info_of(mock: &MockDriver) -> DeviceInfo {
    mock.info().clone()
}
