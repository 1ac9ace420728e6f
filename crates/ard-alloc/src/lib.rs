//! Suballocation of GPU buffer memory.
//!
//! Renderers need lots of small buffers (vertices, indices, uniforms) that live for different
//! amounts of time, but devices are slow at creating allocations and limit how many can exist.
//! This crate requests a few large [`blocks`](block::Block) from a [`Device`](device::Device) and
//! hands out [`segments`](segment::SegmentHandle) of them instead.
//!
//! Memory comes in two [`classes`](types::MemoryClass). `HostVisible` memory is written through
//! a mapping. `DeviceLocal` memory is written by staging the data in a temporary host visible
//! buffer and having the device copy it over.
pub mod allocator;
pub mod block;
pub mod blocks;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod mapper;
pub mod ranges;
pub mod segment;
pub mod types;

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::allocator::{ClassStats, SegmentAllocator};
    pub use crate::block::{BlockId, MappedPtr, Mapping};
    pub use crate::config::AllocatorConfig;
    pub use crate::device::{Device, DeviceError, DeviceProperties, RawAllocation};
    pub use crate::error::{AllocatorError, PartitionError};
    pub use crate::host::{HostDevice, HostDeviceCreateInfo};
    pub use crate::mapper::SegmentView;
    pub use crate::segment::SegmentHandle;
    pub use crate::types::{CopyRegion, MemoryClass, UsageIntent};
}
