use std::ptr::NonNull;

use thiserror::Error;

use crate::types::{CopyRegion, MemoryClass};

/// Properties of a device that the allocator needs to know about.
#[derive(Debug, Copy, Clone)]
pub struct DeviceProperties {
    /// Every segment size is rounded up to a multiple of this value. Typically the device's
    /// minimum uniform buffer offset alignment.
    pub min_alignment: u64,
}

/// A raw device allocation. This is a buffer bound to a dedicated piece of device memory.
pub struct RawAllocation<D: Device> {
    pub buffer: D::Buffer,
    pub memory: D::Memory,
    /// Size in bytes of both the buffer and the memory.
    pub size: u64,
    pub class: MemoryClass,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device out of memory while allocating `{size}` bytes of {class:?} memory")]
    OutOfMemory { size: u64, class: MemoryClass },
    #[error("no memory type matches the requirements of {0:?} memory")]
    NoMatchingMemoryType(MemoryClass),
    #[error("memory is not host visible and cannot be mapped")]
    NotMappable,
    #[error("unable to map memory: {0}")]
    MapFailed(String),
    #[error("unable to submit copy: {0}")]
    SubmitFailed(String),
    #[error("an error has occured: {0}")]
    Other(String),
}

/// The device collaborator the allocator carves segments out of.
///
/// Implementations are only required to create raw allocations, map them, and perform blocking
/// buffer to buffer copies. Everything else (suballocation, alignment, staging) is handled by
/// the allocator.
///
/// # Safety
/// All methods are `unsafe` because the allocator is responsible for ensuring that handles
/// passed in were created by the same device and are still alive.
#[allow(clippy::missing_safety_doc)]
pub trait Device: Sized + 'static {
    type Buffer;
    type Memory;

    fn properties(&self) -> &DeviceProperties;

    /// Creates a buffer of `size` bytes bound to newly allocated memory of the requested class.
    unsafe fn create_raw_allocation(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RawAllocation<Self>, DeviceError>;

    unsafe fn destroy_raw_allocation(&self, allocation: RawAllocation<Self>);

    /// Maps `size` bytes of `memory` starting at `offset`. The memory must be unmapped with
    /// [`unmap_memory`](Device::unmap_memory) before it is mapped again.
    unsafe fn map_memory(
        &self,
        memory: &Self::Memory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError>;

    unsafe fn unmap_memory(&self, memory: &Self::Memory);

    /// Copies `region` from `src` to `dst` on a transfer capable queue. Must not return until the
    /// device has finished the copy.
    unsafe fn submit_copy(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        region: CopyRegion,
    ) -> Result<(), DeviceError>;
}
