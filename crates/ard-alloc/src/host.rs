//! A device backed by plain heap memory.
//!
//! The host device follows the same rules a real GPU would: `DeviceLocal` memory can't be mapped,
//! memory can't be mapped twice, and data only reaches device local memory through
//! [`submit_copy`](Device::submit_copy). This makes it suitable for testing the allocator and for
//! running headless tools without a graphics driver.

use std::{
    cell::{Cell, RefCell},
    ptr::NonNull,
};

use rustc_hash::FxHashMap;

use crate::{
    device::{Device, DeviceError, DeviceProperties, RawAllocation},
    types::{CopyRegion, MemoryClass},
};

pub struct HostDeviceCreateInfo {
    /// Reported as the device's minimum alignment.
    pub min_alignment: u64,
    /// Total number of bytes that may be allocated at once. `None` means unlimited.
    pub memory_budget: Option<u64>,
    /// When `false`, the device pretends it has no memory type for `DeviceLocal` memory.
    pub device_local_supported: bool,
}

pub struct HostDevice {
    properties: DeviceProperties,
    memory_budget: Option<u64>,
    device_local_supported: bool,
    next_id: Cell<u64>,
    in_use: Cell<u64>,
    copies: Cell<usize>,
    regions: RefCell<FxHashMap<u64, HostRegion>>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HostBuffer(u64);

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HostMemory(u64);

struct HostRegion {
    ptr: NonNull<u8>,
    len: usize,
    class: MemoryClass,
    mapped: bool,
}

impl Default for HostDeviceCreateInfo {
    fn default() -> Self {
        Self {
            min_alignment: 256,
            memory_budget: None,
            device_local_supported: true,
        }
    }
}

impl HostDevice {
    pub fn new(create_info: HostDeviceCreateInfo) -> Self {
        Self {
            properties: DeviceProperties {
                min_alignment: create_info.min_alignment,
            },
            memory_budget: create_info.memory_budget,
            device_local_supported: create_info.device_local_supported,
            next_id: Cell::new(0),
            in_use: Cell::new(0),
            copies: Cell::new(0),
            regions: RefCell::default(),
        }
    }

    /// Number of raw allocations that have not been destroyed.
    #[inline]
    pub fn live_allocations(&self) -> usize {
        self.regions.borrow().len()
    }

    /// Total bytes of all live raw allocations.
    #[inline(always)]
    pub fn bytes_in_use(&self) -> u64 {
        self.in_use.get()
    }

    /// Number of copies submitted so far.
    #[inline(always)]
    pub fn copies_submitted(&self) -> usize {
        self.copies.get()
    }

    #[inline]
    pub fn is_mapped(&self, memory: &HostMemory) -> bool {
        self.regions
            .borrow()
            .get(&memory.0)
            .map(|region| region.mapped)
            .unwrap_or(false)
    }

    /// Reads memory directly, regardless of its class. Returns `None` if the memory doesn't exist
    /// or the range is out of bounds.
    pub fn read_raw(&self, memory: &HostMemory, offset: u64, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.borrow();
        let region = regions.get(&memory.0)?;
        let start = offset as usize;
        if start.checked_add(len)? > region.len {
            return None;
        }

        Some(region.as_slice()[start..(start + len)].to_vec())
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;
    type Memory = HostMemory;

    #[inline(always)]
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    unsafe fn create_raw_allocation(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RawAllocation<Self>, DeviceError> {
        if class == MemoryClass::DeviceLocal && !self.device_local_supported {
            return Err(DeviceError::NoMatchingMemoryType(class));
        }

        let in_use = self.in_use.get();
        if let Some(budget) = self.memory_budget {
            if in_use.saturating_add(size) > budget {
                return Err(DeviceError::OutOfMemory { size, class });
            }
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.in_use.set(in_use + size);

        self.regions
            .borrow_mut()
            .insert(id, HostRegion::new(size as usize, class));

        Ok(RawAllocation {
            buffer: HostBuffer(id),
            memory: HostMemory(id),
            size,
            class,
        })
    }

    unsafe fn destroy_raw_allocation(&self, allocation: RawAllocation<Self>) {
        if self.regions.borrow_mut().remove(&allocation.memory.0).is_some() {
            self.in_use.set(self.in_use.get() - allocation.size);
        }
    }

    unsafe fn map_memory(
        &self,
        memory: &Self::Memory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        let mut regions = self.regions.borrow_mut();
        let region = regions
            .get_mut(&memory.0)
            .ok_or_else(|| DeviceError::MapFailed("unknown memory".into()))?;

        if !region.class.is_mappable() {
            return Err(DeviceError::NotMappable);
        }

        if region.mapped {
            return Err(DeviceError::MapFailed("memory is already mapped".into()));
        }

        match offset.checked_add(size) {
            Some(end) if end <= region.len as u64 => {}
            _ => {
                return Err(DeviceError::MapFailed(format!(
                    "range `{offset}..{}` is out of bounds",
                    offset.saturating_add(size)
                )))
            }
        }

        region.mapped = true;
        Ok(NonNull::new_unchecked(region.ptr.as_ptr().add(offset as usize)))
    }

    unsafe fn unmap_memory(&self, memory: &Self::Memory) {
        if let Some(region) = self.regions.borrow_mut().get_mut(&memory.0) {
            region.mapped = false;
        }
    }

    unsafe fn submit_copy(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        region: CopyRegion,
    ) -> Result<(), DeviceError> {
        let regions = self.regions.borrow();
        let (src, dst) = match (regions.get(&src.0), regions.get(&dst.0)) {
            (Some(src), Some(dst)) => (src, dst),
            _ => return Err(DeviceError::SubmitFailed("unknown buffer".into())),
        };

        let size = region.size as usize;
        let in_bounds = |offset: u64, len: usize| {
            (offset as usize)
                .checked_add(size)
                .map(|end| end <= len)
                .unwrap_or(false)
        };
        if !in_bounds(region.src_offset, src.len) || !in_bounds(region.dst_offset, dst.len) {
            return Err(DeviceError::SubmitFailed("copy region is out of bounds".into()));
        }

        std::ptr::copy(
            src.ptr.as_ptr().add(region.src_offset as usize),
            dst.ptr.as_ptr().add(region.dst_offset as usize),
            size,
        );
        self.copies.set(self.copies.get() + 1);

        Ok(())
    }
}

impl HostRegion {
    fn new(len: usize, class: MemoryClass) -> Self {
        let data = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(data) as *mut u8;

        Self {
            // `Box` never hands out null pointers
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
            class,
            mapped: false,
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}
