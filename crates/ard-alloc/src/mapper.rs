use std::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use bytemuck::Pod;

use crate::{
    allocator::SegmentAllocator,
    block::{Block, Mapping},
    device::{Device, RawAllocation},
    error::AllocatorError,
    segment::SegmentHandle,
    types::{CopyRegion, MemoryClass},
};

/// A host view of mapped memory. Unmaps the memory when dropped unless the memory is
/// persistently mapped.
pub struct SegmentView<'a, D: Device> {
    device: &'a D,
    memory: &'a D::Memory,
    slice: &'a mut [u8],
    unmap_on_drop: bool,
}

/// A temporary host visible allocation used to move data in and out of device local memory. Not
/// tracked by any block.
struct StagingBuffer<'a, D: Device> {
    device: &'a D,
    raw: ManuallyDrop<RawAllocation<D>>,
}

impl<D: Device> SegmentAllocator<D> {
    /// Copies `data` into the segment starting `dst_sub_offset` bytes into it.
    ///
    /// `HostVisible` segments are written through a mapping of the block. `DeviceLocal` segments
    /// are written to a temporary staging buffer which is then copied into the block by the
    /// device. The copy is waited on before this function returns.
    pub fn map(
        &mut self,
        handle: &SegmentHandle,
        data: &[u8],
        dst_sub_offset: u64,
    ) -> Result<(), AllocatorError> {
        puffin::profile_function!();

        check_bounds(handle, dst_sub_offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }

        let device = self.device().as_ref();
        let block = self.segment_block(handle)?;

        match block.class() {
            MemoryClass::HostVisible => {
                let mut view = unsafe { view_segment(device, block, handle)? };
                let start = dst_sub_offset as usize;
                view[start..(start + data.len())].copy_from_slice(data);
            }
            MemoryClass::DeviceLocal => {
                let staging = StagingBuffer::new(device, handle.size)?;
                staging.write(dst_sub_offset, data)?;
                unsafe {
                    device.submit_copy(
                        staging.buffer(),
                        block.buffer(),
                        CopyRegion {
                            src_offset: dst_sub_offset,
                            dst_offset: handle.offset + dst_sub_offset,
                            size: data.len() as u64,
                        },
                    )?;
                }
            }
        }

        Ok(())
    }

    /// Writes a slice of plain old data into the segment.
    #[inline]
    pub fn map_pod<T: Pod>(
        &mut self,
        handle: &SegmentHandle,
        data: &[T],
        dst_sub_offset: u64,
    ) -> Result<(), AllocatorError> {
        self.map(handle, bytemuck::cast_slice(data), dst_sub_offset)
    }

    /// Copies `out.len()` bytes from the segment, starting `src_sub_offset` bytes into it.
    ///
    /// `DeviceLocal` segments are copied into a staging buffer by the device first, which is
    /// waited on before reading.
    pub fn read(
        &mut self,
        handle: &SegmentHandle,
        out: &mut [u8],
        src_sub_offset: u64,
    ) -> Result<(), AllocatorError> {
        puffin::profile_function!();

        check_bounds(handle, src_sub_offset, out.len() as u64)?;
        if out.is_empty() {
            return Ok(());
        }

        let device = self.device().as_ref();
        let block = self.segment_block(handle)?;

        match block.class() {
            MemoryClass::HostVisible => {
                let view = unsafe { view_segment(device, block, handle)? };
                let start = src_sub_offset as usize;
                out.copy_from_slice(&view[start..(start + out.len())]);
            }
            MemoryClass::DeviceLocal => {
                let staging = StagingBuffer::new(device, handle.size)?;
                unsafe {
                    device.submit_copy(
                        block.buffer(),
                        staging.buffer(),
                        CopyRegion {
                            src_offset: handle.offset + src_sub_offset,
                            dst_offset: src_sub_offset,
                            size: out.len() as u64,
                        },
                    )?;
                }
                staging.read(src_sub_offset, out)?;
            }
        }

        Ok(())
    }

    /// Provides a mutable view of a `HostVisible` segment.
    ///
    /// The view covers exactly the segment. `DeviceLocal` segments can't be viewed and fail with
    /// `NotMappable`.
    pub fn view(&mut self, handle: &SegmentHandle) -> Result<SegmentView<'_, D>, AllocatorError> {
        let device = self.blocks().device().as_ref();
        let block = self.segment_block(handle)?;

        if !block.class().is_mappable() {
            return Err(AllocatorError::NotMappable(block.class()));
        }

        unsafe { view_segment(device, block, handle) }
    }
}

#[inline]
fn check_bounds(handle: &SegmentHandle, offset: u64, len: u64) -> Result<(), AllocatorError> {
    match offset.checked_add(len) {
        Some(end) if end <= handle.size => Ok(()),
        _ => Err(AllocatorError::OutOfBounds {
            offset,
            len,
            size: handle.size,
        }),
    }
}

/// Maps the range of `block` covered by `handle`, reusing the persistent mapping if the block
/// has one.
unsafe fn view_segment<'a, D: Device>(
    device: &'a D,
    block: &'a Block<D>,
    handle: &SegmentHandle,
) -> Result<SegmentView<'a, D>, AllocatorError> {
    match block.mapping() {
        Mapping::Persistent(base) => {
            let ptr = base.as_ptr().add(handle.offset as usize);
            Ok(SegmentView {
                device,
                memory: block.memory(),
                slice: std::slice::from_raw_parts_mut(ptr, handle.size as usize),
                unmap_on_drop: false,
            })
        }
        Mapping::Unmapped => {
            SegmentView::map(device, block.memory(), handle.offset, handle.size)
        }
    }
}

impl<'a, D: Device> SegmentView<'a, D> {
    unsafe fn map(
        device: &'a D,
        memory: &'a D::Memory,
        offset: u64,
        size: u64,
    ) -> Result<Self, AllocatorError> {
        let ptr = device.map_memory(memory, offset, size)?;
        Ok(Self {
            device,
            memory,
            slice: std::slice::from_raw_parts_mut(ptr.as_ptr(), size as usize),
            unmap_on_drop: true,
        })
    }
}

impl<'a, D: Device> Deref for SegmentView<'a, D> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        self.slice
    }
}

impl<'a, D: Device> DerefMut for SegmentView<'a, D> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice
    }
}

impl<'a, D: Device> Drop for SegmentView<'a, D> {
    fn drop(&mut self) {
        if self.unmap_on_drop {
            unsafe {
                self.device.unmap_memory(self.memory);
            }
        }
    }
}

impl<'a, D: Device> StagingBuffer<'a, D> {
    fn new(device: &'a D, size: u64) -> Result<Self, AllocatorError> {
        let raw = unsafe { device.create_raw_allocation(size, MemoryClass::HostVisible)? };
        Ok(Self {
            device,
            raw: ManuallyDrop::new(raw),
        })
    }

    #[inline(always)]
    fn buffer(&self) -> &D::Buffer {
        &self.raw.buffer
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), AllocatorError> {
        let mut view = unsafe { SegmentView::map(self.device, &self.raw.memory, 0, self.raw.size)? };
        let start = offset as usize;
        view[start..(start + data.len())].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), AllocatorError> {
        let view = unsafe { SegmentView::map(self.device, &self.raw.memory, 0, self.raw.size)? };
        let start = offset as usize;
        out.copy_from_slice(&view[start..(start + out.len())]);
        Ok(())
    }
}

impl<'a, D: Device> Drop for StagingBuffer<'a, D> {
    fn drop(&mut self) {
        unsafe {
            self.device
                .destroy_raw_allocation(ManuallyDrop::take(&mut self.raw));
        }
    }
}
