use std::{collections::BTreeMap, ptr::NonNull};

use crate::{
    device::{Device, RawAllocation},
    error::PartitionError,
    ranges::RangeTable,
    types::MemoryClass,
};

/// Unique identifier of a block. Ids are never reused by an allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

/// Whether a block's memory currently has a retained host mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mapping {
    Unmapped,
    /// The whole block is mapped and the pointer points at offset `0`.
    Persistent(MappedPtr),
}

/// Pointer to the start of a persistently mapped block.
///
/// The memory behind it belongs to the block, and every write through it goes through
/// `&mut SegmentAllocator`, so the pointer can move between threads with the block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    #[inline(always)]
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// A single coarse device allocation that segments are carved out of.
pub struct Block<D: Device> {
    id: BlockId,
    raw: RawAllocation<D>,
    ranges: RangeTable,
    pub(crate) mapping: Mapping,
}

impl<D: Device> Block<D> {
    pub(crate) fn new(id: BlockId, raw: RawAllocation<D>) -> Self {
        Self {
            id,
            ranges: RangeTable::new(raw.size),
            raw,
            mapping: Mapping::Unmapped,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline(always)]
    pub fn class(&self) -> MemoryClass {
        self.raw.class
    }

    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.raw.size
    }

    #[inline(always)]
    pub fn buffer(&self) -> &D::Buffer {
        &self.raw.buffer
    }

    #[inline(always)]
    pub fn memory(&self) -> &D::Memory {
        &self.raw.memory
    }

    #[inline(always)]
    pub fn mapping(&self) -> Mapping {
        self.mapping
    }

    /// Currently reserved ranges as `offset -> size`.
    #[inline(always)]
    pub fn allocated(&self) -> &BTreeMap<u64, u64> {
        self.ranges.allocated()
    }

    /// Currently available ranges as `offset -> size`.
    #[inline(always)]
    pub fn free(&self) -> &BTreeMap<u64, u64> {
        self.ranges.free()
    }

    #[inline(always)]
    pub fn segment_count(&self) -> usize {
        self.ranges.allocated().len()
    }

    #[inline(always)]
    pub fn ranges(&self) -> &RangeTable {
        &self.ranges
    }

    /// Reserves `size` bytes within the block. Returns the offset of the reservation, or `None`
    /// if no free range is large enough.
    #[inline]
    pub fn find_free_segment(&mut self, size: u64) -> Option<u64> {
        self.ranges.reserve(size)
    }

    #[inline]
    pub(crate) fn release(&mut self, offset: u64, size: u64, coalesce: bool) -> bool {
        self.ranges.release(offset, size, coalesce)
    }

    #[inline]
    pub fn validate(&self) -> Result<(), PartitionError> {
        self.ranges.validate()
    }

    #[inline]
    pub(crate) fn into_raw(self) -> RawAllocation<D> {
        self.raw
    }
}
