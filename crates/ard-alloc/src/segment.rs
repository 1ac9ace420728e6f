use std::sync::atomic::{AtomicU32, Ordering};

use crate::block::BlockId;

/// Identifies the allocator that issued a handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AllocatorId(u32);

/// A caller owned range of a block.
///
/// Handles are the only way to write into or free a segment. They are deliberately neither
/// `Clone` nor `Copy`: a copy would not duplicate the reservation, so there is only ever one
/// owner. Destroying a segment consumes its handle.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SegmentHandle {
    pub(crate) allocator: AllocatorId,
    pub(crate) block: BlockId,
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

static NEXT_ALLOCATOR_ID: AtomicU32 = AtomicU32::new(1);

impl AllocatorId {
    pub(crate) fn next() -> Self {
        AllocatorId(NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserved for handles that were never allocated.
    pub(crate) const NONE: AllocatorId = AllocatorId(0);
}

impl SegmentHandle {
    /// A handle with no backing range. Destroying it does nothing.
    #[inline]
    pub fn empty() -> Self {
        Self {
            allocator: AllocatorId::NONE,
            block: BlockId(u32::MAX),
            offset: 0,
            size: 0,
        }
    }

    #[inline(always)]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Offset in bytes of the segment within its block.
    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes of the segment after alignment.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The byte range this segment covers within its block.
    #[inline]
    pub fn range(&self) -> std::ops::Range<u64> {
        self.offset..(self.offset + self.size)
    }
}

impl Default for SegmentHandle {
    fn default() -> Self {
        Self::empty()
    }
}
