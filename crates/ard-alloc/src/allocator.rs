use std::sync::Arc;

use ard_log::{trace, warn};

use crate::{
    block::{Block, BlockId},
    blocks::BlockAllocator,
    config::AllocatorConfig,
    device::Device,
    error::{AllocatorError, PartitionError},
    segment::{AllocatorId, SegmentHandle},
    types::{align_up, MemoryClass, UsageIntent},
};

/// Carves segments out of blocks, creating new blocks whenever the existing ones are full.
///
/// # Synchronization
/// The allocator has no internal locking. Every operation that touches the block tables takes
/// `&mut self`, so callers sharing an allocator between threads must put it behind their own
/// lock. The allocator is `Send` and `Sync` whenever the device and its handles are.
pub struct SegmentAllocator<D: Device> {
    id: AllocatorId,
    blocks: BlockAllocator<D>,
}

/// Usage summary for one memory class.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub blocks: usize,
    /// Total size of every block.
    pub reserved_bytes: u64,
    /// Bytes currently handed out as segments.
    pub allocated_bytes: u64,
    pub segments: usize,
    pub free_ranges: usize,
    pub largest_free_range: u64,
}

impl<D: Device> SegmentAllocator<D> {
    pub fn new(device: Arc<D>, config: AllocatorConfig) -> Self {
        Self {
            id: AllocatorId::next(),
            blocks: BlockAllocator::new(device, config),
        }
    }

    #[inline(always)]
    pub fn device(&self) -> &Arc<D> {
        self.blocks.device()
    }

    #[inline(always)]
    pub fn config(&self) -> &AllocatorConfig {
        self.blocks.config()
    }

    #[inline(always)]
    pub fn min_alignment(&self) -> u64 {
        self.blocks.min_alignment()
    }

    #[inline(always)]
    pub fn blocks(&self) -> &BlockAllocator<D> {
        &self.blocks
    }

    #[inline(always)]
    pub fn block(&self, id: BlockId) -> Option<&Block<D>> {
        self.blocks.get(id)
    }

    #[inline(always)]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline(always)]
    pub fn allocate_block(
        &mut self,
        class: MemoryClass,
        size_hint: u64,
    ) -> Result<BlockId, AllocatorError> {
        self.blocks.allocate_block(class, size_hint)
    }

    #[inline(always)]
    pub fn find_block_of_class(&self, class: MemoryClass) -> Option<BlockId> {
        self.blocks.find_block_of_class(class)
    }

    #[inline(always)]
    pub fn destroy_block(&mut self, id: BlockId) -> Result<(), AllocatorError> {
        self.blocks.destroy_block(id)
    }

    /// The device buffer backing a block, for binding directly in draw calls.
    #[inline]
    pub fn get_raw_buffer(&self, id: BlockId) -> Result<&D::Buffer, AllocatorError> {
        self.blocks
            .get(id)
            .map(|block| block.buffer())
            .ok_or(AllocatorError::UnknownBlock(id))
    }

    /// Reserves a segment of at least `size` bytes in memory suited to `intent`.
    ///
    /// The size is rounded up to the device's minimum alignment. Blocks of the matching class
    /// are searched in creation order. If none has room, a new block is created, large enough
    /// for the request if it exceeds the default block size. A `size` of `0` returns an empty
    /// handle.
    pub fn allocate(
        &mut self,
        intent: UsageIntent,
        size: u64,
    ) -> Result<SegmentHandle, AllocatorError> {
        puffin::profile_function!();

        if size == 0 {
            return Ok(SegmentHandle::empty());
        }

        let class = intent.memory_class();
        let max = self.config().max_block_size;
        let aligned_size = match align_up(size, self.min_alignment()) {
            Some(aligned) if aligned <= max => aligned,
            aligned => {
                return Err(AllocatorError::RequestTooLarge {
                    requested: aligned.unwrap_or(size),
                    max,
                })
            }
        };

        let (block, offset) = match self.blocks.reserve_in_class(class, aligned_size) {
            Some(found) => found,
            None => {
                let default_size = self.config().default_block_size(class);
                if aligned_size > default_size {
                    warn!(
                        "Segment of `{aligned_size}` bytes is larger than the default \
                        {class:?} block size. Consider making the default larger."
                    );
                }

                // Defaults outside of `max` are clamped so growing never fails on them
                let size_hint = aligned_size.max(default_size.min(max));

                let id = self.blocks.allocate_block(class, size_hint)?;
                let offset = self
                    .blocks
                    .get_mut(id)
                    .and_then(|block| block.find_free_segment(aligned_size))
                    .ok_or(AllocatorError::RequestTooLarge {
                        requested: aligned_size,
                        max,
                    })?;
                (id, offset)
            }
        };

        trace!("Allocated `{aligned_size}` bytes at `{offset}` in block `{block:?}`.");
        debug_assert!(self
            .blocks
            .get(block)
            .map(|block| block.validate().is_ok())
            .unwrap_or(false));

        Ok(SegmentHandle {
            allocator: self.id,
            block,
            offset,
            size: aligned_size,
        })
    }

    /// Returns a segment's range to its block.
    ///
    /// Empty handles are ignored. Handles that don't describe a live segment of this allocator
    /// fail with `InvalidHandle`.
    pub fn destroy_segment(&mut self, handle: SegmentHandle) -> Result<(), AllocatorError> {
        puffin::profile_function!();

        if handle.is_empty() {
            return Ok(());
        }

        if handle.allocator != self.id {
            return Err(AllocatorError::InvalidHandle);
        }

        let coalesce = self.config().coalesce_free_ranges;
        let block = self
            .blocks
            .get_mut(handle.block)
            .ok_or(AllocatorError::InvalidHandle)?;

        if !block.release(handle.offset, handle.size, coalesce) {
            return Err(AllocatorError::InvalidHandle);
        }

        trace!(
            "Freed `{}` bytes at `{}` in block `{:?}`.",
            handle.size,
            handle.offset,
            handle.block
        );
        debug_assert!(block.validate().is_ok());

        Ok(())
    }

    /// Finds the block a handle was carved from, checking that the handle is still live.
    pub(crate) fn segment_block(
        &self,
        handle: &SegmentHandle,
    ) -> Result<&Block<D>, AllocatorError> {
        if handle.allocator != self.id {
            return Err(AllocatorError::InvalidHandle);
        }

        let block = self
            .blocks
            .get(handle.block)
            .ok_or(AllocatorError::InvalidHandle)?;

        match block.allocated().get(&handle.offset) {
            Some(size) if *size == handle.size => Ok(block),
            _ => Err(AllocatorError::InvalidHandle),
        }
    }

    pub fn stats(&self, class: MemoryClass) -> ClassStats {
        self.blocks
            .blocks_of_class(class)
            .iter()
            .filter_map(|id| self.blocks.get(*id))
            .fold(ClassStats::default(), |mut stats, block| {
                let ranges = block.ranges();
                stats.blocks += 1;
                stats.reserved_bytes += block.size();
                stats.allocated_bytes += ranges.allocated_bytes();
                stats.segments += ranges.allocated().len();
                stats.free_ranges += ranges.free().len();
                stats.largest_free_range = stats.largest_free_range.max(ranges.largest_free());
                stats
            })
    }

    /// Checks the partition invariant of every block.
    pub fn validate(&self) -> Result<(), (BlockId, PartitionError)> {
        self.blocks
            .iter()
            .try_for_each(|block| block.validate().map_err(|err| (block.id(), err)))
    }
}
