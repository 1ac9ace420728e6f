use std::sync::Arc;

use ard_log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::{
    block::{Block, BlockId, MappedPtr, Mapping},
    config::AllocatorConfig,
    device::Device,
    error::AllocatorError,
    types::{align_up, MemoryClass},
};

/// Creates and destroys blocks.
///
/// Blocks of each class are remembered in creation order, which is the order they are searched
/// when looking for free space.
pub struct BlockAllocator<D: Device> {
    device: Arc<D>,
    config: AllocatorConfig,
    min_alignment: u64,
    /// Ids are handed out monotonically and never reused.
    next_id: u32,
    blocks: FxHashMap<BlockId, Block<D>>,
    by_class: FxHashMap<MemoryClass, Vec<BlockId>>,
}

impl<D: Device> BlockAllocator<D> {
    pub fn new(device: Arc<D>, config: AllocatorConfig) -> Self {
        if let Err(err) = config.validate() {
            warn!("Allocator config is invalid: {err}");
        }

        let min_alignment = device.properties().min_alignment;
        Self {
            device,
            config,
            min_alignment,
            next_id: 0,
            blocks: FxHashMap::default(),
            by_class: FxHashMap::default(),
        }
    }

    #[inline(always)]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[inline(always)]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    #[inline(always)]
    pub fn min_alignment(&self) -> u64 {
        self.min_alignment
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline(always)]
    pub fn get(&self, id: BlockId) -> Option<&Block<D>> {
        self.blocks.get(&id)
    }

    #[inline(always)]
    pub(crate) fn get_mut(&mut self, id: BlockId) -> Option<&mut Block<D>> {
        self.blocks.get_mut(&id)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Block<D>> {
        self.blocks.values()
    }

    /// Ids of every live block of `class` in creation order.
    #[inline]
    pub fn blocks_of_class(&self, class: MemoryClass) -> &[BlockId] {
        self.by_class
            .get(&class)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// The oldest live block of `class`, if there is one.
    #[inline]
    pub fn find_block_of_class(&self, class: MemoryClass) -> Option<BlockId> {
        self.blocks_of_class(class).first().copied()
    }

    /// Creates a new block. A `size_hint` of `0` uses the default block size for the class.
    /// The final size is rounded up to the device's minimum alignment.
    pub fn allocate_block(
        &mut self,
        class: MemoryClass,
        size_hint: u64,
    ) -> Result<BlockId, AllocatorError> {
        let size = match size_hint {
            0 => self.config.default_block_size(class),
            size => size,
        };
        if size == 0 {
            return Err(AllocatorError::EmptyBlock(class));
        }
        let max = self.config.max_block_size;
        let size = match align_up(size, self.min_alignment) {
            Some(aligned) if aligned <= max => aligned,
            aligned => {
                return Err(AllocatorError::RequestTooLarge {
                    requested: aligned.unwrap_or(size),
                    max,
                })
            }
        };

        let raw = unsafe { self.device.create_raw_allocation(size, class)? };
        let id = BlockId(self.next_id);
        let mut block = Block::new(id, raw);

        if self.config.persistent_mapping && class.is_mappable() {
            match unsafe { self.device.map_memory(block.memory(), 0, size) } {
                Ok(ptr) => block.mapping = Mapping::Persistent(MappedPtr::new(ptr)),
                Err(err) => {
                    unsafe { self.device.destroy_raw_allocation(block.into_raw()) };
                    return Err(err.into());
                }
            }
        }

        self.next_id += 1;
        self.blocks.insert(id, block);
        self.by_class.entry(class).or_default().push(id);

        debug!("Created {class:?} block `{}` of `{size}` bytes.", id.0);

        Ok(id)
    }

    /// Destroys a block and frees its device memory.
    ///
    /// Fails with `BlockInUse` if segments are still allocated from the block.
    pub fn destroy_block(&mut self, id: BlockId) -> Result<(), AllocatorError> {
        let block = self.blocks.get(&id).ok_or(AllocatorError::UnknownBlock(id))?;
        if block.segment_count() > 0 {
            return Err(AllocatorError::BlockInUse {
                id,
                segments: block.segment_count(),
            });
        }

        let block = match self.blocks.remove(&id) {
            Some(block) => block,
            None => return Err(AllocatorError::UnknownBlock(id)),
        };
        if let Some(ids) = self.by_class.get_mut(&block.class()) {
            ids.retain(|other| *other != id);
        }

        debug!("Destroyed {:?} block `{}`.", block.class(), id.0);
        unsafe { release_block(self.device.as_ref(), block) };

        Ok(())
    }

    /// Reserves `size` bytes in the first block of `class` that has room for them.
    pub(crate) fn reserve_in_class(
        &mut self,
        class: MemoryClass,
        size: u64,
    ) -> Option<(BlockId, u64)> {
        let ids = self.by_class.get(&class)?;
        ids.iter().find_map(|id| {
            let block = self.blocks.get_mut(id)?;
            block.find_free_segment(size).map(|offset| (*id, offset))
        })
    }
}

impl<D: Device> Drop for BlockAllocator<D> {
    fn drop(&mut self) {
        for (id, block) in self.blocks.drain() {
            if block.segment_count() > 0 {
                warn!(
                    "Block `{}` destroyed with `{}` live segments.",
                    id.0,
                    block.segment_count()
                );
            }

            unsafe { release_block(self.device.as_ref(), block) };
        }
    }
}

unsafe fn release_block<D: Device>(device: &D, block: Block<D>) {
    if block.mapping() != Mapping::Unmapped {
        device.unmap_memory(block.memory());
    }
    device.destroy_raw_allocation(block.into_raw());
}
