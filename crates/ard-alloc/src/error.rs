use thiserror::Error;

use crate::{block::BlockId, device::DeviceError, types::MemoryClass};

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("device out of memory while allocating a `{size}` byte {class:?} block")]
    DeviceOutOfMemory { size: u64, class: MemoryClass },
    #[error("the device has no memory type suitable for {0:?} memory")]
    NoMatchingMemoryType(MemoryClass),
    #[error("segment handle does not refer to a live segment of this allocator")]
    InvalidHandle,
    #[error("block `{0:?}` does not exist")]
    UnknownBlock(BlockId),
    #[error("block `{id:?}` still has `{segments}` live segments")]
    BlockInUse { id: BlockId, segments: usize },
    #[error("default {0:?} block size is zero")]
    EmptyBlock(MemoryClass),
    #[error("requested `{requested}` bytes but the largest allowed block is `{max}` bytes")]
    RequestTooLarge { requested: u64, max: u64 },
    #[error("access of `{len}` bytes at `{offset}` is outside a `{size}` byte segment")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("segment is in {0:?} memory which cannot be viewed directly")]
    NotMappable(MemoryClass),
    #[error("device error: {0}")]
    Device(DeviceError),
}

impl From<DeviceError> for AllocatorError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory { size, class } => {
                AllocatorError::DeviceOutOfMemory { size, class }
            }
            DeviceError::NoMatchingMemoryType(class) => AllocatorError::NoMatchingMemoryType(class),
            err => AllocatorError::Device(err),
        }
    }
}

/// Describes how a block's range table violates the partition invariant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("range at `{offset}` has zero size")]
    EmptyRange { offset: u64 },
    #[error("range at `{offset}` is both allocated and free")]
    Duplicate { offset: u64 },
    #[error("range at `{offset}` overlaps the range ending at `{prev_end}`")]
    Overlap { offset: u64, prev_end: u64 },
    #[error("bytes `{start}..{end}` are neither allocated nor free")]
    Gap { start: u64, end: u64 },
    #[error("ranges end at `{end}` but the block is `{size}` bytes")]
    Overrun { end: u64, size: u64 },
}
