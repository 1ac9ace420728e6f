use serde::{Deserialize, Serialize};

/// Describes what memory operations a block supports.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryClass {
    /// The CPU can write to the memory directly. Used for data that is updated every frame.
    HostVisible,
    /// Memory only the GPU can access. Fastest for static data, but requires a staging copy to
    /// update.
    DeviceLocal,
}

/// How a segment is expected to be used. Each intent maps to exactly one [`MemoryClass`].
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UsageIntent {
    /// Written frequently by the CPU.
    Dynamic,
    /// Written rarely, read often by the GPU.
    Static,
}

impl UsageIntent {
    #[inline(always)]
    pub fn memory_class(self) -> MemoryClass {
        match self {
            UsageIntent::Dynamic => MemoryClass::HostVisible,
            UsageIntent::Static => MemoryClass::DeviceLocal,
        }
    }
}

impl From<UsageIntent> for MemoryClass {
    #[inline(always)]
    fn from(intent: UsageIntent) -> Self {
        intent.memory_class()
    }
}

impl MemoryClass {
    #[inline(always)]
    pub fn is_mappable(self) -> bool {
        self == MemoryClass::HostVisible
    }
}

/// Describes a single buffer to buffer copy.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Rounds `size` up to a multiple of `align`. An alignment of `0` means no alignment. Returns
/// `None` if the rounded size doesn't fit in a `u64`.
#[inline(always)]
pub fn align_up(size: u64, align: u64) -> Option<u64> {
    match align {
        0 => Some(size),
        align => size.checked_next_multiple_of(align),
    }
}
