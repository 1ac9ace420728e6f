use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MemoryClass;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Size of blocks created for `DeviceLocal` memory when no size is requested.
    pub device_local_block_size: u64,
    /// Size of blocks created for `HostVisible` memory when no size is requested.
    pub host_visible_block_size: u64,
    /// Requests that don't fit in a default sized block get a block of their own, up to this
    /// size. Larger requests fail with `RequestTooLarge`.
    pub max_block_size: u64,
    /// Merge free ranges that touch when a segment is destroyed.
    pub coalesce_free_ranges: bool,
    /// Map `HostVisible` blocks once when they are created and keep the pointer around until the
    /// block is destroyed, instead of mapping on every write.
    pub persistent_mapping: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read allocator config: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse allocator config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("default {0:?} block size must not be zero")]
    ZeroBlockSize(MemoryClass),
    #[error("default {class:?} block size `{size}` is larger than the maximum of `{max}`")]
    BlockLargerThanMax {
        class: MemoryClass,
        size: u64,
        max: u64,
    },
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            device_local_block_size: 256 * MIB,
            host_visible_block_size: 64 * MIB,
            max_block_size: 1024 * MIB,
            coalesce_free_ranges: true,
            persistent_mapping: false,
        }
    }
}

impl AllocatorConfig {
    pub fn from_ron(src: &str) -> Result<Self, ConfigError> {
        let config = ron::from_str::<AllocatorConfig>(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        Self::from_ron(&src)
    }

    /// Checks that a default sized block can be created for every class.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in [MemoryClass::HostVisible, MemoryClass::DeviceLocal] {
            let size = self.default_block_size(class);
            if size == 0 {
                return Err(ConfigError::ZeroBlockSize(class));
            }

            if size > self.max_block_size {
                return Err(ConfigError::BlockLargerThanMax {
                    class,
                    size,
                    max: self.max_block_size,
                });
            }
        }

        Ok(())
    }

    #[inline]
    pub fn default_block_size(&self, class: MemoryClass) -> u64 {
        match class {
            MemoryClass::DeviceLocal => self.device_local_block_size,
            MemoryClass::HostVisible => self.host_visible_block_size,
        }
    }
}
