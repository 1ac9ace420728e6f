pub mod log {
    pub use ard_log::*;
}

pub mod alloc {
    pub use ard_alloc::*;
}

#[cfg(feature = "vulkan")]
pub mod backend {
    pub use ard_alloc_vulkan::{
        VulkanDevice, VulkanDeviceCreateError, VulkanDeviceCreateInfo, VulkanDeviceShareInfo,
    };
}

pub mod prelude {
    pub use ard_alloc::prelude::*;

    #[cfg(feature = "vulkan")]
    pub type Device = ard_alloc_vulkan::VulkanDevice;

    #[cfg(not(feature = "vulkan"))]
    pub type Device = ard_alloc::host::HostDevice;

    pub type SegmentAllocator = ard_alloc::allocator::SegmentAllocator<Device>;
    pub type SegmentView<'a> = ard_alloc::mapper::SegmentView<'a, Device>;
}
