use std::{
    ffi::{CStr, CString},
    ptr::NonNull,
    sync::Mutex,
};

use ard_alloc::{
    device::{Device, DeviceError, DeviceProperties, RawAllocation},
    types::{CopyRegion, MemoryClass},
};
use ard_log::{info, warn};
use ash::vk;
use thiserror::Error;

pub struct VulkanDeviceCreateInfo {
    pub app_name: String,
    /// Enables validation layers.
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum VulkanDeviceCreateError {
    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
    #[error("ash load error: {0}")]
    AshLoadError(ash::LoadingError),
    #[error("no suitable graphics device was found")]
    NoDevice,
    #[error("invalid application name")]
    InvalidName,
}

/// A Vulkan device for GPU allocations. Every block is a buffer bound to its own
/// `VkDeviceMemory`, and copies are recorded into one-shot command buffers on the transfer queue
/// and waited on with a fence.
///
/// [`VulkanDevice::new`] creates a headless device of its own. [`VulkanDevice::from_shared`]
/// wraps a device created elsewhere so the blocks can be bound by the renderer that owns it.
pub struct VulkanDevice {
    /// `None` when the instance and device are borrowed.
    owned: Option<ash::Entry>,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    properties: DeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    transfer_family: u32,
    transfer: Mutex<TransferQueue>,
}

/// Handles of a device created by someone else, usually the renderer.
pub struct VulkanDeviceShareInfo {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    /// Queue family copies are submitted to. Must support transfers.
    pub transfer_family: u32,
    /// Index of the queue within `transfer_family`.
    pub transfer_queue_index: u32,
}

struct TransferQueue {
    queue: vk::Queue,
    pool: vk::CommandPool,
    fence: vk::Fence,
}

/// Every block can be used for any kind of buffer the renderer binds.
const BLOCK_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::VERTEX_BUFFER.as_raw()
        | vk::BufferUsageFlags::INDIRECT_BUFFER.as_raw(),
);

impl VulkanDevice {
    pub fn new(create_info: VulkanDeviceCreateInfo) -> Result<Self, VulkanDeviceCreateError> {
        let app_name = CString::new(create_info.app_name)
            .map_err(|_| VulkanDeviceCreateError::InvalidName)?;

        // Get required instance layers
        let layer_names = if create_info.debug {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            Vec::default()
        };

        // Dynamically load Vulkan
        let entry = unsafe { ash::Entry::load()? };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&instance_create_info, None)? };

        // Query for a physical device
        let (physical_device, transfer_family) = match unsafe { pick_physical_device(&instance) }
        {
            Some(found) => found,
            None => {
                unsafe { instance.destroy_instance(None) };
                return Err(VulkanDeviceCreateError::NoDevice);
            }
        };

        let priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(transfer_family)
            .queue_priorities(&priorities);
        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info));

        let device = match unsafe {
            instance.create_device(physical_device, &device_create_info, None)
        } {
            Ok(device) => device,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err.into());
            }
        };

        let share_info = VulkanDeviceShareInfo {
            instance: instance.clone(),
            physical_device,
            device: device.clone(),
            transfer_family,
            transfer_queue_index: 0,
        };

        match unsafe { Self::from_parts(Some(entry), share_info) } {
            Ok(device) => Ok(device),
            Err(err) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                Err(err.into())
            }
        }
    }

    /// Allocates from a device created elsewhere. The instance and device are not destroyed
    /// when this is dropped.
    ///
    /// # Safety
    /// The instance and device must outlive the returned value. Submissions to the transfer
    /// queue made outside the allocator must be synchronized with it.
    pub unsafe fn from_shared(
        share_info: VulkanDeviceShareInfo,
    ) -> Result<Self, VulkanDeviceCreateError> {
        Ok(Self::from_parts(None, share_info)?)
    }

    unsafe fn from_parts(
        owned: Option<ash::Entry>,
        share_info: VulkanDeviceShareInfo,
    ) -> Result<Self, vk::Result> {
        let VulkanDeviceShareInfo {
            instance,
            physical_device,
            device,
            transfer_family,
            transfer_queue_index,
        } = share_info;

        let properties = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(properties.device_name.as_ptr());
        info!("Using device `{}` for GPU allocations.", name.to_string_lossy());

        let limits = properties.limits;
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let transfer = TransferQueue::new(&device, transfer_family, transfer_queue_index)?;

        let min_alignment = limits
            .min_uniform_buffer_offset_alignment
            .max(limits.min_storage_buffer_offset_alignment)
            .max(limits.non_coherent_atom_size);

        Ok(Self {
            owned,
            instance,
            physical_device,
            device,
            properties: DeviceProperties { min_alignment },
            memory_properties,
            transfer_family,
            transfer: Mutex::new(transfer),
        })
    }

    #[inline(always)]
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline(always)]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline(always)]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[inline(always)]
    pub fn transfer_family(&self) -> u32 {
        self.transfer_family
    }

    fn find_memory_type(&self, type_bits: u32, class: MemoryClass) -> Option<u32> {
        let flags = match class {
            MemoryClass::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryClass::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };

        let props = &self.memory_properties;
        (0..props.memory_type_count).find(|idx| {
            type_bits & (1 << idx) != 0
                && props.memory_types[*idx as usize]
                    .property_flags
                    .contains(flags)
        })
    }

    unsafe fn record_copy(
        &self,
        transfer: &TransferQueue,
        commands: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: CopyRegion,
    ) -> Result<(), vk::Result> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.begin_command_buffer(commands, &begin_info)?;

        let regions = [vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        }];
        self.device.cmd_copy_buffer(commands, src, dst, &regions);
        self.device.end_command_buffer(commands)?;

        let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&commands));
        self.device
            .queue_submit(transfer.queue, std::slice::from_ref(&submit), transfer.fence)?;

        // Copies are synchronous, so wait for the device to finish
        let fence = [transfer.fence];
        self.device.wait_for_fences(&fence, true, u64::MAX)?;
        self.device.reset_fences(&fence)?;

        Ok(())
    }
}

impl Device for VulkanDevice {
    type Buffer = vk::Buffer;
    type Memory = vk::DeviceMemory;

    #[inline(always)]
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    unsafe fn create_raw_allocation(
        &self,
        size: u64,
        class: MemoryClass,
    ) -> Result<RawAllocation<Self>, DeviceError> {
        let buffer_create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(BLOCK_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = self
            .device
            .create_buffer(&buffer_create_info, None)
            .map_err(|err| to_device_error(err, size, class))?;

        let mem_reqs = self.device.get_buffer_memory_requirements(buffer);
        let memory_type = match self.find_memory_type(mem_reqs.memory_type_bits, class) {
            Some(memory_type) => memory_type,
            None => {
                self.device.destroy_buffer(buffer, None);
                return Err(DeviceError::NoMatchingMemoryType(class));
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_reqs.size)
            .memory_type_index(memory_type);
        let memory = match self.device.allocate_memory(&alloc_info, None) {
            Ok(memory) => memory,
            Err(err) => {
                self.device.destroy_buffer(buffer, None);
                return Err(to_device_error(err, size, class));
            }
        };

        // Bind buffer to memory
        if let Err(err) = self.device.bind_buffer_memory(buffer, memory, 0) {
            self.device.free_memory(memory, None);
            self.device.destroy_buffer(buffer, None);
            return Err(DeviceError::Other(err.to_string()));
        }

        Ok(RawAllocation {
            buffer,
            memory,
            size,
            class,
        })
    }

    unsafe fn destroy_raw_allocation(&self, allocation: RawAllocation<Self>) {
        self.device.destroy_buffer(allocation.buffer, None);
        self.device.free_memory(allocation.memory, None);
    }

    unsafe fn map_memory(
        &self,
        memory: &Self::Memory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        let ptr = self
            .device
            .map_memory(*memory, offset, size, vk::MemoryMapFlags::empty())
            .map_err(|err| DeviceError::MapFailed(err.to_string()))?;

        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| DeviceError::MapFailed("driver returned a null mapping".into()))
    }

    unsafe fn unmap_memory(&self, memory: &Self::Memory) {
        // Not flushed because memory is `HOST_COHERENT`
        self.device.unmap_memory(*memory);
    }

    unsafe fn submit_copy(
        &self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        region: CopyRegion,
    ) -> Result<(), DeviceError> {
        let transfer = self
            .transfer
            .lock()
            .map_err(|_| DeviceError::SubmitFailed("transfer queue lock poisoned".into()))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(transfer.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let commands = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|err| DeviceError::SubmitFailed(err.to_string()))?[0];

        let res = self.record_copy(&transfer, commands, *src, *dst, region);
        self.device
            .free_command_buffers(transfer.pool, std::slice::from_ref(&commands));

        res.map_err(|err| DeviceError::SubmitFailed(err.to_string()))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Ok(transfer) = self.transfer.get_mut() {
                if let Err(err) = self.device.queue_wait_idle(transfer.queue) {
                    warn!("Unable to wait for the transfer queue to go idle: {err}");
                }

                self.device.destroy_fence(transfer.fence, None);
                self.device.destroy_command_pool(transfer.pool, None);
            }

            if self.owned.is_some() {
                self.device.destroy_device(None);
                self.instance.destroy_instance(None);
            }
        }
    }
}

impl TransferQueue {
    unsafe fn new(device: &ash::Device, family: u32, index: u32) -> Result<Self, vk::Result> {
        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family);
        let pool = device.create_command_pool(&pool_create_info, None)?;

        let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
            Ok(fence) => fence,
            Err(err) => {
                device.destroy_command_pool(pool, None);
                return Err(err);
            }
        };

        Ok(Self {
            queue: device.get_device_queue(family, index),
            pool,
            fence,
        })
    }
}

/// Picks the best ranked physical device and a queue family on it that supports transfers.
/// Dedicated transfer families are preferred.
unsafe fn pick_physical_device(instance: &ash::Instance) -> Option<(vk::PhysicalDevice, u32)> {
    let devices = instance.enumerate_physical_devices().ok()?;

    let mut device_type = vk::PhysicalDeviceType::OTHER;
    let mut query = None;
    for device in devices {
        let properties = instance.get_physical_device_properties(device);

        let transfer = match find_transfer_family(instance, device) {
            Some(transfer) => transfer,
            None => continue,
        };

        // Pick this device if it's better than the old one
        if device_type_rank(properties.device_type) >= device_type_rank(device_type) {
            device_type = properties.device_type;
            query = Some((device, transfer));
        }
    }

    query
}

unsafe fn find_transfer_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = instance.get_physical_device_queue_family_properties(device);
    let supports_transfer = |flags: vk::QueueFlags| {
        flags.intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    };

    // Look for a dedicated transfer queue. Supported on some devices.
    let dedicated = families.iter().position(|family| {
        family.queue_count > 0
            && family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });

    dedicated
        .or_else(|| {
            families
                .iter()
                .position(|family| family.queue_count > 0 && supports_transfer(family.queue_flags))
        })
        .map(|idx| idx as u32)
}

fn device_type_rank(ty: vk::PhysicalDeviceType) -> u32 {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::CPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

fn to_device_error(err: vk::Result, size: u64, class: MemoryClass) -> DeviceError {
    match err {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DeviceError::OutOfMemory { size, class }
        }
        err => DeviceError::Other(err.to_string()),
    }
}

impl From<vk::Result> for VulkanDeviceCreateError {
    fn from(res: vk::Result) -> Self {
        VulkanDeviceCreateError::Vulkan(res)
    }
}

impl From<ash::LoadingError> for VulkanDeviceCreateError {
    fn from(err: ash::LoadingError) -> Self {
        VulkanDeviceCreateError::AshLoadError(err)
    }
}
