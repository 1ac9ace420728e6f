use std::{
    ptr::NonNull,
    sync::{Arc, Mutex},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{config::MIB, prelude::*};

const KIB: u64 = 1024;

fn host_device() -> Arc<HostDevice> {
    Arc::new(HostDevice::new(HostDeviceCreateInfo::default()))
}

fn small_config() -> AllocatorConfig {
    AllocatorConfig {
        device_local_block_size: 64 * KIB,
        host_visible_block_size: 64 * KIB,
        max_block_size: MIB,
        ..Default::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

#[test]
fn dynamic_segment_is_aligned() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), AllocatorConfig::default());

    let segment = allocator.allocate(UsageIntent::Dynamic, 10).unwrap();

    assert_eq!(segment.size(), 256);
    assert_eq!(allocator.block_count(), 1);

    let block = allocator.block(segment.block()).unwrap();
    assert_eq!(block.class(), MemoryClass::HostVisible);
    assert_eq!(block.allocated().iter().collect::<Vec<_>>(), vec![(&0, &256)]);
    assert_eq!(
        block.free().iter().collect::<Vec<_>>(),
        vec![(&256, &(64 * MIB - 256))]
    );
}

#[test]
fn static_segments_share_a_block() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), AllocatorConfig::default());

    let a = allocator.allocate(UsageIntent::Static, 1024).unwrap();
    let b = allocator.allocate(UsageIntent::Static, 1024).unwrap();

    assert_eq!(a.block(), b.block());
    assert_eq!(allocator.block_count(), 1);
    assert!(a.range().end <= b.range().start || b.range().end <= a.range().start);

    let block = allocator.block(a.block()).unwrap();
    assert_eq!(block.class(), MemoryClass::DeviceLocal);
    assert_eq!(block.size(), 256 * MIB);
    assert_eq!(block.allocated().len(), 2);
    assert_eq!(block.allocated().values().sum::<u64>(), 2048);
}

#[test]
fn freeing_a_segment_does_not_merge_with_distant_ranges() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), AllocatorConfig::default());

    let a = allocator.allocate(UsageIntent::Static, 1024).unwrap();
    let b = allocator.allocate(UsageIntent::Static, 1024).unwrap();
    let block_id = a.block();
    allocator.destroy_segment(a).unwrap();

    let block = allocator.block(block_id).unwrap();
    assert_eq!(block.allocated().iter().collect::<Vec<_>>(), vec![(&1024, &1024)]);
    assert_eq!(block.free().len(), 2);
    assert_eq!(block.free().get(&0), Some(&1024));
    assert_eq!(block.free().get(&2048), Some(&(256 * MIB - 2048)));
    assert_eq!(b.offset(), 1024);
    assert_eq!(allocator.validate(), Ok(()));
}

#[test]
fn freeing_neighbors_coalesces() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let a = allocator.allocate(UsageIntent::Dynamic, 1024).unwrap();
    let b = allocator.allocate(UsageIntent::Dynamic, 1024).unwrap();
    let block_id = a.block();
    allocator.destroy_segment(a).unwrap();
    allocator.destroy_segment(b).unwrap();

    let block = allocator.block(block_id).unwrap();
    assert!(block.allocated().is_empty());
    assert_eq!(block.free().iter().collect::<Vec<_>>(), vec![(&0, &(64 * KIB))]);
}

#[test]
fn without_coalescing_ranges_stay_split() {
    let device = host_device();
    let config = AllocatorConfig {
        coalesce_free_ranges: false,
        ..small_config()
    };
    let mut allocator = SegmentAllocator::new(device, config);

    let a = allocator.allocate(UsageIntent::Dynamic, 1024).unwrap();
    let b = allocator.allocate(UsageIntent::Dynamic, 1024).unwrap();
    let block_id = a.block();
    allocator.destroy_segment(a).unwrap();
    allocator.destroy_segment(b).unwrap();

    let block = allocator.block(block_id).unwrap();
    assert_eq!(block.free().len(), 3);
    assert_eq!(allocator.validate(), Ok(()));
}

#[test]
fn sizes_are_rounded_to_alignment() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());
    let align = allocator.min_alignment();

    for requested in [1, 255, 256, 257, 1000, 4096, 5000] {
        let segment = allocator.allocate(UsageIntent::Dynamic, requested).unwrap();
        assert_eq!(segment.size() % align, 0);
        assert_eq!(segment.offset() % align, 0);
        assert!(segment.size() >= requested);
        assert!(segment.size() - requested < align);
    }
}

#[test]
fn host_visible_round_trip() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    let _padding = allocator.allocate(UsageIntent::Dynamic, 512).unwrap();
    let segment = allocator.allocate(UsageIntent::Dynamic, 300).unwrap();
    let data = pattern(300, 7);
    allocator.map(&segment, &data, 0).unwrap();

    let block = allocator.block(segment.block()).unwrap();
    assert_eq!(
        device.read_raw(block.memory(), segment.offset(), data.len()),
        Some(data)
    );
    assert!(!device.is_mapped(block.memory()));
    assert_eq!(device.copies_submitted(), 0);
}

#[test]
fn device_local_round_trip() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    let _padding = allocator.allocate(UsageIntent::Static, 256).unwrap();
    let segment = allocator.allocate(UsageIntent::Static, 1000).unwrap();
    let data = pattern(1000, 3);
    allocator.map(&segment, &data, 0).unwrap();
    assert_eq!(device.copies_submitted(), 1);

    let mut out = vec![0; 1000];
    allocator.read(&segment, &mut out, 0).unwrap();
    assert_eq!(out, data);
    assert_eq!(device.copies_submitted(), 2);

    // Staging buffers don't outlive the call
    assert_eq!(device.live_allocations(), 1);

    let block = allocator.block(segment.block()).unwrap();
    assert_eq!(
        device.read_raw(block.memory(), segment.offset(), data.len()),
        Some(data)
    );
}

#[test]
fn sub_offset_writes_land_inside_the_segment() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    for intent in [UsageIntent::Dynamic, UsageIntent::Static] {
        let segment = allocator.allocate(intent, 512).unwrap();
        allocator.map(&segment, &[1; 512], 0).unwrap();
        allocator.map(&segment, &[9; 16], 100).unwrap();

        let mut out = vec![0; 512];
        allocator.read(&segment, &mut out, 0).unwrap();
        assert!(out[..100].iter().all(|b| *b == 1));
        assert!(out[100..116].iter().all(|b| *b == 9));
        assert!(out[116..].iter().all(|b| *b == 1));

        let mut window = [0; 4];
        allocator.read(&segment, &mut window, 98).unwrap();
        assert_eq!(window, [1, 1, 9, 9]);
    }
}

#[test]
fn out_of_bounds_writes_are_rejected() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let segment = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    assert!(matches!(
        allocator.map(&segment, &[0; 257], 0),
        Err(AllocatorError::OutOfBounds {
            offset: 0,
            len: 257,
            size: 256
        })
    ));
    assert!(matches!(
        allocator.map(&segment, &[0; 8], 250),
        Err(AllocatorError::OutOfBounds { .. })
    ));
    assert!(matches!(
        allocator.map(&segment, &[0; 8], u64::MAX),
        Err(AllocatorError::OutOfBounds { .. })
    ));
}

#[test]
fn pod_data_is_written_as_bytes() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let values = [1.0f32, 2.0, 3.0, 4.0];
    let segment = allocator.allocate(UsageIntent::Static, 16).unwrap();
    allocator.map_pod(&segment, &values, 0).unwrap();

    let mut out = [0.0f32; 4];
    allocator
        .read(&segment, bytemuck::cast_slice_mut(&mut out), 0)
        .unwrap();
    assert_eq!(out, values);
}

#[test]
fn freed_ranges_are_reused() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let a = allocator.allocate(UsageIntent::Dynamic, 2048).unwrap();
    let _b = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    let (block, range) = (a.block(), a.range());
    allocator.destroy_segment(a).unwrap();

    let c = allocator.allocate(UsageIntent::Dynamic, 1024).unwrap();
    assert_eq!(c.block(), block);
    assert!(range.start <= c.range().start && c.range().end <= range.end);
}

#[test]
fn full_blocks_grow_the_class() {
    let device = host_device();
    let config = AllocatorConfig {
        host_visible_block_size: 1024,
        ..small_config()
    };
    let mut allocator = SegmentAllocator::new(device.clone(), config);

    let segments = (0..5)
        .map(|_| allocator.allocate(UsageIntent::Dynamic, 256).unwrap())
        .collect::<Vec<_>>();

    assert_eq!(allocator.block_count(), 2);
    assert_ne!(segments[3].block(), segments[4].block());
    assert_eq!(segments[4].offset(), 0);
    assert_eq!(
        allocator.find_block_of_class(MemoryClass::HostVisible),
        Some(segments[0].block())
    );

    let stats = allocator.stats(MemoryClass::HostVisible);
    assert_eq!(stats.blocks, 2);
    assert_eq!(stats.reserved_bytes, 2048);
    assert_eq!(stats.allocated_bytes, 1280);
    assert_eq!(stats.segments, 5);
    assert_eq!(stats.largest_free_range, 768);
    assert_eq!(allocator.stats(MemoryClass::DeviceLocal), ClassStats::default());

    // Space freed in the first block is found before the second block is touched
    let first = segments.into_iter().next().unwrap();
    let first_block = first.block();
    allocator.destroy_segment(first).unwrap();
    let again = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    assert_eq!(again.block(), first_block);
    assert_eq!(allocator.block_count(), 2);
}

#[test]
fn oversized_requests_get_their_own_block() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let big = allocator.allocate(UsageIntent::Static, 100 * KIB + 1).unwrap();
    let block = allocator.block(big.block()).unwrap();
    assert_eq!(big.size(), 100 * KIB + 256);
    assert_eq!(block.size(), big.size());
    assert!(block.free().is_empty());

    assert!(matches!(
        allocator.allocate(UsageIntent::Static, 2 * MIB),
        Err(AllocatorError::RequestTooLarge {
            requested,
            max
        }) if requested == 2 * MIB && max == MIB
    ));
}

#[test]
fn sizes_that_cannot_be_aligned_are_too_large() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(
        device.clone(),
        AllocatorConfig {
            max_block_size: u64::MAX,
            ..small_config()
        },
    );

    assert!(matches!(
        allocator.allocate(UsageIntent::Dynamic, u64::MAX - 10),
        Err(AllocatorError::RequestTooLarge {
            requested,
            max
        }) if requested == u64::MAX - 10 && max == u64::MAX
    ));
    assert!(matches!(
        allocator.allocate_block(MemoryClass::HostVisible, u64::MAX),
        Err(AllocatorError::RequestTooLarge { .. })
    ));
    assert_eq!(allocator.block_count(), 0);
    assert_eq!(device.live_allocations(), 0);

    // The allocator is still usable afterwards
    let segment = allocator.allocate(UsageIntent::Dynamic, 10).unwrap();
    assert_eq!(segment.size(), 256);
    assert_eq!(allocator.validate(), Ok(()));
}

#[test]
fn unusable_default_block_sizes_do_not_break_growth() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(
        device,
        AllocatorConfig {
            host_visible_block_size: 2 * MIB,
            device_local_block_size: 0,
            ..small_config()
        },
    );

    // Defaults above the maximum are clamped to it
    let dynamic = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    assert_eq!(allocator.block(dynamic.block()).unwrap().size(), MIB);

    // Zero sized defaults fall back to the request
    let fixed = allocator.allocate(UsageIntent::Static, 10).unwrap();
    assert_eq!(allocator.block(fixed.block()).unwrap().size(), 256);

    assert!(matches!(
        allocator.allocate_block(MemoryClass::DeviceLocal, 0),
        Err(AllocatorError::EmptyBlock(MemoryClass::DeviceLocal))
    ));
    assert_eq!(allocator.block_count(), 2);
    assert_eq!(allocator.validate(), Ok(()));
}

#[test]
fn zero_sized_requests_are_empty() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let segment = allocator.allocate(UsageIntent::Dynamic, 0).unwrap();
    assert!(segment.is_empty());
    assert_eq!(allocator.block_count(), 0);

    allocator.map(&segment, &[], 0).unwrap();
    assert!(matches!(
        allocator.map(&segment, &[1], 0),
        Err(AllocatorError::OutOfBounds { .. })
    ));
    allocator.destroy_segment(segment).unwrap();
    allocator.destroy_segment(SegmentHandle::empty()).unwrap();
}

#[test]
fn foreign_handles_are_invalid() {
    let device = host_device();
    let mut first = SegmentAllocator::new(device.clone(), small_config());
    let mut second = SegmentAllocator::new(device, small_config());

    let a = first.allocate(UsageIntent::Dynamic, 256).unwrap();
    let _b = second.allocate(UsageIntent::Dynamic, 256).unwrap();

    assert!(matches!(
        second.map(&a, &[1; 4], 0),
        Err(AllocatorError::InvalidHandle)
    ));
    assert!(matches!(
        second.destroy_segment(a),
        Err(AllocatorError::InvalidHandle)
    ));
    assert_eq!(second.stats(MemoryClass::HostVisible).segments, 1);
    assert_eq!(first.stats(MemoryClass::HostVisible).segments, 1);
}

#[test]
fn blocks_in_use_cannot_be_destroyed() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    let segment = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    let id = segment.block();
    assert!(allocator.get_raw_buffer(id).is_ok());
    assert!(matches!(
        allocator.destroy_block(id),
        Err(AllocatorError::BlockInUse { segments: 1, .. })
    ));

    allocator.destroy_segment(segment).unwrap();
    allocator.destroy_block(id).unwrap();
    assert_eq!(device.live_allocations(), 0);
    assert!(matches!(
        allocator.get_raw_buffer(id),
        Err(AllocatorError::UnknownBlock(_))
    ));
    assert!(matches!(
        allocator.destroy_block(id),
        Err(AllocatorError::UnknownBlock(_))
    ));
    assert_eq!(allocator.find_block_of_class(MemoryClass::HostVisible), None);

    // Ids are never handed out twice
    let next = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    assert!(next.block() > id);
}

#[test]
fn explicit_block_sizes_are_aligned() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device, small_config());

    let id = allocator
        .allocate_block(MemoryClass::DeviceLocal, 1000)
        .unwrap();
    let block = allocator.block(id).unwrap();
    assert_eq!(block.size(), 1024);
    assert_eq!(block.free().get(&0), Some(&1024));
    assert_eq!(allocator.find_block_of_class(MemoryClass::DeviceLocal), Some(id));

    // New segments use the existing block
    let segment = allocator.allocate(UsageIntent::Static, 512).unwrap();
    assert_eq!(segment.block(), id);
}

#[test]
fn device_failures_are_reported() {
    let device = Arc::new(HostDevice::new(HostDeviceCreateInfo {
        memory_budget: Some(96 * KIB),
        device_local_supported: false,
        ..Default::default()
    }));
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    assert!(matches!(
        allocator.allocate(UsageIntent::Static, 256),
        Err(AllocatorError::NoMatchingMemoryType(MemoryClass::DeviceLocal))
    ));

    let _fits = allocator.allocate(UsageIntent::Dynamic, 64 * KIB).unwrap();
    assert!(matches!(
        allocator.allocate(UsageIntent::Dynamic, 256),
        Err(AllocatorError::DeviceOutOfMemory {
            class: MemoryClass::HostVisible,
            ..
        })
    ));
    assert_eq!(allocator.block_count(), 1);
    assert_eq!(device.live_allocations(), 1);
}

#[test]
fn persistent_mappings_are_reused() {
    let device = host_device();
    let config = AllocatorConfig {
        persistent_mapping: true,
        ..small_config()
    };
    let mut allocator = SegmentAllocator::new(device.clone(), config);

    let segment = allocator.allocate(UsageIntent::Dynamic, 64).unwrap();
    let block = allocator.block(segment.block()).unwrap();
    assert!(matches!(block.mapping(), Mapping::Persistent(_)));
    assert!(device.is_mapped(block.memory()));

    let data = pattern(64, 11);
    allocator.map(&segment, &data, 0).unwrap();
    {
        let view = allocator.view(&segment).unwrap();
        assert_eq!(&view[..64], data.as_slice());
    }

    let block = allocator.block(segment.block()).unwrap();
    assert!(device.is_mapped(block.memory()));

    // Device local blocks are never mapped
    let stat = allocator.allocate(UsageIntent::Static, 64).unwrap();
    let block = allocator.block(stat.block()).unwrap();
    assert_eq!(block.mapping(), Mapping::Unmapped);

    drop(allocator);
    assert_eq!(device.live_allocations(), 0);
}

#[test]
fn views_unmap_when_dropped() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    let segment = allocator.allocate(UsageIntent::Dynamic, 128).unwrap();
    {
        let mut view = allocator.view(&segment).unwrap();
        assert_eq!(view.len(), 256);
        view[..4].copy_from_slice(&[4, 3, 2, 1]);
    }

    let block = allocator.block(segment.block()).unwrap();
    assert!(!device.is_mapped(block.memory()));
    assert_eq!(
        device.read_raw(block.memory(), segment.offset(), 4),
        Some(vec![4, 3, 2, 1])
    );

    let stat = allocator.allocate(UsageIntent::Static, 128).unwrap();
    assert!(matches!(
        allocator.view(&stat),
        Err(AllocatorError::NotMappable(MemoryClass::DeviceLocal))
    ));
}

#[test]
fn dropping_the_allocator_frees_every_block() {
    let device = host_device();
    let mut allocator = SegmentAllocator::new(device.clone(), small_config());

    let _a = allocator.allocate(UsageIntent::Dynamic, 256).unwrap();
    let _b = allocator.allocate(UsageIntent::Static, 256).unwrap();
    assert_eq!(device.live_allocations(), 2);

    drop(allocator);
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(device.bytes_in_use(), 0);
}

#[test]
fn random_churn_keeps_blocks_partitioned() {
    let device = host_device();
    let config = AllocatorConfig {
        host_visible_block_size: 16 * KIB,
        device_local_block_size: 16 * KIB,
        ..small_config()
    };
    let mut allocator = SegmentAllocator::new(device, config);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<(SegmentHandle, Vec<u8>)> = Vec::default();

    for step in 0..1500 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let intent = if rng.gen_bool(0.5) {
                UsageIntent::Dynamic
            } else {
                UsageIntent::Static
            };
            let size = rng.gen_range(1..=6000);
            let segment = allocator.allocate(intent, size).unwrap();
            let data = pattern(size as usize, step as u8);
            allocator.map(&segment, &data, 0).unwrap();
            live.push((segment, data));
        } else {
            let (segment, data) = live.swap_remove(rng.gen_range(0..live.len()));
            let mut out = vec![0; data.len()];
            allocator.read(&segment, &mut out, 0).unwrap();
            assert_eq!(out, data);
            allocator.destroy_segment(segment).unwrap();
        }

        assert_eq!(allocator.validate(), Ok(()));
    }

    // Live segments in the same block never overlap
    let mut ranges = live
        .iter()
        .map(|(segment, _)| (segment.block(), segment.offset(), segment.size()))
        .collect::<Vec<_>>();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (block_a, offset_a, size_a) = pair[0];
        let (block_b, offset_b, _) = pair[1];
        if block_a == block_b {
            assert!(offset_a + size_a <= offset_b);
        }
    }

    let allocated: u64 = [MemoryClass::HostVisible, MemoryClass::DeviceLocal]
        .into_iter()
        .map(|class| allocator.stats(class).allocated_bytes)
        .sum();
    assert_eq!(
        allocated,
        live.iter().map(|(segment, _)| segment.size()).sum::<u64>()
    );
}

/// A `Send + Sync` device that refuses every allocation.
struct SharedDevice {
    properties: DeviceProperties,
}

impl Device for SharedDevice {
    type Buffer = u64;
    type Memory = u64;

    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    unsafe fn create_raw_allocation(
        &self,
        _size: u64,
        class: MemoryClass,
    ) -> Result<RawAllocation<Self>, DeviceError> {
        Err(DeviceError::NoMatchingMemoryType(class))
    }

    unsafe fn destroy_raw_allocation(&self, _allocation: RawAllocation<Self>) {}

    unsafe fn map_memory(
        &self,
        _memory: &Self::Memory,
        _offset: u64,
        _size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        Err(DeviceError::NotMappable)
    }

    unsafe fn unmap_memory(&self, _memory: &Self::Memory) {}

    unsafe fn submit_copy(
        &self,
        _src: &Self::Buffer,
        _dst: &Self::Buffer,
        _region: CopyRegion,
    ) -> Result<(), DeviceError> {
        Ok(())
    }
}

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn allocator_can_be_shared_behind_a_lock() {
    assert_send_sync::<SegmentAllocator<SharedDevice>>();
    assert_send_sync::<Mutex<SegmentAllocator<SharedDevice>>>();

    let allocator = Arc::new(Mutex::new(SegmentAllocator::new(
        Arc::new(SharedDevice {
            properties: DeviceProperties { min_alignment: 256 },
        }),
        small_config(),
    )));

    let worker = {
        let allocator = allocator.clone();
        std::thread::spawn(move || {
            allocator
                .lock()
                .unwrap()
                .allocate(UsageIntent::Dynamic, 16)
                .is_err()
        })
    };
    assert!(worker.join().unwrap());
    assert_eq!(allocator.lock().unwrap().block_count(), 0);
}
