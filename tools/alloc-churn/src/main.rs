use std::{path::PathBuf, sync::Arc};

use ard_render_alloc::{
    alloc::{
        allocator::SegmentAllocator,
        config::AllocatorConfig,
        device::Device,
        host::{HostDevice, HostDeviceCreateInfo},
        segment::SegmentHandle,
        types::{MemoryClass, UsageIntent},
    },
    log::{self, LevelFilter, LogSettings},
};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

/// Allocates, writes, reads back and frees random segments, checking the allocator stays
/// consistent the whole time.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// RON file with logging and allocator settings.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of allocate or free operations to perform.
    #[arg(short, long, default_value_t = 10_000)]
    iterations: usize,
    /// Seed for the random number generator.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,
    /// Largest segment to request in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    max_segment: u64,
    /// Overrides the log level from the config file.
    #[arg(long)]
    log_level: Option<LevelFilter>,
    /// Run against the first Vulkan device instead of host memory.
    #[cfg(feature = "vulkan")]
    #[arg(long, default_value_t = false)]
    vulkan: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChurnConfig {
    log: LogSettings,
    allocator: AllocatorConfig,
}

struct Live {
    handle: SegmentHandle,
    fill: u8,
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let src = std::fs::read_to_string(path).unwrap();
            ron::from_str::<ChurnConfig>(&src).unwrap()
        }
        None => ChurnConfig::default(),
    };

    config.allocator.validate().unwrap();

    if let Some(level) = args.log_level {
        config.log.filter = level;
    }
    log::init_with(&config.log).unwrap();

    #[cfg(feature = "vulkan")]
    if args.vulkan {
        use ard_render_alloc::backend::{VulkanDevice, VulkanDeviceCreateInfo};

        let device = VulkanDevice::new(VulkanDeviceCreateInfo {
            app_name: String::from("alloc-churn"),
            debug: cfg!(debug_assertions),
        })
        .unwrap();

        churn(
            SegmentAllocator::new(Arc::new(device), config.allocator),
            &args,
        );
        return;
    }

    let device = HostDevice::new(HostDeviceCreateInfo::default());
    churn(
        SegmentAllocator::new(Arc::new(device), config.allocator),
        &args,
    );
}

fn churn<D: Device>(mut allocator: SegmentAllocator<D>, args: &Args) {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut live: Vec<Live> = Vec::default();
    let mut scratch = Vec::default();

    log::info!(
        "Running {} iterations with seed `{}`.",
        args.iterations,
        args.seed
    );

    for i in 0..args.iterations {
        let free = !live.is_empty() && rng.gen_bool(0.45);

        if free {
            let idx = rng.gen_range(0..live.len());
            let entry = live.swap_remove(idx);

            // Make sure nothing else wrote over this segment while it was alive
            let len = entry.handle.size() as usize;
            scratch.resize(len, 0);
            allocator.read(&entry.handle, &mut scratch, 0).unwrap();
            if let Some(pos) = scratch.iter().position(|b| *b != entry.fill) {
                log::error!(
                    "Segment {:?} was corrupted at byte `{pos}`.",
                    entry.handle.range()
                );
                std::process::exit(1);
            }

            allocator.destroy_segment(entry.handle).unwrap();
        } else {
            let intent = if rng.gen_bool(0.5) {
                UsageIntent::Dynamic
            } else {
                UsageIntent::Static
            };
            let size = rng.gen_range(1..=args.max_segment);
            let handle = allocator.allocate(intent, size).unwrap();

            let fill = (i % 255) as u8 + 1;
            scratch.clear();
            scratch.resize(handle.size() as usize, fill);
            allocator.map(&handle, &scratch, 0).unwrap();

            live.push(Live { handle, fill });
        }

        if let Err((block, err)) = allocator.validate() {
            log::error!("Block {block:?} is no longer partitioned: {err}");
            std::process::exit(1);
        }
    }

    for class in [MemoryClass::HostVisible, MemoryClass::DeviceLocal] {
        let stats = allocator.stats(class);
        log::info!(
            "{class:?}: {} blocks, {} segments, {}/{} bytes in use, {} free ranges \
            (largest is {} bytes).",
            stats.blocks,
            stats.segments,
            stats.allocated_bytes,
            stats.reserved_bytes,
            stats.free_ranges,
            stats.largest_free_range,
        );
    }

    for entry in live.drain(..) {
        allocator.destroy_segment(entry.handle).unwrap();
    }
    log::info!("Churn finished with {} blocks.", allocator.block_count());
}
