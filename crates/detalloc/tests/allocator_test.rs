use std::{collections::HashSet, ops::Range, ptr::NonNull};

use detalloc::{
    AllocatorFlags, Config, DetAllocator, DetError, ErrorKind, PoolConfig, UseCase, required_size,
};

fn buffer_for(config: &Config) -> Vec<u8> {
    vec![0_u8; required_size(config).unwrap()]
}

fn buffer_range(buffer: &[u8]) -> Range<usize> {
    let start = buffer.as_ptr().addr();
    start..start + buffer.len()
}

#[test]
fn concrete_scenario() {
    let config = Config::from_pools(&[PoolConfig::new(64, 4)])
        .unwrap()
        .with_align(8);
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    let blocks: Vec<_> = (0..4).map(|_| allocator.alloc(64).unwrap()).collect();
    let err = allocator.alloc(64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolFull);

    allocator.free(blocks[1].as_ptr()).unwrap();
    assert_eq!(allocator.alloc(64).unwrap(), blocks[1]);
}

#[test]
fn single_pool_hands_out_distinct_aligned_blocks() {
    for (block_size, num_blocks, align) in [(64, 4, 8), (24, 10, 8), (3, 7, 4), (100, 5, 16)] {
        let config = Config::from_pools(&[PoolConfig::new(block_size, num_blocks)])
            .unwrap()
            .with_align(align);
        let mut buffer = buffer_for(&config);
        let range = buffer_range(&buffer);
        let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

        let blocks: Vec<_> = (0..num_blocks)
            .map(|_| allocator.alloc(block_size).unwrap())
            .collect();
        let distinct: HashSet<_> = blocks.iter().collect();
        assert_eq!(distinct.len(), num_blocks);
        for block in &blocks {
            let addr = block.addr().get();
            assert_eq!(addr % align, 0, "block {addr:#x} not aligned to {align}");
            assert!(range.contains(&addr) && addr + block_size <= range.end);
        }
        assert_eq!(
            allocator.alloc(block_size).unwrap_err().kind(),
            ErrorKind::PoolFull
        );
    }
}

#[test]
fn lifo_reuse() {
    let config = Config::from_pools(&[PoolConfig::new(32, 8)]).unwrap();
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    let blocks: Vec<_> = (0..6).map(|_| allocator.alloc(32).unwrap()).collect();
    allocator.free(blocks[2].as_ptr()).unwrap();
    allocator.free(blocks[4].as_ptr()).unwrap();
    assert_eq!(allocator.alloc(32).unwrap(), blocks[4]);
    assert_eq!(allocator.alloc(32).unwrap(), blocks[2]);
}

#[test]
fn calloc_zeroes_every_size() {
    let config = Config::from_pools(&[PoolConfig::new(48, 1)]).unwrap();
    let mut buffer = buffer_for(&config);
    buffer.fill(0xCD);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    for size in 0..=48 {
        let ptr = allocator.calloc(size).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0), "size {size}");
        unsafe { ptr.write_bytes(0xCD, 48) };
        allocator.free(ptr.as_ptr()).unwrap();
    }
}

#[test]
fn usable_size_reports_block_size() {
    let config = Config::from_pools(&[
        PoolConfig::new(16, 2),
        PoolConfig::new(64, 2),
        PoolConfig::new(256, 2),
    ])
    .unwrap();
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    for (size, expected) in [(1, 16), (16, 16), (17, 64), (200, 256)] {
        let ptr = allocator.alloc(size).unwrap();
        assert_eq!(allocator.usable_size(ptr.as_ptr()), expected);
    }

    let local = 0_u32;
    assert_eq!(allocator.usable_size((&raw const local).cast()), 0);
    assert_eq!(allocator.usable_size(std::ptr::null()), 0);
}

#[test]
fn free_null_is_noop() {
    let config = Config::from_pools(&[PoolConfig::new(16, 1)])
        .unwrap()
        .with_flags(AllocatorFlags::STATS);
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    allocator.free(std::ptr::null_mut()).unwrap();
    assert_eq!(allocator.get_stats().unwrap().total_frees, 0);
}

#[test]
fn validate_after_balanced_operations() {
    let config = Config::for_use_case(UseCase::Embedded).with_flags(AllocatorFlags::VALIDATION);
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();
    assert!(allocator.validate());

    let mut live = Vec::new();
    for round in 0..50_usize {
        let size = [1, 16, 20, 32, 64, 100, 128][round % 7];
        if let Ok(ptr) = allocator.alloc(size) {
            live.push(ptr);
        }
        if round % 3 == 2 && !live.is_empty() {
            let ptr = live.remove(round % live.len());
            allocator.free(ptr.as_ptr()).unwrap();
        }
    }
    for ptr in live {
        allocator.free(ptr.as_ptr()).unwrap();
    }
    assert!(allocator.validate());
}

#[test]
fn validate_detects_corrupted_link() {
    let config = Config::from_pools(&[PoolConfig::new(64, 4)]).unwrap();
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    let ptr = allocator.alloc(64).unwrap();
    allocator.free(ptr.as_ptr()).unwrap();
    unsafe { ptr.cast::<u32>().write_unaligned(77) };
    assert!(!allocator.validate());
}

#[test]
fn validate_detects_double_free() {
    let config = Config::from_pools(&[PoolConfig::new(64, 4)])
        .unwrap()
        .with_flags(AllocatorFlags::VALIDATION);
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    let ptr = allocator.alloc(64).unwrap();
    allocator.free(ptr.as_ptr()).unwrap();
    let err = allocator.free(ptr.as_ptr()).unwrap_err();
    assert!(matches!(err, DetError::DoubleFree { .. }));
    assert!(!allocator.validate());
}

#[test]
fn peak_usage_is_monotonic() {
    let config = Config::from_pools(&[PoolConfig::new(32, 4), PoolConfig::new(128, 4)])
        .unwrap()
        .with_flags(AllocatorFlags::STATS);
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    let mut live: Vec<NonNull<u8>> = Vec::new();
    let mut last_peak = 0;
    for step in 0..40_usize {
        if step % 5 < 3 {
            if let Ok(ptr) = allocator.alloc(if step % 2 == 0 { 20 } else { 120 }) {
                live.push(ptr);
            }
        } else if let Some(ptr) = live.pop() {
            allocator.free(ptr.as_ptr()).unwrap();
        }
        let stats = allocator.get_stats().unwrap();
        assert!(stats.peak_usage >= last_peak);
        assert_eq!(stats.current_usage, live.len() as u64);
        last_peak = stats.peak_usage;
    }

    allocator.reset_stats().unwrap();
    let stats = allocator.get_stats().unwrap();
    assert_eq!(stats.peak_usage, last_peak);
    assert_eq!(stats.current_usage, live.len() as u64);
    assert_eq!(stats.total_allocs, 0);
    assert_eq!(stats.failed_allocs, 0);
}

#[test]
fn required_size_round_trip() {
    let mut configs: Vec<Config> = UseCase::ALL.into_iter().map(Config::for_use_case).collect();
    configs.push(Config::from_pools(&[PoolConfig::new(64, 4)]).unwrap());
    configs.push(
        Config::from_pools(&[PoolConfig::new(7, 13), PoolConfig::new(200, 3).cache_aligned()])
            .unwrap()
            .with_flags(AllocatorFlags::VALIDATION),
    );

    for config in &configs {
        let required = required_size(config).unwrap();
        let mut buffer = vec![0_u8; required];
        DetAllocator::init(&mut buffer, config).unwrap();

        let mut buffer = vec![0_u8; required - 1];
        let err = DetAllocator::init(&mut buffer, config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }
}

#[test]
fn any_buffer_offset_is_accepted() {
    let config = Config::from_pools(&[PoolConfig::new(100, 3).cache_aligned()]).unwrap();
    let required = required_size(&config).unwrap();
    let mut backing = vec![0_u8; required + 64];
    for offset in 0..64 {
        let buffer = &mut backing[offset..offset + required];
        let allocator = DetAllocator::init(buffer, &config).unwrap();
        let ptr = allocator.alloc(100).unwrap();
        assert_eq!(ptr.addr().get() % 64, 0);
    }
}

#[test]
fn invalid_configs_fail_init() {
    let mut buffer = vec![0_u8; 4096];

    let err = DetAllocator::init(&mut buffer, &Config::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let config = Config::from_pools(&[PoolConfig::new(64, 4)])
        .unwrap()
        .with_align(3);
    let err = DetAllocator::init(&mut buffer, &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let err = DetAllocator::init(&mut [], &Config::from_pools(&[PoolConfig::new(8, 1)]).unwrap())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn suggested_config_serves_its_sizes() {
    let sizes = [12, 40, 40, 300, 12, 1500];
    let config = detalloc::suggest_config(&sizes)
        .unwrap()
        .with_flags(AllocatorFlags::STATS);
    let mut buffer = buffer_for(&config);
    let allocator = DetAllocator::init(&mut buffer, &config).unwrap();

    for size in sizes {
        let ptr = allocator.alloc(size).unwrap();
        assert_eq!(allocator.usable_size(ptr.as_ptr()), size);
    }
    assert_eq!(allocator.get_stats().unwrap().pools.len(), 4);
}
