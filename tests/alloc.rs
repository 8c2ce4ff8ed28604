use std::sync::Arc;

use clap::Parser;
use rmem::config::Config;
use rmem::framework::alloc::{slab_class, BumpAllocator, HEADER_SIZE};

fn test_config() -> Arc<Config> {
    Arc::new(
        Config::try_parse_from([
            "rmem",
            "--node-id",
            "1",
            "--first-mn-id",
            "0",
            "--last-mn-id",
            "0",
            "--first-cn-id",
            "1",
            "--last-cn-id",
            "1",
            "--mn-port",
            "7471",
            "--cn-threads",
            "1",
        ])
        .unwrap(),
    )
}

#[test]
fn compute_size_includes_header_and_rounds_up() {
    let alloc = BumpAllocator::new(&test_config());
    // 128 bytes of payload + 16 of header → the 192 class.
    assert_eq!(alloc.compute_size::<u64>(16), 192);
    // One byte still pays for a full small class.
    assert_eq!(alloc.compute_size::<u8>(1), 64);
    // 1024 elements of u64 spill past the medium threshold.
    assert_eq!(alloc.compute_size::<u64>(1024), slab_class(8192 + HEADER_SIZE));
}

#[test]
fn freelist_miss_then_hit() {
    let mut alloc = BumpAllocator::new(&test_config());
    let size = alloc.compute_size::<u64>(16);
    assert_eq!(alloc.try_allocate_local(size), None);

    // Reclaim a block "allocated" at 0x1000 (body at 0x1010), then ask for
    // the same class again: it must come back without any remote traffic.
    alloc.reclaim(0x1000 + HEADER_SIZE, size);
    assert_eq!(alloc.try_allocate_local(size), Some(0x1000 + HEADER_SIZE));
    assert_eq!(alloc.try_allocate_local(size), None);
}

#[test]
fn freelists_are_class_segregated() {
    let mut alloc = BumpAllocator::new(&test_config());
    alloc.reclaim(0x1000 + HEADER_SIZE, 64);
    // A 128-class request must not be satisfied by the 64-class block.
    assert_eq!(alloc.try_allocate_local(128), None);
    assert_eq!(alloc.try_allocate_local(64), Some(0x1000 + HEADER_SIZE));
}

#[test]
fn repeated_reclaim_cycle_is_fully_local() {
    let mut alloc = BumpAllocator::new(&test_config());
    let size = alloc.compute_size::<u8>(128 - HEADER_SIZE as usize);
    // 100 blocks freed, 100 blocks reallocated: every request hits.
    for i in 0..100u64 {
        alloc.reclaim(0x10_000 + i * size + HEADER_SIZE, size);
    }
    for _ in 0..100 {
        assert!(alloc.try_allocate_local(size).is_some());
    }
    assert_eq!(alloc.try_allocate_local(size), None);
}

#[test]
fn big_blocks_use_best_fit() {
    let mut alloc = BumpAllocator::new(&test_config());
    let huge = slab_class(65536);
    let big = slab_class(16384);
    alloc.reclaim(0x10_000 + HEADER_SIZE, huge);
    alloc.reclaim(0x40_000 + HEADER_SIZE, big);

    // Both fit, but the tighter block must win.
    assert_eq!(alloc.try_allocate_local(16384), Some(0x40_000 + HEADER_SIZE));
    assert_eq!(alloc.try_allocate_local(16384), Some(0x10_000 + HEADER_SIZE));
    assert_eq!(alloc.try_allocate_local(16384), None);
}

#[test]
fn big_block_too_small_is_not_reused() {
    let mut alloc = BumpAllocator::new(&test_config());
    alloc.reclaim(0x10_000 + HEADER_SIZE, slab_class(16384));
    assert_eq!(alloc.try_allocate_local(slab_class(65536)), None);
}
