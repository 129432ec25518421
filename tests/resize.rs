//! Resize tests: linear fill and growth, power-of-two rounding, the
//! shelf-index ceiling, and cross-handle visibility.

use std::time::Duration;

use nvheap::size::{KIB, MIB};
use nvheap::{EpochZoneHeap, ErrorCode, NvheapConfig};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> NvheapConfig {
    NvheapConfig {
        root_dir: dir.path().to_path_buf(),
        log: None,
        epoch_advance_interval: Duration::from_secs(3600),
    }
}

#[test]
fn linear_fill_then_resize_moves_to_next_shelf() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    EpochZoneHeap::create(1, 128 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();

    let mut held = Vec::new();
    loop {
        let ptr = heap.alloc(1 * MIB);
        if ptr.is_null() {
            break;
        }
        assert_eq!(ptr.shelf_index(), 1);
        held.push(ptr);
    }
    // everything but the metadata-bearing first megabyte fits
    assert_eq!(held.len(), 127);

    heap.resize(256 * MIB).unwrap();
    assert_eq!(heap.size(), 256 * MIB);

    let ptr = heap.alloc(1 * MIB);
    assert!(ptr.is_valid());
    assert_eq!(ptr.shelf_index(), 2);
    held.push(ptr);

    for ptr in held {
        heap.free(ptr).unwrap();
    }
}

#[test]
fn smaller_resize_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    EpochZoneHeap::create(1, 128 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();

    heap.resize(64 * MIB).unwrap();
    assert_eq!(heap.size(), 128 * MIB);
    heap.resize(128 * MIB).unwrap();
    assert_eq!(heap.size(), 128 * MIB);
}

#[test]
fn resize_rounds_new_shelves_to_powers_of_two() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    EpochZoneHeap::create(1, 128 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();

    heap.resize(2 * 128 * MIB - 10).unwrap();
    assert_eq!(heap.size(), 256 * MIB);
}

#[test]
fn resize_ceiling_is_graceful() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let mut heap_size = 128 * KIB;
    EpochZoneHeap::create(1, heap_size, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();

    let alloc_size = 64 * KIB;
    let mut held = Vec::new();
    for i in 0..126u16 {
        // each shelf holds exactly one half-shelf block above its metadata
        let ptr = heap.alloc(alloc_size);
        assert!(ptr.is_valid(), "round {i}");
        assert_eq!(ptr.shelf_index(), i + 1);
        assert!(heap.alloc(alloc_size).is_null());
        held.push(ptr);

        heap_size += 128 * KIB;
        heap.resize(heap_size).unwrap();
        assert_eq!(heap.size(), heap_size);
    }

    // shelf 127 is the last addressable one
    let ptr = heap.alloc(alloc_size);
    assert_eq!(ptr.shelf_index(), 127);
    held.push(ptr);

    assert_eq!(
        heap.resize(heap_size + 128 * KIB),
        Err(ErrorCode::HeapResizeFailed)
    );

    for ptr in held {
        heap.free(ptr).unwrap();
    }
}

#[test]
fn resize_on_one_handle_is_visible_on_another() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    EpochZoneHeap::create(1, 1 * MIB, &config).unwrap();

    let mut writer = EpochZoneHeap::new(1, config.clone());
    let mut grower = EpochZoneHeap::new(1, config);
    writer.open().unwrap();
    grower.open().unwrap();

    // fill shelf 1 through `writer`
    let mut held = Vec::new();
    loop {
        let ptr = writer.alloc(512 * KIB);
        if ptr.is_null() {
            break;
        }
        held.push(ptr);
    }
    assert!(writer.alloc(512 * KIB).is_null());

    // grow through the other handle
    grower.resize(2 * MIB).unwrap();
    assert_eq!(writer.size(), grower.size());

    // the writer's next alloc lands on the shelf the grower added
    let ptr = writer.alloc(512 * KIB);
    assert!(ptr.is_valid());
    assert_eq!(ptr.shelf_index(), 2);
    held.push(ptr);

    // blocks allocated through one handle free cleanly through the other
    for ptr in held {
        grower.free(ptr).unwrap();
    }
}
