//! Delayed (epoch-scoped) free tests.

use std::time::{Duration, Instant};

use nvheap::size::MIB;
use nvheap::{EpochOp, EpochZoneHeap, NvheapConfig};
use tempfile::TempDir;

fn manual_config(dir: &TempDir) -> NvheapConfig {
    // ticks driven by hand for determinism
    NvheapConfig {
        root_dir: dir.path().to_path_buf(),
        log: None,
        epoch_advance_interval: Duration::from_secs(3600),
    }
}

#[test]
fn deferred_free_is_invisible_inside_the_scope() {
    let dir = TempDir::new().unwrap();
    let config = manual_config(&dir);
    EpochZoneHeap::create(1, 128 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();
    let em = heap.epoch_manager().unwrap();

    let ptr1;
    {
        let op = EpochOp::new(&em).unwrap();
        ptr1 = heap.alloc_in(&op, size_of::<u32>() as u64);
        assert!(ptr1.is_valid());
        heap.free_deferred(&op, ptr1).unwrap();

        // the retired block must not come back inside the same scope
        let ptr2 = heap.alloc_in(&op, size_of::<u32>() as u64);
        assert_ne!(ptr1, ptr2);
    }

    // scope exited, but no advancer pass has happened yet
    let ptr2 = heap.alloc(size_of::<u32>() as u64);
    assert_ne!(ptr1, ptr2);
    heap.free(ptr2).unwrap();

    // a few quiescent passes reclaim the retirement
    em.tick();
    em.tick();
    em.tick();

    let op = EpochOp::new(&em).unwrap();
    let ptr3 = heap.alloc_in(&op, size_of::<u32>() as u64);
    assert_eq!(ptr3, ptr1);
}

#[test]
fn lagging_scope_holds_back_reclamation() {
    let dir = TempDir::new().unwrap();
    let config = manual_config(&dir);
    EpochZoneHeap::create(1, 128 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();
    let em = heap.epoch_manager().unwrap();

    // `reader` stays inside its scope the whole time
    let reader = EpochOp::new(&em).unwrap();

    let ptr1;
    {
        let op = EpochOp::new(&em).unwrap();
        ptr1 = heap.alloc_in(&op, 64);
        heap.free_deferred(&op, ptr1).unwrap();
    }

    // however many passes run, the reader's reported epoch pins the bag
    for _ in 0..5 {
        em.tick();
    }
    let probe = heap.alloc(64);
    assert_ne!(probe, ptr1);
    heap.free(probe).unwrap();

    // once the reader exits, reclamation proceeds
    drop(reader);
    em.tick();
    em.tick();
    assert_eq!(heap.alloc(64), ptr1);
}

#[test]
fn deferred_free_across_resize() {
    let dir = TempDir::new().unwrap();
    let config = manual_config(&dir);
    EpochZoneHeap::create(1, 16 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();
    let em = heap.epoch_manager().unwrap();

    let alloc_size = 8 * MIB;
    let (ptr1, ptr3);
    {
        let op = EpochOp::new(&em).unwrap();
        ptr1 = heap.alloc_in(&op, alloc_size);
        assert!(ptr1.is_valid());
        heap.free_deferred(&op, ptr1).unwrap();
        // the only half-shelf block is retired, not free
        assert!(heap.alloc_in(&op, alloc_size).is_null());

        heap.resize(32 * MIB).unwrap();

        ptr3 = heap.alloc_in(&op, alloc_size);
        assert!(ptr3.is_valid());
        assert_eq!(ptr3.shelf_index(), 2);
        heap.free_deferred(&op, ptr3).unwrap();
        assert!(heap.alloc_in(&op, alloc_size).is_null());
    }

    em.tick();
    em.tick();

    // both retirements are reclaimable again; newest shelf is tried first
    let a = heap.alloc(alloc_size);
    let b = heap.alloc(alloc_size);
    assert_eq!(a, ptr3);
    assert_eq!(b, ptr1);
    assert!(heap.alloc(alloc_size).is_null());
}

#[test]
fn background_advancer_reclaims_without_manual_ticks() {
    let dir = TempDir::new().unwrap();
    let config = NvheapConfig {
        root_dir: dir.path().to_path_buf(),
        log: None,
        epoch_advance_interval: Duration::from_millis(15),
    };
    EpochZoneHeap::create(1, 16 * MIB, &config).unwrap();

    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();
    let em = heap.epoch_manager().unwrap();

    let ptr1;
    {
        let op = EpochOp::new(&em).unwrap();
        ptr1 = heap.alloc_in(&op, 64);
        heap.free_deferred(&op, ptr1).unwrap();
    }

    // the worker advances the epoch and drains the bag on its own
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let probe = heap.alloc(64);
        if probe == ptr1 {
            break;
        }
        heap.free(probe).unwrap();
        assert!(
            Instant::now() < deadline,
            "background advancer never reclaimed the block"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    em.shutdown();
}
