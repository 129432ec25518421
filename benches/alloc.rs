//! Microbenchmarks for the heap's hot paths: small alloc/free cycles,
//! size-class mixes, and the deferred-merge sweep.

use std::time::Duration;

use criterion::{
    BenchmarkId, Criterion, SamplingMode, Throughput, black_box, criterion_group, criterion_main,
};

use nvheap::size::MIB;
use nvheap::{EpochZoneHeap, NvheapConfig};
use tempfile::TempDir;

fn bench_heap(dir: &TempDir) -> EpochZoneHeap {
    let config = NvheapConfig {
        root_dir: dir.path().to_path_buf(),
        log: None,
        epoch_advance_interval: Duration::from_secs(3600),
    };
    EpochZoneHeap::create(1, 256 * MIB, &config).unwrap();
    let mut heap = EpochZoneHeap::new(1, config);
    heap.open().unwrap();
    heap
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let heap = bench_heap(&dir);

    let mut group = c.benchmark_group("heap/alloc_free");
    group.sampling_mode(SamplingMode::Flat);
    group.throughput(Throughput::Elements(1));

    for size in [64u64, 4096, 64 * 1024, MIB] {
        group.bench_function(BenchmarkId::new("size", size), |b| {
            b.iter(|| {
                let ptr = heap.alloc(black_box(size));
                assert!(ptr.is_valid());
                heap.free(ptr).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_merge_sweep(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let heap = bench_heap(&dir);

    // park freed pairs in the deferred levels, then time the sweep
    c.bench_function("heap/merge_after_churn", |b| {
        b.iter(|| {
            let blocks: Vec<_> = (0..7).map(|_| heap.alloc(32 * MIB)).collect();
            for ptr in blocks {
                if ptr.is_valid() {
                    heap.free(ptr).unwrap();
                }
            }
            heap.merge().unwrap();
        })
    });
}

criterion_group!(benches, bench_alloc_free_cycle, bench_merge_sweep);
criterion_main!(benches);
