use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use weft_data::{GlobalMemory, MemoryChunkSystem, ThreadMemory};

fn bench_arenas(c: &mut Criterion) {
    let system = Arc::new(MemoryChunkSystem::new(
        &"16:256 1024:16".parse().expect("valid chunk config"),
    ));

    let mut group = c.benchmark_group("Arenas");

    group.bench_function("Chunk claim/release", |b| {
        b.iter(|| {
            let chunk = system.alloc(black_box(4096));
            system.free(chunk);
        });
    });

    let mut memory = ThreadMemory::new(Arc::clone(&system), "bench");
    group.bench_function("ThreadMemory alloc/free", |b| {
        b.iter(|| {
            let ptr = memory.alloc(black_box(256), 16);
            unsafe { memory.free(ptr) };
        });
    });

    group.bench_function("ThreadMemory bulk free (64 allocs)", |b| {
        b.iter(|| {
            for _ in 0..64 {
                black_box(memory.alloc(128, 8));
            }
            memory.free_all_chunks();
        });
    });

    let shared = GlobalMemory::new(Arc::clone(&system));
    group.bench_function("GlobalMemory alloc/clone/drop", |b| {
        b.iter(|| {
            let allocation = shared.alloc(black_box(256), 16);
            let owner = allocation.clone();
            drop(allocation);
            black_box(owner);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_arenas);
criterion_main!(benches);
