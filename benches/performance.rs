use criterion::{criterion_group, criterion_main, Criterion};
use diram_exec::LookaheadCache;
use diram_mem::{EnhancedAllocator, MemorySpace, ProtectionFlags, TracedAllocator};

fn bench_traced(c: &mut Criterion) {
    let traced = TracedAllocator::new(u32::MAX);
    let mut ctx = traced.new_context();
    c.bench_function("traced_alloc_free_256", |b| {
        b.iter(|| {
            let alloc = traced.allocate(&mut ctx, 256, "bench").unwrap();
            let _ = traced.free(alloc);
        })
    });
}

fn bench_enhanced(c: &mut Criterion) {
    let enhanced = EnhancedAllocator::new(TracedAllocator::new(u32::MAX), ProtectionFlags::default());
    let space = MemorySpace::create("bench", 1 << 20);
    let mut ctx = enhanced.new_context();
    c.bench_function("enhanced_alloc_free_256", |b| {
        b.iter(|| {
            let alloc = enhanced
                .allocate_enhanced(&mut ctx, 256, "bench", Some(&space))
                .unwrap();
            let _ = enhanced.free_enhanced(alloc);
        })
    });
}

fn bench_lookahead(c: &mut Criterion) {
    let cache = LookaheadCache::new(1024);
    for hint in 0..1024u32 {
        cache.record(hint, 4096, 0.8);
    }
    c.bench_function("lookahead_lookup", |b| {
        let mut hint = 0u32;
        b.iter(|| {
            hint = hint.wrapping_add(7);
            cache.lookup(hint)
        })
    });
    c.bench_function("lookahead_learn", |b| {
        b.iter(|| cache.learn(11, 512, 0.6))
    });
}

criterion_group!(benches, bench_traced, bench_enhanced, bench_lookahead);
criterion_main!(benches);
