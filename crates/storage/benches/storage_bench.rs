//! Benchmarks for fragment access and sampling eviction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dmap_storage::entry::Entry;
use dmap_storage::eviction::{select_victim, sweep_fragment, Candidate, EvictionPolicy, EvictionSettings};
use dmap_storage::fragment::Fragment;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn make_entry(key: String, value_size: usize, now: u64) -> Entry {
    Entry::new(key, vec![0x42u8; value_size], 1, now)
}

fn bench_fragment_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragment_put");

    for size in [64, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut fragment = Fragment::new();
            let mut i = 0u64;
            b.iter(|| {
                fragment.put(make_entry(format!("key_{}", i), size, i));
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_fragment_get(c: &mut Criterion) {
    let mut fragment = Fragment::new();
    for i in 0..1000 {
        fragment.put(make_entry(format!("key_{:04}", i), 256, 0));
    }

    c.bench_function("fragment_get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key_{:04}", i % 1000);
            black_box(fragment.get(&key, i, 0));
            i += 1;
        });
    });
}

fn bench_select_victim(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_victim");
    for samples in [5, 16, 64] {
        let candidates: Vec<Candidate> = (0..samples)
            .map(|i| Candidate {
                key: format!("key_{}", i),
                last_access_ms: (i as u64 * 7919) % 1000,
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(samples), &candidates, |b, c| {
            b.iter(|| black_box(select_victim(c)));
        });
    }
    group.finish();
}

fn bench_lru_sweep(c: &mut Criterion) {
    let settings = EvictionSettings {
        policy: EvictionPolicy::Lru,
        max_keys: 9_000,
        ..Default::default()
    };

    c.bench_function("lru_sweep_10k_to_9k", |b| {
        let mut rng = StdRng::seed_from_u64(42);
        b.iter_batched(
            || {
                let mut fragment = Fragment::new();
                for i in 0..10_000 {
                    fragment.put(make_entry(format!("key_{}", i), 32, i));
                }
                fragment
            },
            |mut fragment| black_box(sweep_fragment(&mut fragment, &settings, 0, &mut rng)),
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_fragment_put,
    bench_fragment_get,
    bench_select_victim,
    bench_lru_sweep
);
criterion_main!(benches);
