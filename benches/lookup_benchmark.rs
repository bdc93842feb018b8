//! Offset lookups and the link path, measured with criterion.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use asmlink::cache::{self, MachineId, MemoryCacheStore, ScriptSource};
use asmlink::config::HeapConfig;
use asmlink::jit::Arch;
use asmlink::module::Module;
use asmlink::module::symbols::find_code_range;
use asmlink::module::tables::{CodeRange, CodeRangeKind};
use asmlink::resolver::HostResolver;
use asmlink::sample;

fn linked_full() -> Module {
    let mut module = sample::full_module(Arch::X64, &HeapConfig::default()).unwrap();
    module.static_link(&HostResolver).unwrap();
    module
}

/// `n` adjacent 16-byte ranges.
fn dense_ranges(n: u32) -> Vec<CodeRange> {
    (0..n)
        .map(|i| CodeRange::new(CodeRangeKind::Inline, i * 16, i * 16 + 16).unwrap())
        .collect()
}

fn bench_code_range_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("code_range_lookup");
    for n in [16u32, 1024, 65536] {
        let ranges = dense_ranges(n);
        let end = n * 16;
        group.bench_with_input(BenchmarkId::new("find", n), &ranges, |b, ranges| {
            let mut pc = 0u32;
            b.iter(|| {
                pc = (pc + 4099) % end;
                black_box(find_code_range(ranges, black_box(pc)))
            });
        });
    }
    group.finish();

    let module = linked_full();
    let base = module.base();
    let len = module.header().total_bytes as usize;
    c.bench_function("module_pc_lookup", |b| {
        let mut delta = 0usize;
        b.iter(|| {
            delta = (delta + 37) % len;
            black_box(module.lookup_code_range(black_box(base + delta)))
        });
    });
}

fn bench_link_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_path");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("build_and_link", |b| {
        b.iter(|| black_box(linked_full()));
    });

    let source = ScriptSource::new(sample::FULL_FILENAME, sample::FULL_SOURCE.as_bytes());
    let machine = MachineId::for_arch(Arch::X64);
    let store = MemoryCacheStore::new();
    let module = sample::full_module(Arch::X64, &HeapConfig::default()).unwrap();
    assert!(cache::store_module_in_cache(
        &store,
        &source,
        0,
        sample::FULL_SOURCE.len() as u32,
        &module,
        &machine
    ));
    group.bench_function("cache_load", |b| {
        b.iter(|| {
            black_box(cache::lookup_module_in_cache(&store, &source, 0, &machine, &HostResolver).unwrap())
        });
    });

    let mut linked = linked_full();
    let mut enabled = false;
    group.bench_function("profiling_toggle", |b| {
        b.iter(|| {
            enabled = !enabled;
            linked.set_profiling_enabled(enabled).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_code_range_lookup, bench_link_path);
criterion_main!(benches);
