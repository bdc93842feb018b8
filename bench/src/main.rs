//! Link-path timings for the sample modules, printed as JSON.
//!
//! Compares building and linking from scratch against loading from the
//! cache, and the cost of a profiling toggle.

use std::time::Instant;

use asmlink::cache::{self, CacheKey, CacheStore, MachineId, MemoryCacheStore, ScriptSource};
use asmlink::config::HeapConfig;
use asmlink::jit::Arch;
use asmlink::module::Module;
use asmlink::resolver::HostResolver;
use asmlink::sample;
use serde::Serialize;

const ITERATIONS: u32 = 200;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    arch: String,
    build_and_link_secs: f64,
    cache_load_secs: f64,
    profiling_toggle_secs: f64,
    entry_bytes: usize,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    iterations: u32,
    results: Vec<BenchmarkResult>,
}

/// Mean seconds per call of `f` over `ITERATIONS` runs.
fn time_mean(mut f: impl FnMut()) -> f64 {
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        f();
    }
    start.elapsed().as_secs_f64() / ITERATIONS as f64
}

fn run_benchmark(
    name: &str,
    arch: Arch,
    filename: &str,
    text: &str,
    build: fn(Arch, &HeapConfig) -> Result<Module, asmlink::LinkError>,
) -> Result<BenchmarkResult, String> {
    let heap = HeapConfig::default();
    let machine = MachineId::for_arch(arch);
    let source = ScriptSource::new(filename, text.as_bytes());
    let store = MemoryCacheStore::new();

    let module = build(arch, &heap).map_err(|e| e.to_string())?;
    if !cache::store_module_in_cache(&store, &source, 0, text.len() as u32, &module, &machine) {
        return Err(format!("{} was not cached", name));
    }
    let key = CacheKey::for_source(source.text, 0).ok_or("empty source")?;
    let entry_bytes = store
        .load(&key)
        .map_err(|e| e.to_string())?
        .map_or(0, |entry| entry.len());

    let build_and_link_secs = time_mean(|| {
        if let Ok(mut module) = build(arch, &heap) {
            let _ = module.static_link(&HostResolver);
        }
    });
    let cache_load_secs = time_mean(|| {
        let loaded = cache::lookup_module_in_cache(&store, &source, 0, &machine, &HostResolver);
        assert!(loaded.is_some());
    });

    let mut linked = build(arch, &heap).map_err(|e| e.to_string())?;
    linked.static_link(&HostResolver).map_err(|e| e.to_string())?;
    let mut enabled = false;
    let profiling_toggle_secs = time_mean(|| {
        enabled = !enabled;
        let _ = linked.set_profiling_enabled(enabled);
    });

    Ok(BenchmarkResult {
        name: name.to_string(),
        arch: format!("{:?}", arch),
        build_and_link_secs,
        cache_load_secs,
        profiling_toggle_secs,
        entry_bytes,
    })
}

fn main() {
    let mut results = Vec::new();
    let cases: [(&str, Arch, &str, &str, fn(Arch, &HeapConfig) -> Result<Module, asmlink::LinkError>); 3] = [
        ("identity", Arch::X64, sample::IDENTITY_FILENAME, sample::IDENTITY_SOURCE, sample::identity_module),
        ("identity", Arch::AArch64, sample::IDENTITY_FILENAME, sample::IDENTITY_SOURCE, sample::identity_module),
        ("full", Arch::X64, sample::FULL_FILENAME, sample::FULL_SOURCE, sample::full_module),
    ];
    for (name, arch, filename, text, build) in cases {
        match run_benchmark(name, arch, filename, text, build) {
            Ok(result) => results.push(result),
            Err(e) => eprintln!("benchmark {} ({:?}) failed: {}", name, arch, e),
        }
    }

    let output = BenchmarkOutput {
        iterations: ITERATIONS,
        results,
    };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
