//! Performance benchmarks for the hot module runtime
//!
//! Run with: cargo bench
//!
//! Covers the hot paths a reload storm hits:
//! - Minting module contexts as versions advance
//! - Draining the deferred task queue
//! - Structural-key lookups in the virtual module registry
//! - Manifest parsing and chunk resolution

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hotswap::hmr::{ChunkLoader, ModuleVersion, RuntimeGraph};
use hotswap::manifest::Manifest;
use hotswap::task::TaskQueue;
use hotswap::virtual_module::VirtualModuleRegistry;
use url::Url;

struct NullLoader;

impl ChunkLoader for NullLoader {
    fn load(&self, _url: &Url) -> anyhow::Result<()> {
        Ok(())
    }
}

fn graph() -> RuntimeGraph {
    RuntimeGraph::new(Arc::new(TaskQueue::new()), Arc::new(NullLoader))
}

/// Benchmark: one module superseded over and over
fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    group.bench_function("supersede", |b| {
        let graph = graph();
        let mut version = 0u64;
        b.iter(|| {
            version += 1;
            let context = graph.create(black_box("counter"), ModuleVersion(version));
            graph.tasks().run_pending();
            context
        })
    });

    group.bench_function("stale", |b| {
        let graph = graph();
        graph.create("counter", ModuleVersion(u64::MAX));
        b.iter(|| graph.create(black_box("counter"), ModuleVersion(1)))
    });

    for modules in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(modules as u64));
        group.bench_with_input(BenchmarkId::new("rebuild", modules), &modules, |b, &n| {
            let ids: Vec<String> = (0..n).map(|i| format!("module-{}", i)).collect();
            let graph = graph();
            let mut version = 0u64;
            b.iter(|| {
                version += 1;
                for id in &ids {
                    graph.create(id, ModuleVersion(version));
                }
                graph.tasks().run_pending()
            })
        });
    }

    group.finish();
}

/// Benchmark: deferred job throughput
fn bench_task_queue(c: &mut Criterion) {
    c.bench_function("task_queue_drain_100", |b| {
        let tasks = TaskQueue::new();
        b.iter(|| {
            for _ in 0..100 {
                tasks.defer(|| {
                    black_box(());
                });
            }
            tasks.run_pending()
        })
    });
}

/// Benchmark: registering already-known structural keys
fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");

    group.bench_function("register_hit", |b| {
        let registry = VirtualModuleRegistry::new("bench");
        registry.add_external("fs", None).unwrap();
        b.iter(|| registry.add_external(black_box("fs"), None).unwrap())
    });

    group.bench_function("register_miss", |b| {
        let registry = VirtualModuleRegistry::new("bench");
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            registry.add_global(&n.to_string(), None).unwrap()
        })
    });

    group.finish();
}

/// Benchmark: manifest parse and resolve
fn bench_manifest(c: &mut Criterion) {
    let chunks: Vec<String> = (0..50).map(|i| format!("app-part{}.{}.mjs", i, i * 7)).collect();
    let text = Manifest::new(chunks.iter().map(String::as_str))
        .to_pretty_json()
        .unwrap();
    let base = Url::parse("http://localhost:8080/assets/main.json").unwrap();

    c.bench_function("manifest_resolve_50", |b| {
        b.iter(|| {
            let manifest = Manifest::parse(black_box(&text)).unwrap();
            manifest.resolve(&base)
        })
    });
}

criterion_group!(
    benches,
    bench_create,
    bench_task_queue,
    bench_registry,
    bench_manifest,
);

criterion_main!(benches);
