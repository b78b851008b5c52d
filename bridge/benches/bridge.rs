//! Round-trip cost of bridged calls over the memory engine

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use tether_bridge::{Bridge, EngineConfig};
use tether_native::MemoryEngine;
use tokio::runtime::Runtime;

fn setup() -> (Runtime, Bridge) {
    let runtime = Runtime::new().expect("runtime");
    let native = Arc::new(MemoryEngine::new().expect("memory engine"));
    (runtime, Bridge::new(native))
}

fn bench_blobs(c: &mut Criterion) {
    let (runtime, bridge) = setup();
    let engine = runtime
        .block_on(bridge.create_engine(&EngineConfig::new("/tmp/tether-bench")))
        .expect("engine");

    let mut group = c.benchmark_group("blobs");
    for size in [64usize, 4 * 1024, 256 * 1024] {
        let content = vec![7u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("put", size), &content, |b, content| {
            b.iter(|| runtime.block_on(engine.put(black_box(content))))
        });

        let ticket = runtime.block_on(engine.put(&content)).expect("put");
        group.bench_with_input(BenchmarkId::new("get", size), &ticket, |b, ticket| {
            b.iter(|| runtime.block_on(engine.get(black_box(ticket))))
        });
    }
    group.finish();

    runtime.block_on(engine.close()).expect("close");
}

fn bench_documents(c: &mut Criterion) {
    let (runtime, bridge) = setup();
    let (engine, doc, author) = runtime.block_on(async {
        let engine = bridge
            .create_engine(&EngineConfig::new("/tmp/tether-bench-docs").with_docs())
            .await
            .expect("engine");
        let author = bridge.create_author().await.expect("author");
        engine.import_author(&author).await.expect("import");
        let doc = engine.create_doc().await.expect("doc");
        (engine, doc, author)
    });

    let mut group = c.benchmark_group("documents");

    let mut n = 0u64;
    group.bench_function("set", |b| {
        b.iter(|| {
            n += 1;
            let key = format!("bench/{n}");
            runtime.block_on(doc.set(&author, key.as_bytes(), black_box(b"value")))
        })
    });

    group.bench_function("get_many_100", |b| {
        runtime.block_on(async {
            for i in 0..100 {
                let key = format!("scan/{i:03}");
                doc.set(&author, key.as_bytes(), b"v").await.expect("set");
            }
        });
        b.iter(|| {
            runtime.block_on(async {
                let stream = doc.get_many(black_box(b"scan/")).expect("stream");
                stream.count().await
            })
        })
    });

    group.finish();
    runtime.block_on(async {
        doc.close().await.expect("close doc");
        engine.close().await.expect("close engine");
    });
}

criterion_group!(benches, bench_blobs, bench_documents);
criterion_main!(benches);
