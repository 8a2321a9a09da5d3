//! Performance benchmarks for the sync layer.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use livesync::mutations::{edit_map, MapEdit};
use livesync::{
    ChangeKind, DocRef, Document, DocumentChange, Filter, LiveQuery, MemoryStore,
    MutationRequest, OrderSpec, Reconciler, Sequence, SnapshotOrder, SyncClient, SyncConfig,
    Timestamp,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn messages(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            Document::new(format!("m{:06}", i), json!({"roomId": "general", "timestamp": i * 2}))
                .with_create_time(Timestamp(i as i64))
        })
        .collect()
}

fn loaded(count: usize) -> Reconciler {
    let mut reconciler = Reconciler::new(SnapshotOrder::Declared(Some(OrderSpec::asc("timestamp"))), None);
    reconciler.apply_full(messages(count), Sequence(1));
    reconciler
}

/// Splicing one change into a loaded view versus rebuilding it from a full push
fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    for size in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("splice_change", size), &size, |b, &size| {
            let mut reconciler = loaded(size);
            let mut seq = 1u64;
            b.iter(|| {
                seq += 1;
                // odd timestamps land between existing entries
                let doc = Document::new("inserted", json!({"roomId": "general", "timestamp": size + 1}));
                black_box(reconciler.apply_change(
                    DocumentChange { kind: ChangeKind::Modified, doc },
                    Sequence(seq),
                ));
            });
        });

        group.bench_with_input(BenchmarkId::new("full_replace", size), &size, |b, &size| {
            let docs = messages(size);
            let mut reconciler = loaded(size);
            let mut seq = 1u64;
            b.iter(|| {
                seq += 1;
                black_box(reconciler.apply_full(docs.clone(), Sequence(seq)));
            });
        });
    }

    group.finish();
}

fn bench_degraded_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("degraded_sort");

    for size in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("docs", size), &size, |b, &size| {
            let docs: Vec<Document> = messages(size).into_iter().rev().collect();
            b.iter(|| {
                let mut docs = docs.clone();
                SnapshotOrder::Degraded.sort(&mut docs);
                black_box(docs);
            });
        });
    }

    group.finish();
}

fn bench_edit_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("edit_map");

    for reactors in [10, 100, 1000] {
        let mut map = Map::new();
        map.insert(
            "👍".to_string(),
            Value::Array((0..reactors).map(|i| json!(format!("user{}", i))).collect()),
        );
        let map = Value::Object(map);
        let subject = json!("newcomer");

        group.bench_with_input(BenchmarkId::new("toggle", reactors), &map, |b, map| {
            b.iter(|| black_box(edit_map(Some(map), "👍", &subject, MapEdit::Toggle).unwrap()));
        });
    }

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for consumers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("consumers", consumers),
            &consumers,
            |b, &consumers| {
                let store = Arc::new(MemoryStore::new());
                store.seed("chatMessages", Document::new("m1", json!({"roomId": "general", "timestamp": 1})));
                let client = SyncClient::new(store, SyncConfig::default());
                let query = LiveQuery::new("chatMessages")
                    .filter(Filter::eq("roomId", json!("general")))
                    .order_by(OrderSpec::asc("timestamp"));
                let handles: Vec<_> = (0..consumers)
                    .map(|_| client.subscribe(query.clone(), |e| {
                        black_box(e);
                    }).unwrap())
                    .collect();
                let msg = DocRef::new("chatMessages", "m1");

                b.iter(|| {
                    client
                        .mutate_set(&MutationRequest::toggle(msg.clone(), "reactions", "👍", "alice"))
                        .unwrap();
                });

                for handle in handles {
                    client.unsubscribe(handle);
                }
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reconcile,
    bench_degraded_sort,
    bench_edit_map,
    bench_fan_out,
);

criterion_main!(benches);
