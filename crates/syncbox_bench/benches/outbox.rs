//! Outbox and batch scheduling benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use syncbox_bench::{message, seeded_database};
use syncbox_codec::AssetStager;
use syncbox_engine::{BackendLimits, BatchScheduler, SyncConfig};

/// Benchmark local saves with outbox appends.
fn bench_save_local(c: &mut Criterion) {
    let mut group = c.benchmark_group("save_local");

    for size in [256, 4096].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let db = seeded_database(0);
            let mut i = 0;
            b.iter(|| {
                i += 1;
                black_box(db.save_local(message(i, size)).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark building one batch from a full outbox.
fn bench_build_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_batch");
    let dir = tempfile::tempdir().unwrap();
    let stager = AssetStager::new(dir.path()).unwrap();

    for batch_size in [10, 100, 400].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let config = SyncConfig::new("bench-device", "bench").with_batch_size(batch_size);
                b.iter_batched(
                    || (seeded_database(batch_size), BatchScheduler::new(&config)),
                    |(db, mut scheduler)| {
                        let built = scheduler
                            .build(&db, &stager, BackendLimits::default())
                            .unwrap();
                        black_box(built);
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

/// Benchmark superseded-entry pruning.
fn bench_prune(c: &mut Criterion) {
    c.bench_function("prune_superseded_1000", |b| {
        b.iter_batched(
            || {
                let db = seeded_database(500);
                for i in 0..500 {
                    db.save_local(syncbox_store::Conversation {
                        object_id: format!("conversation-{i}"),
                        title: "renamed".into(),
                        ..Default::default()
                    })
                    .unwrap();
                }
                db
            },
            |db| black_box(db.prune_superseded().unwrap()),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_save_local, bench_build_batch, bench_prune);

criterion_main!(benches);
