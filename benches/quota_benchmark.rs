//! Quota store and upload ticket benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use stem_proxy::authorizer::CredentialSigner;
use stem_proxy::quota::QuotaStore;

fn store(limit: u32) -> QuotaStore {
    QuotaStore::new(limit, Vec::new(), Duration::from_secs(900))
}

fn benchmark_check(c: &mut Criterion) {
    let quota = store(3);
    quota.reserve("10.0.0.1").unwrap();

    c.bench_function("quota_check_known_client", |b| {
        b.iter(|| black_box(quota.check(black_box("10.0.0.1"))));
    });
    c.bench_function("quota_check_unknown_client", |b| {
        b.iter(|| black_box(quota.check(black_box("10.0.0.99"))));
    });
}

fn benchmark_reservation_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservation_cycle");

    for clients in [1usize, 100, 10_000].iter() {
        let identities: Vec<String> = (0..*clients).map(|i| format!("10.1.{}.{}", i / 256, i % 256)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(clients), clients, |b, _| {
            let quota = store(u32::MAX);
            let mut next = 0usize;
            b.iter(|| {
                let identity = &identities[next % identities.len()];
                next += 1;
                let _ = quota.reserve(identity);
                black_box(quota.debit(identity));
            });
        });
    }

    group.finish();
}

fn benchmark_contended_reserve(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("reserve_debit_8_tasks", |b| {
        b.to_async(&runtime).iter(|| async {
            let quota = Arc::new(store(u32::MAX));
            let tasks: Vec<_> = (0..8)
                .map(|t| {
                    let quota = quota.clone();
                    tokio::spawn(async move {
                        for i in 0..64 {
                            let identity = format!("10.2.{}.{}", t, i);
                            let _ = quota.reserve(&identity);
                            quota.debit(&identity);
                        }
                    })
                })
                .collect();
            for task in tasks {
                let _ = task.await;
            }
        });
    });
}

fn benchmark_credentials(c: &mut Criterion) {
    let signer = CredentialSigner::new(
        "bench-secret",
        "https://separator.example/api/upload/",
        Duration::from_secs(900),
    );
    let credential = signer.issue("10.0.0.1", "song.mp3", 4_194_304).unwrap();

    c.bench_function("credential_issue", |b| {
        b.iter(|| black_box(signer.issue("10.0.0.1", "song.mp3", 4_194_304)));
    });
    c.bench_function("credential_verify", |b| {
        b.iter(|| black_box(signer.verify(black_box(&credential.token))));
    });
}

criterion_group!(
    benches,
    benchmark_check,
    benchmark_reservation_cycle,
    benchmark_contended_reserve,
    benchmark_credentials
);
criterion_main!(benches);
