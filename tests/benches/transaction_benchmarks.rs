//! # Task Transaction Benchmarks
//!
//! | Path | What is measured |
//! |------|------------------|
//! | begin/end | Bind, register, close an empty transaction |
//! | add/end | Schedule N operations and drain them |
//! | nested | Operations that stash work on their own transaction |

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use task_transaction::{spawn, Registry};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

fn bench_begin_end(c: &mut Criterion) {
    let runtime = runtime();
    let registry = Registry::new();

    c.bench_function("begin_end_empty", |b| {
        b.to_async(&runtime).iter(|| {
            let registry = Arc::clone(&registry);
            async move {
                let handle = spawn(async move {
                    let txn = registry.begin(None);
                    let values = txn.end().await?;
                    anyhow::Ok(values.len())
                })
                .expect("runtime available");
                black_box(handle.join().await.expect("transaction closed"));
            }
        })
    });
}

fn bench_add_end(c: &mut Criterion) {
    let runtime = runtime();
    let registry = Registry::new();
    let mut group = c.benchmark_group("add_end");

    for count in [1_usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&runtime).iter(|| {
                let registry = Arc::clone(&registry);
                async move {
                    let handle = spawn(async move {
                        let txn = registry.begin(None);
                        for n in 0..count {
                            txn.add(async move { anyhow::Ok(n) })?;
                        }
                        let values = txn.end().await?;
                        anyhow::Ok(values.len())
                    })
                    .expect("runtime available");
                    black_box(handle.join().await.expect("transaction closed"));
                }
            })
        });
    }
    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let runtime = runtime();
    let registry = Registry::new();

    c.bench_function("nested_100", |b| {
        b.to_async(&runtime).iter(|| {
            let registry = Arc::clone(&registry);
            async move {
                let handle = spawn(async move {
                    let txn = registry.begin(None);
                    for n in 0..100_usize {
                        let reg = Arc::clone(&registry);
                        txn.add(async move {
                            reg.get(None)?.add(async move { anyhow::Ok(n) })?;
                            anyhow::Ok(())
                        })?;
                    }
                    txn.end().await?;
                    anyhow::Ok(())
                })
                .expect("runtime available");
                black_box(handle.join().await.expect("transaction closed"));
            }
        })
    });
}

criterion_group!(benches, bench_begin_end, bench_add_end, bench_nested);
criterion_main!(benches);
