use criterion::{BenchmarkId, Criterion};

use brookcore::compile::Compiler;
use brookcore::concurrent::par_join;
use brookcore::constructors::{emits, range};

criterion::criterion_group!(core, to_list_range, map_pipeline, par_join_throughput);
criterion::criterion_main!(core);

fn tokio_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build benchmark runtime")
}

fn to_list_range(c: &mut Criterion) {
    let rt = tokio_runtime();
    c.bench_function("to_list(range(0, 100_000))", |b| {
        b.iter(|| {
            rt.block_on(async {
                let compiler = Compiler::new();
                compiler.to_list(range(0, 100_000)).await.unwrap()
            })
        })
    });
}

fn map_pipeline(c: &mut Criterion) {
    let rt = tokio_runtime();
    let mut group = c.benchmark_group("map_pipeline");
    for size in &[1_000i64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let compiler = Compiler::new();
                    let stream = range(0, size).map(|n| n * 2).filter(|n| *n % 4 == 0);
                    compiler.count(stream).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

fn par_join_throughput(c: &mut Criterion) {
    let rt = tokio_runtime();
    c.bench_function("par_join(8) over 8 lanes of 1_000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let compiler = Compiler::new();
                let lanes: Vec<_> = (0..8).map(|_| emits(0..1_000i64)).collect();
                let joined = par_join(8, lanes);
                compiler.drain(joined).await.unwrap()
            })
        })
    });
}
