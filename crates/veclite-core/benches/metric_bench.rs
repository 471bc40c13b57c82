use criterion::{black_box, criterion_group, criterion_main, Criterion};
use veclite_core::metric::{dot, l2_distance, normalize_in_place};
use veclite_core::Metric;

fn vectors(dim: usize) -> (Vec<f32>, Vec<f32>) {
    let a: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.37).sin()).collect();
    let b: Vec<f32> = (0..dim).map(|i| (i as f32 * 0.73).cos()).collect();
    (a, b)
}

fn bench_metrics(c: &mut Criterion) {
    for dim in [128usize, 768, 1536] {
        let (a, b) = vectors(dim);
        c.bench_function(&format!("dot_{dim}"), |bencher| {
            bencher.iter(|| dot(black_box(&a), black_box(&b)));
        });
        c.bench_function(&format!("l2_{dim}"), |bencher| {
            bencher.iter(|| l2_distance(black_box(&a), black_box(&b)));
        });
        c.bench_function(&format!("cosine_score_{dim}"), |bencher| {
            bencher.iter(|| Metric::Cosine.score(black_box(&a), black_box(&b)));
        });
    }
}

fn bench_normalize(c: &mut Criterion) {
    let (a, _) = vectors(768);
    c.bench_function("normalize_768", |bencher| {
        bencher.iter_batched(
            || a.clone(),
            |mut v| normalize_in_place(black_box(&mut v)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_metrics, bench_normalize);
criterion_main!(benches);
