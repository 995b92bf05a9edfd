//! Benchmarks for contrast equalization, segmentation and surrogate fitting

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deepfake_detection::contrast::ContrastNormalizer;
use deepfake_detection::explain::lime::fit_surrogate;
use deepfake_detection::explain::segmentation::{slic, SlicSettings};
use ndarray::{Array1, Array2, Array3};

fn benchmark_contrast(c: &mut Criterion) {
    let mut group = c.benchmark_group("contrast");

    let crop = Array3::from_shape_fn((224, 224, 3), |_| rand::random::<u8>());
    let normalizer = ContrastNormalizer::default();
    group.bench_function("normalize_224", |b| {
        b.iter(|| black_box(normalizer.normalize(black_box(&crop))));
    });

    group.finish();
}

fn benchmark_segmentation(c: &mut Criterion) {
    let mut group = c.benchmark_group("slic");
    group.sample_size(20);

    for &size in &[64usize, 224] {
        let image = Array3::from_shape_fn((size, size, 3), |_| rand::random::<f32>());
        group.bench_with_input(BenchmarkId::new("segments_50", size), &image, |b, image| {
            b.iter(|| black_box(slic(black_box(image.view()), &SlicSettings::default()).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_surrogate(c: &mut Criterion) {
    let masks = Array2::from_shape_fn((1000, 50), |_| if rand::random::<bool>() { 1.0 } else { 0.0 });
    let targets = Array1::from_shape_fn(1000, |_| rand::random::<f64>());
    let weights = Array1::from_shape_fn(1000, |_| rand::random::<f64>());

    c.bench_function("ridge_1000x50", |b| {
        b.iter(|| black_box(fit_surrogate(&masks, &targets, &weights, 1.0).unwrap()));
    });
}

criterion_group!(benches, benchmark_contrast, benchmark_segmentation, benchmark_surrogate);
criterion_main!(benches);
