//! Benchmarks for capsule routing and native network inference

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deepfake_detection::capsule::{squash_rows, CapsuleLayer};
use deepfake_detection::network::{CapsNet, CapsNetSpec, Layer, Network};
use ndarray::{Array1, Array2, Array4};

fn random_array4(shape: (usize, usize, usize, usize)) -> Array4<f32> {
    Array4::from_shape_fn(shape, |_| rand::random::<f32>() - 0.5)
}

fn benchmark_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");

    for &input_capsules in &[32usize, 128, 512] {
        let layer = CapsuleLayer::with_default_routings(random_array4((2, input_capsules, 16, 8))).unwrap();
        let poses = squash_rows(Array2::from_shape_fn((input_capsules, 8), |_| rand::random::<f32>()).view());

        group.bench_with_input(BenchmarkId::new("route", input_capsules), &poses, |b, poses| {
            b.iter(|| black_box(layer.route(black_box(poses.view())).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_capsnet(c: &mut Criterion) {
    let size = 32;
    let spec = CapsNetSpec {
        name: "bench".to_string(),
        input_shape: [size, size, 3],
        layers: vec![
            Layer::Conv2d {
                kernel: random_array4((5, 5, 3, 16)),
                bias: Array1::zeros(16),
                stride: 2,
            },
            Layer::Relu,
            Layer::MaxPool { size: 2 },
            Layer::PrimaryCaps { dim: 8 },
            Layer::Capsule(CapsuleLayer::with_default_routings(random_array4((2, 72, 16, 8))).unwrap()),
            Layer::Length,
        ],
    };
    let network = CapsNet::new(spec).unwrap();

    let mut group = c.benchmark_group("capsnet");
    for &batch_size in &[1usize, 7] {
        let batch = Array4::from_shape_fn((batch_size, size, size, 3), |_| rand::random::<f32>());
        group.bench_with_input(BenchmarkId::new("predict", batch_size), &batch, |b, batch| {
            b.iter(|| black_box(network.predict(black_box(batch)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_routing, benchmark_capsnet);
criterion_main!(benches);
