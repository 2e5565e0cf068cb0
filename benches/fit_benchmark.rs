// ========================================================================================
//
//                 Prevalent single-fit performance benchmark
//
// ========================================================================================
//
// Measures one weighted proximal fit on a synthetic zero-inflated matrix for each
// compute backend, and the cost of the two products that dominate every iteration.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array1;
use prevalent::backend::Device;
use prevalent::prevalence::{NonzeroFrequency, PrevalenceProvider};
use prevalent::synthetic::SyntheticSelectionBuilder;
use prevalent::{SelectorConfig, fit};

/// Sample counts to benchmark; the feature count is fixed.
const SAMPLE_COUNTS: [usize; 3] = [200, 1_000, 5_000];
const NUM_FEATURES: usize = 500;
const ITERATIONS: usize = 200;

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit");
    group.sample_size(10);

    for &n_samples in &SAMPLE_COUNTS {
        let data = SyntheticSelectionBuilder::new(n_samples, NUM_FEATURES)
            .with_signal_features(5)
            .with_dropout(0.6)
            .seed(17)
            .build();
        let rows: Vec<usize> = (0..n_samples).collect();
        let prevalence = NonzeroFrequency::default().prevalence(data.raw.view(), &rows);
        group.throughput(Throughput::Elements((n_samples * NUM_FEATURES) as u64));

        for device in [Device::Cpu, Device::Threads] {
            let mut config = SelectorConfig::default()
                .with_max_iter(ITERATIONS)
                .with_device(device);
            config.tol = 1e-300;
            config.record_history = false;
            group.bench_with_input(
                BenchmarkId::new(device.to_string(), n_samples),
                &n_samples,
                |b, _| {
                    b.iter(|| {
                        fit(
                            black_box(data.x.view()),
                            black_box(data.y.view()),
                            black_box(prevalence.view()),
                            &config,
                        )
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_backend_products(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_products");
    let data = SyntheticSelectionBuilder::new(5_000, NUM_FEATURES).seed(3).build();
    let w = Array1::from_elem(NUM_FEATURES, 0.01);
    let r = Array1::from_elem(data.n_samples(), 0.5);

    for device in [Device::Cpu, Device::Threads] {
        let backend = device.backend();
        group.bench_function(BenchmarkId::new("linear_predictor", backend.name()), |b| {
            b.iter(|| backend.linear_predictor(black_box(data.x.view()), w.view(), 0.1))
        });
        group.bench_function(
            BenchmarkId::new("scaled_transpose_product", backend.name()),
            |b| b.iter(|| backend.scaled_transpose_product(black_box(data.x.view()), r.view())),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fit, bench_backend_products);
criterion_main!(benches);
