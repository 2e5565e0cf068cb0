//! Seeded synthetic selection problems.
//!
//! Used by the integration tests and the benchmark: a block of signal columns
//! that reproduce the label as `±1`, followed by i.i.d. standard normal noise
//! columns. A matching raw count matrix is produced so prevalence can be
//! computed the same way as for real data.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// A generated problem. Column `j` of `x` and `raw` is feature `feature_names[j]`.
#[derive(Clone, Debug)]
pub struct SyntheticSelection {
    pub x: Array2<f64>,
    pub raw: Array2<f64>,
    pub y: Array1<f64>,
    pub feature_names: Vec<String>,
    pub signal_features: usize,
}

impl SyntheticSelection {
    pub fn n_samples(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn sample_ids(&self) -> Vec<String> {
        (0..self.n_samples()).map(|i| format!("sample{i}")).collect()
    }
}

pub struct SyntheticSelectionBuilder {
    n_samples: usize,
    n_features: usize,
    signal_features: usize,
    dropout: f64,
    seed: u64,
}

impl SyntheticSelectionBuilder {
    /// One signal feature at index 0 and no dropout by default.
    pub fn new(n_samples: usize, n_features: usize) -> Self {
        Self {
            n_samples,
            n_features,
            signal_features: 1.min(n_features),
            dropout: 0.0,
            seed: 42,
        }
    }

    /// Number of leading columns that carry the label.
    pub fn with_signal_features(mut self, count: usize) -> Self {
        self.signal_features = count.min(self.n_features);
        self
    }

    /// Probability that a noise entry is a structural zero in both matrices.
    pub fn with_dropout(mut self, fraction: f64) -> Self {
        self.dropout = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Labels alternate `0, 1, 0, 1, ...` so both classes are always present.
    pub fn build(self) -> SyntheticSelection {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = self.n_samples;
        let y = Array1::from_shape_fn(n, |i| (i % 2) as f64);

        let mut x = Array2::<f64>::zeros((n, self.n_features));
        let mut raw = Array2::<f64>::zeros((n, self.n_features));
        for i in 0..n {
            let sign = 2.0 * y[i] - 1.0;
            for j in 0..self.n_features {
                if j < self.signal_features {
                    x[[i, j]] = sign;
                    raw[[i, j]] = 2.0 + sign;
                    continue;
                }
                let value: f64 = rng.sample(StandardNormal);
                if self.dropout > 0.0 && rng.gen_range(0.0..1.0) < self.dropout {
                    continue;
                }
                x[[i, j]] = value;
                raw[[i, j]] = (value.abs() * 10.0).ceil().max(1.0);
            }
        }

        let feature_names = (0..self.n_features)
            .map(|j| {
                if j < self.signal_features {
                    format!("signal{j}")
                } else {
                    format!("noise{j}")
                }
            })
            .collect();

        SyntheticSelection {
            x,
            raw,
            y,
            feature_names,
            signal_features: self.signal_features,
        }
    }
}
