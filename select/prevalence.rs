//! Prevalence providers.
//!
//! The optimizer only consumes a prevalence vector; where it comes from is
//! pluggable. The tuner recomputes it on every fold's training rows so held-out
//! samples never influence the penalty.

use ndarray::{Array1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

pub trait PrevalenceProvider: Sync {
    /// One value in `[0, 1]` per column of `raw`, computed over the rows in `samples`.
    fn prevalence(&self, raw: ArrayView2<f64>, samples: &[usize]) -> Array1<f64>;
}

/// Fraction of samples whose raw value exceeds `baseline` in magnitude.
/// With the default baseline of zero this is the usual nonzero-count frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NonzeroFrequency {
    pub baseline: f64,
}

impl PrevalenceProvider for NonzeroFrequency {
    fn prevalence(&self, raw: ArrayView2<f64>, samples: &[usize]) -> Array1<f64> {
        if samples.is_empty() {
            return Array1::zeros(raw.ncols());
        }
        let subset = raw.select(Axis(0), samples);
        let n = samples.len() as f64;
        subset.map_axis(Axis(0), |column| {
            column.iter().filter(|v| v.abs() > self.baseline).count() as f64 / n
        })
    }
}

/// A precomputed vector returned unchanged for every subset.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedPrevalence(pub Array1<f64>);

impl FixedPrevalence {
    pub fn uniform(n_features: usize, value: f64) -> Self {
        Self(Array1::from_elem(n_features, value))
    }
}

impl PrevalenceProvider for FixedPrevalence {
    fn prevalence(&self, _: ArrayView2<f64>, _: &[usize]) -> Array1<f64> {
        self.0.clone()
    }
}

/// Distribution of prevalence over a set of features.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrevalenceSummary {
    pub count: usize,
    pub min: f64,
    pub median: f64,
    pub mean: f64,
    pub max: f64,
}

impl PrevalenceSummary {
    /// Summarises `values`; `None` when there is nothing to summarise.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        };
        Some(Self {
            count,
            min: sorted[0],
            median,
            mean: sorted.iter().sum::<f64>() / count as f64,
            max: sorted[count - 1],
        })
    }

    /// Summary of the prevalence of the features flagged in `mask`.
    pub fn of_selected(prevalence: &Array1<f64>, mask: &[bool]) -> Option<Self> {
        let selected: Vec<f64> = prevalence
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(&p, _)| p)
            .collect();
        Self::from_values(&selected)
    }

    /// Element-wise mean over several summaries.
    pub fn average(summaries: &[Self]) -> Option<Self> {
        if summaries.is_empty() {
            return None;
        }
        let k = summaries.len() as f64;
        let mean_of = |f: fn(&Self) -> f64| summaries.iter().map(f).sum::<f64>() / k;
        Some(Self {
            count: (summaries.iter().map(|s| s.count).sum::<usize>() as f64 / k).round() as usize,
            min: mean_of(|s| s.min),
            median: mean_of(|s| s.median),
            mean: mean_of(|s| s.mean),
            max: mean_of(|s| s.max),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn nonzero_frequency_counts_only_requested_rows() {
        let raw = array![[0.0, 3.0, 1.0], [2.0, 0.0, 1.0], [0.0, 0.0, 1.0], [5.0, 1.0, 0.0]];
        let provider = NonzeroFrequency::default();
        let all = provider.prevalence(raw.view(), &[0, 1, 2, 3]);
        assert_eq!(all, array![0.5, 0.5, 0.75]);
        let subset = provider.prevalence(raw.view(), &[1, 3]);
        assert_eq!(subset, array![1.0, 0.5, 0.5]);
        assert_eq!(provider.prevalence(raw.view(), &[]), array![0.0, 0.0, 0.0]);
    }

    #[test]
    fn baseline_ignores_small_values() {
        let raw = array![[0.1, 2.0], [0.05, 0.0]];
        let provider = NonzeroFrequency { baseline: 0.5 };
        assert_eq!(provider.prevalence(raw.view(), &[0, 1]), array![0.0, 0.5]);
    }

    #[test]
    fn summary_statistics() {
        let summary = PrevalenceSummary::from_values(&[0.4, 0.1, 0.9, 0.6]).unwrap();
        assert_eq!(summary.count, 4);
        assert_abs_diff_eq!(summary.min, 0.1);
        assert_abs_diff_eq!(summary.median, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.max, 0.9);
        assert!(PrevalenceSummary::from_values(&[]).is_none());
    }

    #[test]
    fn summary_of_selected_features_and_average() {
        let prevalence = array![0.2, 0.8, 0.5];
        let first = PrevalenceSummary::of_selected(&prevalence, &[true, true, false]).unwrap();
        assert_abs_diff_eq!(first.mean, 0.5);
        assert!(PrevalenceSummary::of_selected(&prevalence, &[false, false, false]).is_none());
        let second = PrevalenceSummary::of_selected(&prevalence, &[false, false, true]).unwrap();
        let averaged = PrevalenceSummary::average(&[first, second]).unwrap();
        assert_eq!(averaged.count, 2);
        assert_abs_diff_eq!(averaged.min, 0.35, epsilon = 1e-12);
        assert_abs_diff_eq!(averaged.max, 0.65, epsilon = 1e-12);
        assert!(PrevalenceSummary::average(&[]).is_none());
    }
}
