//! Mapping from feature prevalence to a proximal-threshold multiplier.
//!
//! Features seen in few samples are dominated by dropout, so their shrinkage
//! threshold is inflated. Every policy is non-increasing in prevalence and
//! returns exactly `1.0` for a feature present in every sample.

use crate::optimizer::FitError;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PenaltyPolicy {
    /// `1 / max(p, floor)`. The floor caps the multiplier for absent features at `1 / floor`.
    Inverse { floor: f64 },
    /// `exp(rate * (1 - p))`, bounded by `exp(rate)`.
    ExponentialDecay { rate: f64 },
    /// Flat multiplier of one: prevalence is ignored.
    Uniform,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        PenaltyPolicy::Inverse { floor: 0.01 }
    }
}

impl PenaltyPolicy {
    pub fn validate(&self) -> Result<(), FitError> {
        match *self {
            PenaltyPolicy::Inverse { floor } if !(floor > 0.0 && floor <= 1.0) => {
                Err(FitError::InvalidConfig(format!(
                    "inverse penalty floor must lie in (0, 1], got {floor}"
                )))
            }
            PenaltyPolicy::ExponentialDecay { rate } if !(rate.is_finite() && rate >= 0.0) => {
                Err(FitError::InvalidConfig(format!(
                    "exponential penalty rate must be finite and non-negative, got {rate}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Multiplier for a single prevalence value, assumed to be in `[0, 1]`.
    pub fn multiplier(&self, prevalence: f64) -> f64 {
        match *self {
            PenaltyPolicy::Inverse { floor } => 1.0 / prevalence.max(floor),
            PenaltyPolicy::ExponentialDecay { rate } => (rate * (1.0 - prevalence)).exp(),
            PenaltyPolicy::Uniform => 1.0,
        }
    }
}

/// Validates a prevalence vector and maps it through `policy`.
///
/// Computed once per fit; the optimizer multiplies the result by `lmbd` to get the
/// per-feature soft-threshold.
pub fn penalty_weights(
    prevalence: ArrayView1<f64>,
    policy: &PenaltyPolicy,
) -> Result<Array1<f64>, FitError> {
    if let Some((index, &value)) = prevalence
        .iter()
        .enumerate()
        .find(|(_, p)| !(p.is_finite() && (0.0..=1.0).contains(*p)))
    {
        return Err(FitError::InvalidPrevalence { index, value });
    }
    Ok(prevalence.mapv(|p| policy.multiplier(p)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn policies() -> [PenaltyPolicy; 3] {
        [
            PenaltyPolicy::Inverse { floor: 0.01 },
            PenaltyPolicy::ExponentialDecay { rate: 3.0 },
            PenaltyPolicy::Uniform,
        ]
    }

    #[test]
    fn full_prevalence_maps_to_unit_multiplier() {
        for policy in policies() {
            assert_abs_diff_eq!(policy.multiplier(1.0), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn multipliers_never_increase_with_prevalence() {
        let grid: Vec<f64> = (0..=100).map(|i| i as f64 / 100.0).collect();
        for policy in policies() {
            for pair in grid.windows(2) {
                assert!(
                    policy.multiplier(pair[0]) >= policy.multiplier(pair[1]),
                    "{policy:?} increased between {} and {}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn inverse_floor_caps_absent_features() {
        let policy = PenaltyPolicy::Inverse { floor: 0.05 };
        assert_abs_diff_eq!(policy.multiplier(0.0), 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(policy.multiplier(0.5), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_prevalence_outside_unit_interval() {
        let bad = array![0.2, 1.3, 0.4];
        match penalty_weights(bad.view(), &PenaltyPolicy::default()) {
            Err(FitError::InvalidPrevalence { index, value }) => {
                assert_eq!(index, 1);
                assert_abs_diff_eq!(value, 1.3);
            }
            other => panic!("expected InvalidPrevalence, got {other:?}"),
        }
        let nan = array![f64::NAN];
        assert!(penalty_weights(nan.view(), &PenaltyPolicy::Uniform).is_err());
    }

    #[test]
    fn rejects_degenerate_policies() {
        assert!(PenaltyPolicy::Inverse { floor: 0.0 }.validate().is_err());
        assert!(
            PenaltyPolicy::ExponentialDecay { rate: -1.0 }
                .validate()
                .is_err()
        );
        assert!(PenaltyPolicy::Uniform.validate().is_ok());
    }
}
