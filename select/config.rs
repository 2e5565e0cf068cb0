//! Constructor-level configuration for a single selector fit.
//!
//! A `SelectorConfig` is a plain value: it is validated once at the start of
//! [`crate::optimizer::fit`] and never mutated by fitting. Tuning code clones it
//! and swaps in a different `lmbd` per grid point via [`SelectorConfig::with_lmbd`].

use crate::backend::Device;
use crate::optimizer::FitError;
use crate::penalty::PenaltyPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// How the weight vector is initialised before the first step. The bias always starts at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initialization {
    Zeros,
    /// Gaussian perturbation with standard deviation `scale`, drawn from a seeded generator
    /// so repeated fits with the same configuration are reproducible.
    Noise { scale: f64, seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Regularization strength. Feature `j` is thresholded by its adaptive step
    /// times `lmbd * multiplier_j`.
    pub lmbd: f64,
    pub max_iter: usize,
    /// Convergence threshold on the L2 norm of the parameter displacement.
    ///
    /// RMS normalisation keeps every moving parameter's step close to `lr`, so
    /// the displacement only falls below a `tol` smaller than `lr` once the fit
    /// sits at a fixed point. With the defaults (`tol = 1e-4`, `lr = 1e-3`) a
    /// fit that keeps a growing weight ends at `max_iter` and reports
    /// `converged = false`, while a fit whose parameters stop moving converges early.
    /// Read `converged` as "reached a fixed point", not as a failure signal.
    pub tol: f64,
    pub lr: f64,
    /// Smoothing constant of the squared-gradient moving average.
    pub alpha: f64,
    pub epsilon: f64,
    pub device: Device,
    /// Log a completion report (stop iteration, loss, displacement) at info level.
    pub echo: bool,
    /// Keep per-iteration loss and displacement trajectories in the diagnostics.
    pub record_history: bool,
    // Table-valued fields stay last so the TOML layout keeps plain keys above sections.
    pub penalty: PenaltyPolicy,
    pub init: Initialization,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            lmbd: 1e-4,
            max_iter: 10_000,
            tol: 1e-4,
            lr: 1e-3,
            alpha: 0.9,
            epsilon: 1e-8,
            device: Device::Cpu,
            echo: false,
            record_history: true,
            penalty: PenaltyPolicy::default(),
            init: Initialization::Zeros,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Config file is inconsistent: {0}")]
    Invalid(#[from] FitError),
}

impl SelectorConfig {
    pub fn with_lmbd(&self, lmbd: f64) -> Self {
        Self {
            lmbd,
            ..self.clone()
        }
    }

    pub fn with_max_iter(&self, max_iter: usize) -> Self {
        Self {
            max_iter,
            ..self.clone()
        }
    }

    pub fn with_device(&self, device: Device) -> Self {
        Self {
            device,
            ..self.clone()
        }
    }

    pub fn with_penalty(&self, penalty: PenaltyPolicy) -> Self {
        Self {
            penalty,
            ..self.clone()
        }
    }

    pub fn with_echo(&self, echo: bool) -> Self {
        Self {
            echo,
            ..self.clone()
        }
    }

    /// Checks every numeric option. Called by `fit` before any allocation.
    pub fn validate(&self) -> Result<(), FitError> {
        if !self.lmbd.is_finite() || self.lmbd < 0.0 {
            return Err(FitError::InvalidConfig(format!(
                "lmbd must be finite and non-negative, got {}",
                self.lmbd
            )));
        }
        if self.max_iter == 0 {
            return Err(FitError::InvalidConfig(
                "max_iter must be at least 1".to_string(),
            ));
        }
        for (name, value) in [("tol", self.tol), ("lr", self.lr), ("epsilon", self.epsilon)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(FitError::InvalidConfig(format!(
                    "{name} must be finite and positive, got {value}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.alpha) {
            return Err(FitError::InvalidConfig(format!(
                "alpha must lie in [0, 1), got {}",
                self.alpha
            )));
        }
        if let Initialization::Noise { scale, .. } = self.init {
            if !scale.is_finite() || scale < 0.0 {
                return Err(FitError::InvalidConfig(format!(
                    "initialization noise scale must be finite and non-negative, got {scale}"
                )));
            }
        }
        self.penalty.validate()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a config from TOML. Missing keys fall back to the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SelectorConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_options() {
        let base = SelectorConfig::default();
        assert!(base.with_lmbd(-1.0).validate().is_err());
        assert!(base.with_lmbd(f64::NAN).validate().is_err());
        assert!(base.with_max_iter(0).validate().is_err());

        let mut bad_alpha = base.clone();
        bad_alpha.alpha = 1.0;
        assert!(matches!(
            bad_alpha.validate(),
            Err(FitError::InvalidConfig(_))
        ));

        let mut bad_eps = base.clone();
        bad_eps.epsilon = 0.0;
        assert!(bad_eps.validate().is_err());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed: SelectorConfig = toml::from_str("lmbd = 0.5\nmax_iter = 20\n").unwrap();
        assert_eq!(parsed.lmbd, 0.5);
        assert_eq!(parsed.max_iter, 20);
        assert_eq!(parsed.lr, SelectorConfig::default().lr);
        assert_eq!(parsed.device, Device::Cpu);
    }

    #[test]
    fn save_then_load_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selector.toml");
        let mut config = SelectorConfig::default()
            .with_lmbd(3e-3)
            .with_device(Device::Threads)
            .with_penalty(PenaltyPolicy::ExponentialDecay { rate: 2.0 });
        config.init = Initialization::Noise {
            scale: 0.01,
            seed: 7,
        };
        config.save(&path).unwrap();
        let loaded = SelectorConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
