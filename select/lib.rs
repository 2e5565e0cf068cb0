#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
#![allow(non_snake_case)]

//! Prevalence-aware sparse logistic feature selection.
//!
//! The crate fits an L1-penalised logistic model whose per-feature shrinkage
//! threshold grows as a feature's prevalence falls, then searches the
//! regularisation strength with an auto-scaler and a k-fold tuner.

pub mod backend;
pub mod config;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod penalty;
pub mod prevalence;
pub mod progress;
pub mod synthetic;

#[path = "../tuning/mod.rs"]
pub mod tuning;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

pub use config::{Initialization, SelectorConfig};
pub use model::FittedModel;
pub use optimizer::{FitError, fit};
