//! Execution backends for the optimizer's inner-loop arithmetic.
//!
//! The optimizer only ever asks for two products per iteration: the linear
//! predictor `X·w + b` and the scaled transpose product `Xᵀr / n`. Both
//! backends reduce every output element with the same sequential dot product,
//! so switching device changes where the work runs, never the numbers.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compute target selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Single-threaded evaluation on the calling thread.
    Cpu,
    /// Row and column reductions spread over the rayon pool.
    Threads,
}

impl Device {
    pub fn backend(self) -> &'static dyn ComputeBackend {
        match self {
            Device::Cpu => &SerialBackend,
            Device::Threads => &RayonBackend,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Cpu => "cpu",
            Device::Threads => "threads",
        })
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "cpu" | "serial" => Ok(Device::Cpu),
            "threads" | "rayon" | "parallel" => Ok(Device::Threads),
            other => Err(format!("unknown device '{other}', expected 'cpu' or 'threads'")),
        }
    }
}

pub trait ComputeBackend: Sync {
    fn name(&self) -> &'static str;

    /// `X·w + b`, one entry per row of `x`.
    fn linear_predictor(&self, x: ArrayView2<f64>, w: ArrayView1<f64>, b: f64) -> Array1<f64>;

    /// `Xᵀr / n` where `n` is the number of rows of `x`.
    fn scaled_transpose_product(&self, x: ArrayView2<f64>, r: ArrayView1<f64>) -> Array1<f64>;
}

pub struct SerialBackend;

impl ComputeBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn linear_predictor(&self, x: ArrayView2<f64>, w: ArrayView1<f64>, b: f64) -> Array1<f64> {
        let mut eta = Array1::zeros(x.nrows());
        Zip::from(&mut eta)
            .and(x.rows())
            .for_each(|out, row| *out = row.dot(&w) + b);
        eta
    }

    fn scaled_transpose_product(&self, x: ArrayView2<f64>, r: ArrayView1<f64>) -> Array1<f64> {
        let n = x.nrows() as f64;
        let mut grad = Array1::zeros(x.ncols());
        Zip::from(&mut grad)
            .and(x.columns())
            .for_each(|out, column| *out = column.dot(&r) / n);
        grad
    }
}

pub struct RayonBackend;

impl ComputeBackend for RayonBackend {
    fn name(&self) -> &'static str {
        "threads"
    }

    fn linear_predictor(&self, x: ArrayView2<f64>, w: ArrayView1<f64>, b: f64) -> Array1<f64> {
        let values: Vec<f64> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| row.dot(&w) + b)
            .collect();
        Array1::from(values)
    }

    fn scaled_transpose_product(&self, x: ArrayView2<f64>, r: ArrayView1<f64>) -> Array1<f64> {
        let n = x.nrows() as f64;
        let values: Vec<f64> = x
            .axis_iter(Axis(1))
            .into_par_iter()
            .map(|column| column.dot(&r) / n)
            .collect();
        Array1::from(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn backends_agree_exactly() {
        let x = array![
            [0.5, -1.0, 2.0],
            [1.5, 0.0, -0.25],
            [-2.0, 3.0, 0.125],
            [0.0, 0.75, 1.0]
        ];
        let w = array![0.3, -0.7, 1.1];
        let r = array![0.2, -0.4, 0.9, -0.1];

        let serial_eta = SerialBackend.linear_predictor(x.view(), w.view(), 0.5);
        let rayon_eta = RayonBackend.linear_predictor(x.view(), w.view(), 0.5);
        assert_eq!(serial_eta, rayon_eta);

        let serial_grad = SerialBackend.scaled_transpose_product(x.view(), r.view());
        let rayon_grad = RayonBackend.scaled_transpose_product(x.view(), r.view());
        assert_eq!(serial_grad, rayon_grad);
    }

    #[test]
    fn transpose_product_is_a_column_mean() {
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let r = array![1.0, 1.0];
        let grad = SerialBackend.scaled_transpose_product(x.view(), r.view());
        assert_eq!(grad, array![2.0, 3.0]);
    }

    #[test]
    fn device_parses_from_cli_strings() {
        assert_eq!("CPU".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("rayon".parse::<Device>().unwrap(), Device::Threads);
        assert!("gpu".parse::<Device>().is_err());
        assert_eq!(Device::Threads.backend().name(), "threads");
    }
}
