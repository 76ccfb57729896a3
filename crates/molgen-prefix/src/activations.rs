//! Activation functions and softmax operations.

use std::str::FromStr;

use libm::{erff, tanhf};
use ndarray::{parallel::prelude::*, Array1, ArrayBase, ArrayViewMut2, DataMut, Ix1};
use serde::{Deserialize, Serialize};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;
const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Gelu,
    #[serde(alias = "gelu_new")]
    GeluNew,
    Relu,
    Tanh,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(format!("unknown activation function: {}", s)),
        }
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    let x_cubed = x * x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_cubed);
    0.5 * x * (1.0 + tanhf(inner))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn tanh_scalar(x: f32) -> f32 {
    tanhf(x)
}

impl Activation {
    #[inline(always)]
    fn scalar_fn(self) -> fn(f32) -> f32 {
        match self {
            Activation::Gelu => gelu_scalar,
            Activation::GeluNew => gelu_new_scalar,
            Activation::Relu => relu_scalar,
            Activation::Tanh => tanh_scalar,
        }
    }
}

/// Applies activation in-place to a 2D array view.
pub fn apply_activation_2d_mut(arr: &mut ArrayViewMut2<f32>, activation: Activation) {
    let f = activation.scalar_fn();
    if arr.len() >= PARALLEL_THRESHOLD {
        arr.par_mapv_inplace(f);
    } else {
        arr.mapv_inplace(f);
    }
}

/// Numerically stable softmax over a 1D array, in place.
pub fn softmax_1d_inplace<S>(x: &mut ArrayBase<S, Ix1>)
where
    S: DataMut<Elem = f32>,
{
    let max = x.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        return;
    }
    x.mapv_inplace(|v| (v - max).exp());
    let sum = x.sum();
    if sum > 0.0 {
        x.mapv_inplace(|v| v / sum);
    }
}

pub fn log_softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    let max_val = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let scaled_logits = logits - max_val;
    let exp_sum = scaled_logits.mapv(f32::exp).sum();
    scaled_logits - exp_sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_tanh_is_bounded() {
        let mut x = Array2::from_shape_vec((1, 4), vec![-50.0, -0.5, 0.5, 50.0]).unwrap();
        apply_activation_2d_mut(&mut x.view_mut(), Activation::Tanh);
        assert!(x.iter().all(|v| v.abs() <= 1.0));
        assert!((x[[0, 3]] - 1.0).abs() < 1e-6);
        assert!((x[[0, 1]] + x[[0, 2]]).abs() < 1e-6);
    }

    #[test]
    fn test_gelu_known_values() {
        assert_eq!(gelu_scalar(0.0), 0.0);
        assert!((gelu_scalar(1.0) - 0.8413447).abs() < 1e-5);
        assert!(gelu_scalar(-10.0).abs() < 1e-5);
    }

    #[test]
    fn test_activation_from_str() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("TANH".parse::<Activation>().unwrap(), Activation::Tanh);
        assert!("swishy".parse::<Activation>().is_err());
    }

    #[test]
    fn test_softmax_numerical_stability() {
        let mut logits = array![1000.0, 1001.0, 1002.0];
        softmax_1d_inplace(&mut logits);
        assert!((logits.sum() - 1.0).abs() < 1e-6);
        assert!(logits.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_softmax_ignores_masked_entries() {
        let mut logits = array![f32::NEG_INFINITY, 0.0, 0.0];
        softmax_1d_inplace(&mut logits);
        assert_eq!(logits[0], 0.0);
        assert!((logits[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let logits = array![1.0, 2.0, 3.0];
        let log_probs = log_softmax_1d(&logits);
        let mut probs = logits.clone();
        softmax_1d_inplace(&mut probs);
        for i in 0..3 {
            assert!((log_probs[i] - probs[i].ln()).abs() < 1e-5);
        }
    }
}
