//! Layer normalization.

use anyhow::Result;
use ndarray::{Array1, Array3, ArrayView3, Axis};

use crate::weights::{Init, ParamStore};

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    pub fn from_store(store: &mut ParamStore, prefix: &str, dim: usize, eps: f32) -> Result<Self> {
        let weight = store.array1(&format!("{}.weight", prefix), dim, Init::Ones)?;
        let bias = store.array1(&format!("{}.bias", prefix), dim, Init::Zeros)?;
        Ok(Self::new(weight, bias, eps))
    }

    /// Normalises the last axis of `[batch, seq, hidden]`.
    pub fn forward(&self, hidden_states: &ArrayView3<f32>) -> Array3<f32> {
        let hidden = hidden_states.dim().2 as f32;
        let mean = hidden_states.sum_axis(Axis(2)) / hidden;
        let mean_expanded = mean.insert_axis(Axis(2));
        let centered = hidden_states - &mean_expanded;
        let variance = centered.mapv(|v| v * v).sum_axis(Axis(2)) / hidden;
        let inv_std = variance.mapv(|v| 1.0 / (v + self.eps).sqrt()).insert_axis(Axis(2));

        centered * &inv_std * &self.weight + &self.bias
    }
}
