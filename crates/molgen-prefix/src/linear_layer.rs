//! A CPU linear layer (`y = xW^T + b`).
//!
//! Weights are stored in the `[out_features, in_features]` layout used by
//! safetensors checkpoints, so `matmul` multiplies by the transpose.

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::weights::{Init, ParamStore};

#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new_f32(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.nrows() {
                return Err(anyhow!(
                    "bias length {} does not match out_features {}",
                    b.len(),
                    weight.nrows()
                ));
            }
        }
        Ok(Self { weight, bias })
    }

    /// Loads `{prefix}.weight` and `{prefix}.bias` from the store.
    pub fn from_store(
        store: &mut ParamStore,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        weight_init: Init,
        bias_init: Option<Init>,
    ) -> Result<Self> {
        let weight = store.array2(&format!("{}.weight", prefix), (out_features, in_features), weight_init)?;
        let bias = match bias_init {
            Some(init) => Some(store.array1(&format!("{}.bias", prefix), out_features, init)?),
            None => None,
        };
        Self::new_f32(weight, bias)
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `input` is `[tokens, in_features]`; returns `[tokens, out_features]`.
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = input.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            out += &bias.view().insert_axis(Axis(0));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_matmul_uses_out_in_layout() {
        let layer = LinearLayer::new_f32(
            array![[1.0, 0.0, 0.0], [0.0, 1.0, 1.0]],
            Some(array![0.5, -0.5]),
        )
        .unwrap();
        assert_eq!(layer.in_features(), 3);
        assert_eq!(layer.out_features(), 2);

        let out = layer.matmul(&array![[1.0, 2.0, 3.0]].view());
        assert_eq!(out, array![[1.5, 4.5]]);
    }

    #[test]
    fn test_bias_length_checked() {
        let result = LinearLayer::new_f32(Array2::zeros((2, 3)), Some(Array1::zeros(3)));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_store_without_bias() {
        let mut store = ParamStore::random(1);
        let layer =
            LinearLayer::from_store(&mut store, "proj", 4, 6, Init::Normal { std: 0.02 }, None).unwrap();
        assert!(layer.bias.is_none());
        assert_eq!(layer.weight.dim(), (6, 4));
    }
}
