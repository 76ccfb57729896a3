use anyhow::Result;
use ndarray::{Array3, ArrayView3};

use crate::activations::{apply_activation_2d_mut, Activation};
use crate::linear_layer::LinearLayer;
use crate::weights::{Init, ParamStore};

/// `Linear(d_model -> mid_dim) -> tanh -> Linear(mid_dim -> out_dim)`.
///
/// No normalisation and no residual.
#[derive(Debug, Clone)]
pub struct PrefixProjector {
    pub fc1: LinearLayer,
    pub fc2: LinearLayer,
}

impl PrefixProjector {
    pub fn new(fc1: LinearLayer, fc2: LinearLayer) -> Self {
        Self { fc1, fc2 }
    }

    /// Loads `{prefix}.fc1.*` and `{prefix}.fc2.*`. Missing tensors get the
    /// usual `U(-1/sqrt(in), 1/sqrt(in))` linear initialisation.
    pub fn from_store(
        store: &mut ParamStore,
        prefix: &str,
        d_model: usize,
        mid_dim: usize,
        out_dim: usize,
    ) -> Result<Self> {
        let fc1 = Self::linear(store, &format!("{}.fc1", prefix), d_model, mid_dim)?;
        let fc2 = Self::linear(store, &format!("{}.fc2", prefix), mid_dim, out_dim)?;
        Ok(Self::new(fc1, fc2))
    }

    fn linear(store: &mut ParamStore, name: &str, fan_in: usize, fan_out: usize) -> Result<LinearLayer> {
        let init = Init::Uniform {
            bound: 1.0 / (fan_in as f32).sqrt(),
        };
        LinearLayer::from_store(store, name, fan_in, fan_out, init, Some(init))
    }

    pub fn out_dim(&self) -> usize {
        self.fc2.out_features()
    }

    /// `(batch, len, d_model) -> (batch, len, out_dim)`.
    pub fn forward(&self, input: &ArrayView3<f32>) -> Result<Array3<f32>> {
        let (batch, len, dim) = input.dim();
        let flat = input.to_shape((batch * len, dim))?;

        let mut hidden = self.fc1.matmul(&flat.view());
        apply_activation_2d_mut(&mut hidden.view_mut(), Activation::Tanh);
        let out = self.fc2.matmul(&hidden.view());

        Ok(out.into_shape_with_order((batch, len, self.out_dim()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    #[test]
    fn test_forward_is_linear_tanh_linear() {
        let fc1 = LinearLayer::new_f32(array![[1.0, 0.0], [0.0, 1.0]], None).unwrap();
        let fc2 = LinearLayer::new_f32(array![[1.0, 1.0]], Some(array![0.5])).unwrap();
        let proj = PrefixProjector::new(fc1, fc2);

        let x = Array3::from_shape_vec((1, 1, 2), vec![0.3, -2.0]).unwrap();
        let y = proj.forward(&x.view()).unwrap();
        let expected = 0.3f32.tanh() + (-2.0f32).tanh() + 0.5;
        assert!((y[[0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_output_width() {
        let fc1 = LinearLayer::new_f32(Array2::zeros((8, 16)), Some(Array1::zeros(8))).unwrap();
        let fc2 = LinearLayer::new_f32(Array2::zeros((64, 8)), Some(Array1::zeros(64))).unwrap();
        let proj = PrefixProjector::new(fc1, fc2);
        let y = proj.forward(&Array3::zeros((3, 4, 16)).view()).unwrap();
        assert_eq!(y.dim(), (3, 4, 64));
    }
}
