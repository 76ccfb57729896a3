use anyhow::Result;
use ndarray::{Array2, Array3, Axis};

use crate::weights::{Init, ParamStore};

/// A `preseqlen x d_model` lookup table indexed by prefix position.
#[derive(Debug, Clone)]
pub struct PrefixEmbedding {
    pub weight: Array2<f32>,
    positions: Vec<usize>,
}

impl PrefixEmbedding {
    pub fn new(weight: Array2<f32>) -> Self {
        let positions = (0..weight.nrows()).collect();
        Self { weight, positions }
    }

    /// Loads `{prefix}.weight`, falling back to `N(0, 1)` like a fresh embedding.
    pub fn from_store(store: &mut ParamStore, prefix: &str, preseqlen: usize, d_model: usize) -> Result<Self> {
        let weight = store.array2(
            &format!("{}.weight", prefix),
            (preseqlen, d_model),
            Init::Normal { std: 1.0 },
        )?;
        Ok(Self::new(weight))
    }

    pub fn preseqlen(&self) -> usize {
        self.positions.len()
    }

    pub fn d_model(&self) -> usize {
        self.weight.ncols()
    }

    /// Looks up every prefix position for each of `batch` rows: `(batch, preseqlen, d_model)`.
    pub fn forward(&self, batch: usize) -> Array3<f32> {
        let rows = self.weight.select(Axis(0), &self.positions);
        let (len, dim) = rows.dim();
        Array3::from_shape_fn((batch, len, dim), |(_, i, j)| rows[[i, j]])
    }
}
