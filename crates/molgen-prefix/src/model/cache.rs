//! Decoder state carried between generation steps.

use anyhow::{anyhow, Result};
use ndarray::{concatenate, Array2, Array4, Axis};

use super::attention::concat_seq;

/// Keys and values for one layer, `[batch, heads, len, head_dim]`.
#[derive(Debug, Clone)]
pub struct LayerKv {
    pub key: Array4<f32>,
    pub value: Array4<f32>,
}

impl LayerKv {
    pub fn new(key: Array4<f32>, value: Array4<f32>) -> Self {
        Self { key, value }
    }

    pub fn len(&self) -> usize {
        self.key.dim().2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            key: self.key.select(Axis(0), indices),
            value: self.value.select(Axis(0), indices),
        }
    }
}

/// Everything the decoder needs for the next step.
///
/// Self-attention caches start out holding the decoder prompt; each step
/// appends one position. Cross-attention keys/values (prompt followed by the
/// projected encoder states) are computed once and only reordered.
#[derive(Debug, Clone)]
pub struct DecoderState {
    pub self_kv: Vec<LayerKv>,
    pub cross_kv: Vec<LayerKv>,
    /// `[batch, prompt + generated]`, `1.0` attendable.
    pub self_mask: Array2<f32>,
    /// `[batch, prompt + source]`, `1.0` attendable.
    pub cross_mask: Array2<f32>,
    /// Number of decoder positions already processed.
    pub step: usize,
}

impl DecoderState {
    pub fn batch_size(&self) -> usize {
        self.self_mask.nrows()
    }

    /// Appends freshly projected keys/values for `layer`.
    pub fn append(&mut self, layer: usize, key: &Array4<f32>, value: &Array4<f32>) -> Result<()> {
        let kv = self
            .self_kv
            .get_mut(layer)
            .ok_or_else(|| anyhow!("layer index {} out of bounds", layer))?;
        kv.key = concat_seq(&kv.key.view(), &key.view())?;
        kv.value = concat_seq(&kv.value.view(), &value.view())?;
        Ok(())
    }

    /// Extends the self-attention mask by one attendable column.
    pub fn advance(&mut self) -> Result<()> {
        let ones = Array2::<f32>::ones((self.batch_size(), 1));
        self.self_mask = concatenate(Axis(1), &[self.self_mask.view(), ones.view()])?;
        self.step += 1;
        Ok(())
    }

    /// Reorders every cached row, e.g. after beam selection.
    pub fn reorder(&mut self, indices: &[usize]) -> Result<()> {
        let batch = self.batch_size();
        if let Some(&bad) = indices.iter().find(|&&i| i >= batch) {
            return Err(anyhow!("reorder index {} out of range for batch {}", bad, batch));
        }
        self.self_kv = self.self_kv.iter().map(|kv| kv.select(indices)).collect();
        self.cross_kv = self.cross_kv.iter().map(|kv| kv.select(indices)).collect();
        self.self_mask = self.self_mask.select(Axis(0), indices);
        self.cross_mask = self.cross_mask.select(Axis(0), indices);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn state(batch: usize) -> DecoderState {
        let key = Array4::from_shape_fn((batch, 1, 2, 1), |(b, _, _, _)| b as f32);
        DecoderState {
            self_kv: vec![LayerKv::new(key.clone(), key.clone())],
            cross_kv: vec![LayerKv::new(key.clone(), key)],
            self_mask: Array2::ones((batch, 2)),
            cross_mask: Array2::ones((batch, 2)),
            step: 0,
        }
    }

    #[test]
    fn test_append_and_advance() {
        let mut s = state(2);
        let new = Array4::from_elem((2, 1, 1, 1), 9.0);
        s.append(0, &new, &new).unwrap();
        s.advance().unwrap();
        assert_eq!(s.self_kv[0].len(), 3);
        assert_eq!(s.self_mask.dim(), (2, 3));
        assert_eq!(s.step, 1);
        assert!(s.append(5, &new, &new).is_err());
    }

    #[test]
    fn test_reorder_selects_rows() {
        let mut s = state(3);
        s.reorder(&[2, 2, 0]).unwrap();
        assert_eq!(s.self_kv[0].key[[0, 0, 0, 0]], 2.0);
        assert_eq!(s.cross_kv[0].value[[1, 0, 1, 0]], 2.0);
        assert_eq!(s.self_kv[0].key[[2, 0, 0, 0]], 0.0);
        assert!(s.reorder(&[3]).is_err());
    }
}
