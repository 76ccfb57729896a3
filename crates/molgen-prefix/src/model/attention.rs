//! Multi-head attention with externally supplied keys and values.
//!
//! Callers own key/value assembly (prompt prefixes, KV caches, projected
//! encoder states), so the same block serves encoder self-attention, decoder
//! self-attention and cross-attention.

use anyhow::{anyhow, Result};
use ndarray::parallel::prelude::*;
use ndarray::{concatenate, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};

use crate::linear_layer::LinearLayer;
use crate::weights::{Init, ParamStore};

// Large negative value for masking (avoids NaN in softmax)
pub const MASK_VALUE: f32 = -1e9;

/// Masks key positions where `mask == 0.0`.
///
/// `mask` is `[batch, keys]`; scores are `[batch, heads, queries, keys]`.
/// Any other mask shape is an error.
pub fn apply_attention_mask(mut scores: Array4<f32>, mask: &Array2<f32>) -> Result<Array4<f32>> {
    let (batch, heads, seq_q, seq_k) = scores.dim();
    if mask.dim() != (batch, seq_k) {
        return Err(anyhow!(
            "attention mask {:?} does not match scores {:?}",
            mask.dim(),
            scores.dim()
        ));
    }

    let mask_expanded = mask.view().insert_axis(Axis(1)).insert_axis(Axis(1));
    let broadcast_mask = mask_expanded
        .broadcast((batch, heads, seq_q, seq_k))
        .ok_or_else(|| anyhow!("cannot broadcast attention mask {:?}", mask.dim()))?;
    Zip::from(&mut scores).and(&broadcast_mask).par_for_each(|s, &m| {
        if m == 0.0 {
            *s = MASK_VALUE;
        }
    });
    Ok(scores)
}

fn softmax_last_axis(scores: &mut Array4<f32>) {
    scores
        .lanes_mut(Axis(3))
        .into_iter()
        .for_each(|mut row| {
            let max = row.fold(MASK_VALUE, |a, &b| a.max(b));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        });
}

/// `[B, H, M, K] x [B, H, K, N] -> [B, H, M, N]`
pub fn batched_matmul(a: &ArrayView4<f32>, b: &ArrayView4<f32>) -> Array4<f32> {
    let (batch, heads, m, _) = a.dim();
    let n = b.dim().3;
    let mut out = Array4::<f32>::zeros((batch, heads, m, n));

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(a.axis_iter(Axis(0)).into_par_iter())
        .zip(b.axis_iter(Axis(0)).into_par_iter())
        .for_each(|((mut out_b, a_b), b_b)| {
            for h in 0..heads {
                out_b
                    .index_axis_mut(Axis(0), h)
                    .assign(&a_b.index_axis(Axis(0), h).dot(&b_b.index_axis(Axis(0), h)));
            }
        });
    out
}

/// Concatenates key/value blocks along the sequence axis.
pub fn concat_seq(first: &ArrayView4<f32>, second: &ArrayView4<f32>) -> Result<Array4<f32>> {
    Ok(concatenate(Axis(2), &[first.view(), second.view()])?)
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
    pub out_proj: LinearLayer,
    pub num_heads: usize,
    pub head_dim: usize,
    scaling: f32,
}

impl MultiHeadAttention {
    pub fn new(
        num_heads: usize,
        q_proj: LinearLayer,
        k_proj: LinearLayer,
        v_proj: LinearLayer,
        out_proj: LinearLayer,
    ) -> Self {
        let head_dim = q_proj.out_features() / num_heads.max(1);
        Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim,
            scaling: (head_dim as f32).powf(-0.5),
        }
    }

    /// Loads `{prefix}.{q,k,v,out}_proj.{weight,bias}`.
    pub fn from_store(store: &mut ParamStore, prefix: &str, d_model: usize, num_heads: usize, std: f32) -> Result<Self> {
        let mut proj = |name: &str| {
            LinearLayer::from_store(
                store,
                &format!("{}.{}", prefix, name),
                d_model,
                d_model,
                Init::Normal { std },
                Some(Init::Zeros),
            )
        };
        let q = proj("q_proj")?;
        let k = proj("k_proj")?;
        let v = proj("v_proj")?;
        let o = proj("out_proj")?;
        Ok(Self::new(num_heads, q, k, v, o))
    }

    fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// `[B*S, H*D] -> [B, H, S, D]`
    fn split_heads(&self, x: Array2<f32>, batch: usize, seq: usize) -> Result<Array4<f32>> {
        Ok(x
            .into_shape_with_order((batch, seq, self.num_heads, self.head_dim))?
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned())
    }

    /// Projects `states` into key and value heads, each `[B, H, S, D]`.
    pub fn project_kv(&self, states: &ArrayView3<f32>) -> Result<(Array4<f32>, Array4<f32>)> {
        let (batch, seq, hidden) = states.dim();
        let flat = states.to_shape((batch * seq, hidden))?;
        let k = self.split_heads(self.k_proj.matmul(&flat.view()), batch, seq)?;
        let v = self.split_heads(self.v_proj.matmul(&flat.view()), batch, seq)?;
        Ok((k, v))
    }

    /// Attends from `hidden` (`[B, S, hidden]`) over the given keys/values.
    ///
    /// `key_mask` is `[B, keys]` with `1.0` for attendable positions.
    pub fn attend(
        &self,
        hidden: &ArrayView3<f32>,
        keys: &ArrayView4<f32>,
        values: &ArrayView4<f32>,
        key_mask: Option<&Array2<f32>>,
    ) -> Result<Array3<f32>> {
        let (batch, seq, hidden_size) = hidden.dim();
        let flat = hidden.to_shape((batch * seq, hidden_size))?;

        let mut q = self.q_proj.matmul(&flat.view());
        q.mapv_inplace(|x| x * self.scaling);
        let q_heads = self.split_heads(q, batch, seq)?;

        let k_t = keys.view().permuted_axes([0, 1, 3, 2]);
        let mut scores = batched_matmul(&q_heads.view(), &k_t);
        if let Some(mask) = key_mask {
            scores = apply_attention_mask(scores, mask)?;
        }
        softmax_last_axis(&mut scores);

        let context = batched_matmul(&scores.view(), values);
        let context_flat = context
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch * seq, self.hidden_size()))?;

        let output = self.out_proj.matmul(&context_flat.view());
        Ok(output.into_shape_with_order((batch, seq, hidden_size))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn identity_attention(dim: usize, heads: usize) -> MultiHeadAttention {
        let eye = || LinearLayer::new_f32(Array2::eye(dim), Some(Array1::zeros(dim))).unwrap();
        MultiHeadAttention::new(heads, eye(), eye(), eye(), eye())
    }

    #[test]
    fn test_mask_excludes_positions() {
        let scores = Array4::<f32>::zeros((1, 1, 1, 3));
        let masked = apply_attention_mask(scores, &array![[1.0, 0.0, 1.0]]).unwrap();
        assert_eq!(masked[[0, 0, 0, 1]], MASK_VALUE);
        assert_eq!(masked[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_mask_shape_mismatch_is_an_error() {
        let scores = Array4::<f32>::zeros((2, 1, 1, 3));
        assert!(apply_attention_mask(scores.clone(), &array![[1.0, 1.0, 1.0]]).is_err());
        assert!(apply_attention_mask(scores, &Array2::ones((2, 4))).is_err());
    }

    #[test]
    fn test_attend_rejects_mismatched_mask() {
        let attn = identity_attention(2, 1);
        let hidden = Array3::from_shape_vec((1, 1, 2), vec![1.0, 1.0]).unwrap();
        let memory = Array3::from_shape_vec((1, 2, 2), vec![5.0, 5.0, -3.0, 7.0]).unwrap();
        let (k, v) = attn.project_kv(&memory.view()).unwrap();
        let result = attn.attend(&hidden.view(), &k.view(), &v.view(), Some(&array![[1.0, 1.0, 1.0]]));
        assert!(result.is_err());
    }

    #[test]
    fn test_single_key_returns_its_value() {
        let attn = identity_attention(4, 2);
        let hidden = Array3::from_shape_vec((1, 1, 4), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let memory = Array3::from_shape_vec((1, 1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let (k, v) = attn.project_kv(&memory.view()).unwrap();
        let out = attn.attend(&hidden.view(), &k.view(), &v.view(), None).unwrap();
        for (a, b) in out.iter().zip(memory.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_masked_key_is_ignored() {
        let attn = identity_attention(2, 1);
        let hidden = Array3::from_shape_vec((1, 1, 2), vec![1.0, 1.0]).unwrap();
        let memory = Array3::from_shape_vec((1, 2, 2), vec![5.0, 5.0, -3.0, 7.0]).unwrap();
        let (k, v) = attn.project_kv(&memory.view()).unwrap();
        let out = attn
            .attend(&hidden.view(), &k.view(), &v.view(), Some(&array![[0.0, 1.0]]))
            .unwrap();
        assert!((out[[0, 0, 0]] + 3.0).abs() < 1e-5);
        assert!((out[[0, 0, 1]] - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_concat_seq() {
        let a = Array4::<f32>::zeros((2, 3, 4, 5));
        let b = Array4::<f32>::ones((2, 3, 1, 5));
        let c = concat_seq(&a.view(), &b.view()).unwrap();
        assert_eq!(c.dim(), (2, 3, 5, 5));
        assert_eq!(c[[1, 2, 4, 0]], 1.0);
    }
}
