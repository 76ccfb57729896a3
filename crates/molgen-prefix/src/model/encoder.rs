use anyhow::{anyhow, Context, Result};
use ndarray::{concatenate, Array2, Array3, Axis};

use super::attention::{concat_seq, MultiHeadAttention};
use super::config::{BartConfig, POSITION_OFFSET};
use crate::activations::{apply_activation_2d_mut, Activation};
use crate::linear_layer::LinearLayer;
use crate::normalization::LayerNorm;
use crate::prefix::LayerPromptSlice;
use crate::weights::{Init, ParamStore};

/// Position-wise feed-forward block shared by encoder and decoder layers.
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub fc1: LinearLayer,
    pub fc2: LinearLayer,
    pub activation: Activation,
}

impl FeedForward {
    pub fn from_store(store: &mut ParamStore, prefix: &str, d_model: usize, ffn_dim: usize, config: &BartConfig) -> Result<Self> {
        let init = Init::Normal { std: config.init_std };
        Ok(Self {
            fc1: LinearLayer::from_store(store, &format!("{}.fc1", prefix), d_model, ffn_dim, init, Some(Init::Zeros))?,
            fc2: LinearLayer::from_store(store, &format!("{}.fc2", prefix), ffn_dim, d_model, init, Some(Init::Zeros))?,
            activation: config.activation,
        })
    }

    pub fn forward(&self, hidden: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq, dim) = hidden.dim();
        let flat = hidden.to_shape((batch * seq, dim))?;
        let mut inner = self.fc1.matmul(&flat.view());
        apply_activation_2d_mut(&mut inner.view_mut(), self.activation);
        let out = self.fc2.matmul(&inner.view());
        Ok(out.into_shape_with_order((batch, seq, dim))?)
    }
}

/// Looks up learned positions `start..start + len` (offset by two rows).
pub fn positions(table: &Array2<f32>, start: usize, len: usize) -> Result<Array2<f32>> {
    let first = start + POSITION_OFFSET;
    if first + len > table.nrows() {
        return Err(anyhow!(
            "position {} exceeds the {} learned positions",
            start + len,
            table.nrows().saturating_sub(POSITION_OFFSET)
        ));
    }
    Ok(table.slice(ndarray::s![first..first + len, ..]).to_owned())
}

/// Gathers token embeddings: `[batch, seq] -> [batch, seq, d_model]`.
pub fn embed_tokens(shared: &Array2<f32>, ids: &Array2<u32>, scale: f32) -> Result<Array3<f32>> {
    let (batch, seq) = ids.dim();
    let vocab = shared.nrows();
    let flat: Vec<usize> = ids.iter().map(|&id| id as usize).collect();
    if let Some(&bad) = flat.iter().find(|&&id| id >= vocab) {
        return Err(anyhow!("token id {} is outside the vocabulary ({})", bad, vocab));
    }
    let mut rows = shared.select(Axis(0), &flat);
    if scale != 1.0 {
        rows.mapv_inplace(|v| v * scale);
    }
    Ok(rows.into_shape_with_order((batch, seq, shared.ncols()))?)
}

#[derive(Debug, Clone)]
pub struct BartEncoderLayer {
    pub self_attn: MultiHeadAttention,
    pub self_attn_layer_norm: LayerNorm,
    pub ffn: FeedForward,
    pub final_layer_norm: LayerNorm,
}

impl BartEncoderLayer {
    pub fn from_store(store: &mut ParamStore, prefix: &str, config: &BartConfig) -> Result<Self> {
        let d = config.d_model;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::from_store(
                store,
                &format!("{}.self_attn", prefix),
                d,
                config.encoder_attention_heads,
                config.init_std,
            )?,
            self_attn_layer_norm: LayerNorm::from_store(store, &format!("{}.self_attn_layer_norm", prefix), d, eps)?,
            ffn: FeedForward::from_store(store, prefix, d, config.encoder_ffn_dim, config)?,
            final_layer_norm: LayerNorm::from_store(store, &format!("{}.final_layer_norm", prefix), d, eps)?,
        })
    }

    /// Post-norm layer. The prompt's keys/values are prepended to the
    /// projected sequence and `mask` already covers `[prompt, tokens]`.
    pub fn forward(&self, hidden: &Array3<f32>, mask: &Array2<f32>, prompt: &LayerPromptSlice) -> Result<Array3<f32>> {
        let (k, v) = self.self_attn.project_kv(&hidden.view())?;
        let keys = concat_seq(&prompt.prev_key.view(), &k.view())?;
        let values = concat_seq(&prompt.prev_value.view(), &v.view())?;

        let attn = self.self_attn.attend(&hidden.view(), &keys.view(), &values.view(), Some(mask))?;
        let hidden = self.self_attn_layer_norm.forward(&(hidden + &attn).view());

        let ff = self.ffn.forward(&hidden)?;
        Ok(self.final_layer_norm.forward(&(&hidden + &ff).view()))
    }
}

#[derive(Debug, Clone)]
pub struct BartEncoder {
    pub embed_positions: Array2<f32>,
    pub layernorm_embedding: LayerNorm,
    pub layers: Vec<BartEncoderLayer>,
    embed_scale: f32,
}

impl BartEncoder {
    pub fn from_store(store: &mut ParamStore, config: &BartConfig) -> Result<Self> {
        let d = config.d_model;
        let embed_positions = store.array2(
            "model.encoder.embed_positions.weight",
            (config.max_position_embeddings + POSITION_OFFSET, d),
            Init::Normal { std: config.init_std },
        )?;
        let layernorm_embedding =
            LayerNorm::from_store(store, "model.encoder.layernorm_embedding", d, config.layer_norm_eps)?;
        let layers = (0..config.encoder_layers)
            .map(|i| BartEncoderLayer::from_store(store, &format!("model.encoder.layers.{}", i), config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_positions,
            layernorm_embedding,
            layers,
            embed_scale: config.embed_scale(),
        })
    }

    /// Encodes `input_ids` (`[batch, seq]`) with one encoder prompt per layer.
    pub fn forward(
        &self,
        shared: &Array2<f32>,
        input_ids: &Array2<u32>,
        attention_mask: &Array2<f32>,
        prompts: &[&LayerPromptSlice],
    ) -> Result<Array3<f32>> {
        if prompts.len() != self.layers.len() {
            return Err(anyhow!(
                "encoder has {} layers but received {} prompts",
                self.layers.len(),
                prompts.len()
            ));
        }
        let seq = input_ids.ncols();
        let embedded = embed_tokens(shared, input_ids, self.embed_scale)?;
        let pos = positions(&self.embed_positions, 0, seq)?;
        let mut hidden = self.layernorm_embedding.forward(&(embedded + &pos).view());

        for (i, (layer, prompt)) in self.layers.iter().zip(prompts).enumerate() {
            let mask = concatenate(Axis(1), &[prompt.attention_mask().view(), attention_mask.view()])
                .with_context(|| format!("encoder layer {}: prompt batch does not match input batch", i))?;
            hidden = layer.forward(&hidden, &mask, prompt)?;
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_positions_are_offset() {
        let table = Array2::from_shape_fn((6, 1), |(i, _)| i as f32);
        let pos = positions(&table, 0, 3).unwrap();
        assert_eq!(pos, array![[2.0], [3.0], [4.0]]);
        assert!(positions(&table, 3, 2).is_err());
    }

    #[test]
    fn test_embed_tokens_rejects_out_of_vocab() {
        let shared = array![[1.0, 1.0], [2.0, 2.0]];
        let ids = array![[1u32, 0]];
        let out = embed_tokens(&shared, &ids, 2.0).unwrap();
        assert_eq!(out[[0, 0, 0]], 4.0);
        assert!(embed_tokens(&shared, &array![[5u32]], 1.0).is_err());
    }
}
