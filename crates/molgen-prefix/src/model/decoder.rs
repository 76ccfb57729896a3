use anyhow::{anyhow, Result};
use ndarray::{concatenate, Array2, Array3, Axis};

use super::attention::{concat_seq, MultiHeadAttention};
use super::cache::{DecoderState, LayerKv};
use super::config::{BartConfig, POSITION_OFFSET};
use super::encoder::{embed_tokens, positions, FeedForward};
use crate::normalization::LayerNorm;
use crate::prefix::LayerPromptSlice;
use crate::weights::{Init, ParamStore};

#[derive(Debug, Clone)]
pub struct BartDecoderLayer {
    pub self_attn: MultiHeadAttention,
    pub self_attn_layer_norm: LayerNorm,
    pub encoder_attn: MultiHeadAttention,
    pub encoder_attn_layer_norm: LayerNorm,
    pub ffn: FeedForward,
    pub final_layer_norm: LayerNorm,
}

impl BartDecoderLayer {
    pub fn from_store(store: &mut ParamStore, prefix: &str, config: &BartConfig) -> Result<Self> {
        let d = config.d_model;
        let heads = config.decoder_attention_heads;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::from_store(store, &format!("{}.self_attn", prefix), d, heads, config.init_std)?,
            self_attn_layer_norm: LayerNorm::from_store(store, &format!("{}.self_attn_layer_norm", prefix), d, eps)?,
            encoder_attn: MultiHeadAttention::from_store(
                store,
                &format!("{}.encoder_attn", prefix),
                d,
                heads,
                config.init_std,
            )?,
            encoder_attn_layer_norm: LayerNorm::from_store(
                store,
                &format!("{}.encoder_attn_layer_norm", prefix),
                d,
                eps,
            )?,
            ffn: FeedForward::from_store(store, prefix, d, config.decoder_ffn_dim, config)?,
            final_layer_norm: LayerNorm::from_store(store, &format!("{}.final_layer_norm", prefix), d, eps)?,
        })
    }

    /// Cross-attention keys/values: the cross prompt followed by the projected encoder states.
    pub fn cross_kv(&self, encoder_states: &Array3<f32>, prompt: &LayerPromptSlice) -> Result<LayerKv> {
        let (k, v) = self.encoder_attn.project_kv(&encoder_states.view())?;
        Ok(LayerKv::new(
            concat_seq(&prompt.prev_key.view(), &k.view())?,
            concat_seq(&prompt.prev_value.view(), &v.view())?,
        ))
    }

    /// One post-norm decoder step for layer `index`. Appends to the self-attention cache.
    pub fn forward_step(&self, index: usize, hidden: &Array3<f32>, state: &mut DecoderState) -> Result<Array3<f32>> {
        let (k, v) = self.self_attn.project_kv(&hidden.view())?;
        state.append(index, &k, &v)?;

        let self_kv = &state.self_kv[index];
        let step_mask = concatenate(
            Axis(1),
            &[state.self_mask.view(), Array2::<f32>::ones((hidden.dim().0, 1)).view()],
        )?;
        let attn = self
            .self_attn
            .attend(&hidden.view(), &self_kv.key.view(), &self_kv.value.view(), Some(&step_mask))?;
        let hidden = self.self_attn_layer_norm.forward(&(hidden + &attn).view());

        let cross = &state.cross_kv[index];
        let attn = self.encoder_attn.attend(
            &hidden.view(),
            &cross.key.view(),
            &cross.value.view(),
            Some(&state.cross_mask),
        )?;
        let hidden = self.encoder_attn_layer_norm.forward(&(&hidden + &attn).view());

        let ff = self.ffn.forward(&hidden)?;
        Ok(self.final_layer_norm.forward(&(&hidden + &ff).view()))
    }
}

#[derive(Debug, Clone)]
pub struct BartDecoder {
    pub embed_positions: Array2<f32>,
    pub layernorm_embedding: LayerNorm,
    pub layers: Vec<BartDecoderLayer>,
    embed_scale: f32,
}

impl BartDecoder {
    pub fn from_store(store: &mut ParamStore, config: &BartConfig) -> Result<Self> {
        let d = config.d_model;
        let embed_positions = store.array2(
            "model.decoder.embed_positions.weight",
            (config.max_position_embeddings + POSITION_OFFSET, d),
            Init::Normal { std: config.init_std },
        )?;
        let layernorm_embedding =
            LayerNorm::from_store(store, "model.decoder.layernorm_embedding", d, config.layer_norm_eps)?;
        let layers = (0..config.decoder_layers)
            .map(|i| BartDecoderLayer::from_store(store, &format!("model.decoder.layers.{}", i), config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_positions,
            layernorm_embedding,
            layers,
            embed_scale: config.embed_scale(),
        })
    }

    /// Builds the initial state: self caches seeded with the decoder prompts,
    /// cross caches from the cross prompts and the (expanded) encoder states.
    pub fn init_state(
        &self,
        encoder_states: &Array3<f32>,
        encoder_mask: &Array2<f32>,
        decoder_prompts: &[&LayerPromptSlice],
        cross_prompts: &[&LayerPromptSlice],
    ) -> Result<DecoderState> {
        if decoder_prompts.len() != self.layers.len() || cross_prompts.len() != self.layers.len() {
            return Err(anyhow!(
                "decoder has {} layers but received {} decoder / {} cross prompts",
                self.layers.len(),
                decoder_prompts.len(),
                cross_prompts.len()
            ));
        }
        let batch = encoder_states.dim().0;
        for prompt in decoder_prompts.iter().chain(cross_prompts) {
            if prompt.batch() != batch {
                return Err(anyhow!(
                    "decoder prompt batch {} does not match expanded batch {}",
                    prompt.batch(),
                    batch
                ));
            }
        }

        let self_kv = decoder_prompts
            .iter()
            .map(|p| LayerKv::new(p.prev_key.clone(), p.prev_value.clone()))
            .collect();
        let cross_kv = self
            .layers
            .iter()
            .zip(cross_prompts)
            .map(|(layer, prompt)| layer.cross_kv(encoder_states, prompt))
            .collect::<Result<Vec<_>>>()?;

        let (first_decoder, first_cross) = decoder_prompts
            .first()
            .zip(cross_prompts.first())
            .ok_or_else(|| anyhow!("decoder has no layers"))?;
        let self_mask = first_decoder.attention_mask();
        let cross_mask = concatenate(Axis(1), &[first_cross.attention_mask().view(), encoder_mask.view()])?;

        Ok(DecoderState {
            self_kv,
            cross_kv,
            self_mask,
            cross_mask,
            step: 0,
        })
    }

    /// Runs one token per row through the stack and returns the final hidden states `[batch, 1, d_model]`.
    pub fn forward_step(&self, shared: &Array2<f32>, tokens: &[u32], state: &mut DecoderState) -> Result<Array3<f32>> {
        let batch = state.batch_size();
        if tokens.len() != batch {
            return Err(anyhow!("expected {} decoder tokens, got {}", batch, tokens.len()));
        }
        let ids = Array2::from_shape_vec((batch, 1), tokens.to_vec())?;
        let embedded = embed_tokens(shared, &ids, self.embed_scale)?;
        let pos = positions(&self.embed_positions, state.step, 1)?;
        let mut hidden = self.layernorm_embedding.forward(&(embedded + &pos).view());

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward_step(i, &hidden, state)?;
        }
        state.advance()?;
        Ok(hidden)
    }
}
