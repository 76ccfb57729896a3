//! A CPU BART encoder-decoder that consumes prefix prompts.
//!
//! The prompts enter attention positionally: encoder layer `i` prepends
//! `bundle[i].encoder_prompt` to its keys/values, decoder layer `i` seeds its
//! self-attention cache with `bundle[i].decoder_prompt` and prepends
//! `bundle[i].cross_attention_prompt` to the projected encoder states.

mod attention;
mod cache;
mod config;
mod decoder;
mod encoder;


pub use attention::{apply_attention_mask, MultiHeadAttention, MASK_VALUE};
pub use cache::{DecoderState, LayerKv};
pub use config::{BartConfig, POSITION_OFFSET};
pub use decoder::{BartDecoder, BartDecoderLayer};
pub use encoder::{BartEncoder, BartEncoderLayer, FeedForward};

use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Array3, Axis};

use crate::prefix::{LayerPromptSlice, PromptBundle};
use crate::weights::{Init, ParamStore};

/// Encoder output at the encoder batch size.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// `[batch, seq, d_model]`
    pub hidden_states: Array3<f32>,
    /// `[batch, seq]`, `1.0` for real tokens.
    pub attention_mask: Array2<f32>,
}

impl EncoderOutput {
    /// Repeats every row `times` times, keeping rows of one input adjacent.
    pub fn repeat_interleave(&self, times: usize) -> Self {
        let batch = self.hidden_states.dim().0;
        let indices: Vec<usize> = (0..batch).flat_map(|b| std::iter::repeat(b).take(times)).collect();
        Self {
            hidden_states: self.hidden_states.select(Axis(0), &indices),
            attention_mask: self.attention_mask.select(Axis(0), &indices),
        }
    }
}

/// A sequence-to-sequence model conditioned by a [`PromptBundle`].
pub trait PromptConditionedModel: Send + Sync {
    fn config(&self) -> &BartConfig;

    /// Runs the encoder at `prompts.layout.encoder_batch()` rows.
    fn encode(&self, input_ids: &Array2<u32>, attention_mask: &Array2<f32>, prompts: &PromptBundle) -> Result<EncoderOutput>;

    /// Expands the encoder output to the decoder batch and builds the decoder state.
    fn start_decoding(&self, encoded: &EncoderOutput, prompts: &PromptBundle) -> Result<DecoderState>;

    /// Feeds one token per row and returns next-token logits `[batch, vocab]`.
    fn decode_step(&self, tokens: &[u32], state: &mut DecoderState) -> Result<Array2<f32>>;
}

#[derive(Debug, Clone)]
pub struct PrefixBart {
    config: BartConfig,
    pub shared: Array2<f32>,
    pub final_logits_bias: Array1<f32>,
    pub encoder: BartEncoder,
    pub decoder: BartDecoder,
}

impl PrefixBart {
    /// Builds the model from `model.*` parameters; anything missing is initialised.
    pub fn from_store(store: &mut ParamStore, config: BartConfig) -> Result<Self> {
        config.validate()?;
        let shared = store.array2(
            "model.shared.weight",
            (config.vocab_size, config.d_model),
            Init::Normal { std: config.init_std },
        )?;
        let final_logits_bias = store
            .array2("final_logits_bias", (1, config.vocab_size), Init::Zeros)?
            .index_axis_move(Axis(0), 0);
        let encoder = BartEncoder::from_store(store, &config)?;
        let decoder = BartDecoder::from_store(store, &config)?;

        log::info!(
            "built BART: d_model={} layers={}/{} heads={} vocab={}",
            config.d_model,
            config.encoder_layers,
            config.decoder_layers,
            config.decoder_attention_heads,
            config.vocab_size
        );
        Ok(Self {
            config,
            shared,
            final_logits_bias,
            encoder,
            decoder,
        })
    }

    fn check_bundle(&self, prompts: &PromptBundle) -> Result<()> {
        prompts.check(self.config.decoder_layers)?;
        let head_dim = self.config.head_dim();
        if let Some(layer) = prompts.layer(0) {
            let (_, heads, _, dim) = layer.decoder_prompt.prev_key.dim();
            if heads != self.config.decoder_attention_heads || dim != head_dim {
                return Err(anyhow!(
                    "prompt heads {}x{} do not match model heads {}x{}",
                    heads,
                    dim,
                    self.config.decoder_attention_heads,
                    head_dim
                ));
            }
        }
        Ok(())
    }

    fn lm_head(&self, hidden: &Array3<f32>) -> Result<Array2<f32>> {
        let (batch, seq, dim) = hidden.dim();
        let last = hidden.index_axis(Axis(1), seq.saturating_sub(1));
        if last.dim() != (batch, dim) {
            return Err(anyhow!("unexpected decoder output shape {:?}", hidden.dim()));
        }
        Ok(last.dot(&self.shared.t()) + &self.final_logits_bias)
    }
}

impl PromptConditionedModel for PrefixBart {
    fn config(&self) -> &BartConfig {
        &self.config
    }

    fn encode(&self, input_ids: &Array2<u32>, attention_mask: &Array2<f32>, prompts: &PromptBundle) -> Result<EncoderOutput> {
        self.check_bundle(prompts)?;
        if input_ids.dim() != attention_mask.dim() {
            return Err(anyhow!(
                "input ids {:?} and attention mask {:?} differ in shape",
                input_ids.dim(),
                attention_mask.dim()
            ));
        }
        if input_ids.nrows() != prompts.layout.encoder_batch() {
            return Err(anyhow!(
                "input batch {} does not match encoder prompt batch {}",
                input_ids.nrows(),
                prompts.layout.encoder_batch()
            ));
        }
        let encoder_prompts: Vec<&LayerPromptSlice> = prompts.iter().map(|l| &l.encoder_prompt).collect();
        let hidden_states = self.encoder.forward(&self.shared, input_ids, attention_mask, &encoder_prompts)?;
        Ok(EncoderOutput {
            hidden_states,
            attention_mask: attention_mask.clone(),
        })
    }

    fn start_decoding(&self, encoded: &EncoderOutput, prompts: &PromptBundle) -> Result<DecoderState> {
        self.check_bundle(prompts)?;
        let expanded = encoded.repeat_interleave(prompts.layout.sample_multiplier);
        let decoder_prompts: Vec<&LayerPromptSlice> = prompts.iter().map(|l| &l.decoder_prompt).collect();
        let cross_prompts: Vec<&LayerPromptSlice> = prompts.iter().map(|l| &l.cross_attention_prompt).collect();
        self.decoder.init_state(
            &expanded.hidden_states,
            &expanded.attention_mask,
            &decoder_prompts,
            &cross_prompts,
        )
    }

    fn decode_step(&self, tokens: &[u32], state: &mut DecoderState) -> Result<Array2<f32>> {
        let hidden = self.decoder.forward_step(&self.shared, tokens, state)?;
        self.lm_head(&hidden)
    }
}
