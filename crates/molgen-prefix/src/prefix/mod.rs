//! Prefix conditioning.
//!
//! Three learned prefix paths (decoder self-attention, decoder cross-attention
//! and encoder self-attention) each map the fixed position sequence
//! `[0, preseqlen)` through an embedding table and a projector. The
//! [`PromptAssembler`] reshapes the projector outputs into per-layer key/value
//! pairs and packs them into a [`PromptBundle`], the only thing the base model
//! sees of the prefix.
//!
//! Layout contract with the consumer: each key/value is
//! `(batch, num_heads, preseqlen, head_dim)`, layer `i` uses rows `2i` (key)
//! and `2i + 1` (value) of the projected width, and padding masks are
//! `(batch, preseqlen)` with `false` meaning "attend".

mod assembler;
mod embedding;
mod projector;

#[cfg(test)]
mod tests;

pub use assembler::{PrefixPath, PromptAssembler};
pub use embedding::PrefixEmbedding;
pub use projector::PrefixProjector;

use ndarray::{Array2, Array4};

use crate::error::PrefixError;

/// The three places a prompt is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Decoder,
    Cross,
    Encoder,
}

impl PromptKind {
    pub const ALL: [PromptKind; 3] = [PromptKind::Decoder, PromptKind::Cross, PromptKind::Encoder];

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Decoder => "decoder",
            PromptKind::Cross => "cross",
            PromptKind::Encoder => "encoder",
        }
    }

    /// Checkpoint key prefix for this path's parameters.
    pub fn param_prefix(&self) -> String {
        format!("prefix.{}", self.as_str())
    }
}

/// Dimensions shared by the prefix module and the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixGeometry {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub d_model: usize,
    pub preseqlen: usize,
    pub mid_dim: usize,
}

impl PrefixGeometry {
    /// Builds the geometry, deriving `head_dim` from `d_model / num_heads`.
    pub fn new(
        num_layers: usize,
        num_heads: usize,
        d_model: usize,
        preseqlen: usize,
        mid_dim: usize,
    ) -> Result<Self, PrefixError> {
        let head_dim = if num_heads == 0 { 0 } else { d_model / num_heads };
        let geometry = Self {
            num_layers,
            num_heads,
            head_dim,
            d_model,
            preseqlen,
            mid_dim,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<(), PrefixError> {
        if self.num_heads == 0 || self.head_dim == 0 || self.num_heads * self.head_dim != self.d_model {
            return Err(PrefixError::HeadGeometry {
                d_model: self.d_model,
                num_heads: self.num_heads,
                head_dim: self.head_dim,
            });
        }
        if self.preseqlen == 0 {
            return Err(PrefixError::EmptyPrefix);
        }
        Ok(())
    }

    /// Width of one projected prefix position: `num_layers * 2 * num_heads * head_dim`.
    pub fn projected_width(&self) -> usize {
        self.num_layers * 2 * self.num_heads * self.head_dim
    }
}

/// Batch sizes on either side of the encoder/decoder boundary.
///
/// The encoder runs once per input row, so its prompts have `batch_size`
/// rows. Decoding expands every input into `sample_multiplier` hypotheses
/// (beams or samples), so decoder and cross-attention prompts have
/// `batch_size * sample_multiplier` rows, input-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    pub batch_size: usize,
    pub sample_multiplier: usize,
}

impl BatchLayout {
    pub fn new(batch_size: usize, sample_multiplier: usize) -> Self {
        Self {
            batch_size,
            sample_multiplier,
        }
    }

    pub fn encoder_batch(&self) -> usize {
        self.batch_size
    }

    pub fn decoder_batch(&self) -> usize {
        self.batch_size * self.sample_multiplier
    }
}

/// One injected key/value pair with its padding mask.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPromptSlice {
    /// `(batch, num_heads, preseqlen, head_dim)`
    pub prev_key: Array4<f32>,
    /// `(batch, num_heads, preseqlen, head_dim)`
    pub prev_value: Array4<f32>,
    /// `(batch, preseqlen)`, `true` marks a padded position.
    pub prev_key_padding_mask: Array2<bool>,
}

impl LayerPromptSlice {
    pub fn new(prev_key: Array4<f32>, prev_value: Array4<f32>) -> Self {
        let (batch, _, len, _) = prev_key.dim();
        Self {
            prev_key,
            prev_value,
            prev_key_padding_mask: Array2::from_elem((batch, len), false),
        }
    }

    pub fn batch(&self) -> usize {
        self.prev_key.dim().0
    }

    pub fn prompt_len(&self) -> usize {
        self.prev_key.dim().2
    }

    /// Attention mask for the prompt positions in the consumer's convention
    /// (`1.0` attendable, `0.0` masked).
    pub fn attention_mask(&self) -> Array2<f32> {
        self.prev_key_padding_mask.mapv(|pad| if pad { 0.0 } else { 1.0 })
    }
}

/// Prompts for one transformer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerPrompt {
    pub decoder_prompt: LayerPromptSlice,
    pub cross_attention_prompt: LayerPromptSlice,
    pub encoder_prompt: LayerPromptSlice,
}

impl LayerPrompt {
    pub fn slice(&self, kind: PromptKind) -> &LayerPromptSlice {
        match kind {
            PromptKind::Decoder => &self.decoder_prompt,
            PromptKind::Cross => &self.cross_attention_prompt,
            PromptKind::Encoder => &self.encoder_prompt,
        }
    }
}

/// Per-layer prompts handed to the base model, ordered by layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBundle {
    pub layout: BatchLayout,
    pub layers: Vec<LayerPrompt>,
}

impl PromptBundle {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&LayerPrompt> {
        self.layers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerPrompt> {
        self.layers.iter()
    }

    pub fn prompt_len(&self) -> usize {
        self.layers.first().map_or(0, |l| l.decoder_prompt.prompt_len())
    }

    /// Checks the bundle against a model's layer count and the batch layout.
    pub fn check(&self, num_layers: usize) -> Result<(), PrefixError> {
        if self.layers.len() != num_layers {
            return Err(PrefixError::LayerCount {
                expected: num_layers,
                actual: self.layers.len(),
            });
        }
        for layer in &self.layers {
            for kind in PromptKind::ALL {
                let expected = match kind {
                    PromptKind::Encoder => self.layout.encoder_batch(),
                    _ => self.layout.decoder_batch(),
                };
                let actual = layer.slice(kind).batch();
                if actual != expected {
                    return Err(PrefixError::PromptBatch {
                        path: kind.as_str(),
                        expected,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}
