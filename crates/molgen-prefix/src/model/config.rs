use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::prefix::PrefixGeometry;

fn default_d_model() -> usize {
    1024
}
fn default_layers() -> usize {
    12
}
fn default_heads() -> usize {
    16
}
fn default_ffn_dim() -> usize {
    4096
}
fn default_vocab_size() -> usize {
    50265
}
fn default_max_position_embeddings() -> usize {
    1024
}
fn default_layer_norm_eps() -> f32 {
    1e-5
}
fn default_init_std() -> f32 {
    0.02
}
fn default_pad() -> u32 {
    1
}
fn default_bos() -> u32 {
    0
}
fn default_eos() -> u32 {
    2
}
fn default_forced_eos() -> Option<u32> {
    Some(2)
}

/// Hyper-parameters of a BART-style encoder-decoder.
///
/// Missing fields take the `facebook/bart-large` defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BartConfig {
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_layers")]
    pub encoder_layers: usize,
    #[serde(default = "default_layers")]
    pub decoder_layers: usize,
    #[serde(default = "default_heads")]
    pub encoder_attention_heads: usize,
    #[serde(default = "default_heads")]
    pub decoder_attention_heads: usize,
    #[serde(default = "default_ffn_dim")]
    pub encoder_ffn_dim: usize,
    #[serde(default = "default_ffn_dim")]
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    #[serde(default)]
    pub scale_embedding: bool,
    #[serde(default = "default_layer_norm_eps", alias = "layer_norm_epsilon")]
    pub layer_norm_eps: f32,
    #[serde(default = "default_init_std")]
    pub init_std: f32,
    #[serde(default, alias = "activation_function")]
    pub activation: Activation,

    #[serde(default = "default_pad")]
    pub pad_token_id: u32,
    #[serde(default = "default_bos")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos")]
    pub eos_token_id: u32,
    #[serde(default = "default_eos")]
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub forced_bos_token_id: Option<u32>,
    #[serde(default = "default_forced_eos")]
    pub forced_eos_token_id: Option<u32>,
}

impl Default for BartConfig {
    fn default() -> Self {
        Self {
            d_model: default_d_model(),
            encoder_layers: default_layers(),
            decoder_layers: default_layers(),
            encoder_attention_heads: default_heads(),
            decoder_attention_heads: default_heads(),
            encoder_ffn_dim: default_ffn_dim(),
            decoder_ffn_dim: default_ffn_dim(),
            vocab_size: default_vocab_size(),
            max_position_embeddings: default_max_position_embeddings(),
            scale_embedding: false,
            layer_norm_eps: default_layer_norm_eps(),
            init_std: default_init_std(),
            activation: Activation::Gelu,
            pad_token_id: default_pad(),
            bos_token_id: default_bos(),
            eos_token_id: default_eos(),
            decoder_start_token_id: default_eos(),
            forced_bos_token_id: None,
            forced_eos_token_id: default_forced_eos(),
        }
    }
}

/// BART's learned positions are shifted by two rows.
pub const POSITION_OFFSET: usize = 2;

impl BartConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {:?}", path))?;
        Self::from_json(&text).with_context(|| format!("failed to parse model config {:?}", path))
    }

    /// Resizes the vocabulary to match a tokenizer.
    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.decoder_attention_heads.max(1)
    }

    pub fn embed_scale(&self) -> f32 {
        if self.scale_embedding {
            (self.d_model as f32).sqrt()
        } else {
            1.0
        }
    }

    /// Prompts are generated once per decoder layer and consumed by the
    /// encoder layer of the same index, so both stacks must agree.
    pub fn validate(&self) -> Result<()> {
        if self.encoder_layers != self.decoder_layers {
            return Err(anyhow!(
                "encoder_layers ({}) must equal decoder_layers ({}) for layer-wise prompts",
                self.encoder_layers,
                self.decoder_layers
            ));
        }
        if self.encoder_attention_heads != self.decoder_attention_heads {
            return Err(anyhow!(
                "encoder and decoder attention heads differ ({} vs {})",
                self.encoder_attention_heads,
                self.decoder_attention_heads
            ));
        }
        Ok(())
    }

    /// Prefix geometry for this model: one prompt per decoder layer.
    pub fn prefix_geometry(&self, preseqlen: usize, mid_dim: usize) -> Result<PrefixGeometry> {
        self.validate()?;
        Ok(PrefixGeometry::new(
            self.decoder_layers,
            self.decoder_attention_heads,
            self.d_model,
            preseqlen,
            mid_dim,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_bart_large_defaults() {
        let cfg = BartConfig::from_json("{}").unwrap();
        assert_eq!(cfg, BartConfig::default());
        assert_eq!(cfg.head_dim(), 64);
        assert_eq!(cfg.forced_eos_token_id, Some(2));
    }

    #[test]
    fn test_partial_json() {
        let cfg = BartConfig::from_json(
            r#"{"d_model": 16, "encoder_layers": 2, "decoder_layers": 2,
                "encoder_attention_heads": 4, "decoder_attention_heads": 4,
                "activation_function": "gelu", "vocab_size": 30}"#,
        )
        .unwrap();
        let geometry = cfg.prefix_geometry(4, 8).unwrap();
        assert_eq!(geometry.head_dim, 4);
        assert_eq!(geometry.projected_width(), 2 * 2 * 16);
    }

    #[test]
    fn test_mismatched_stacks_rejected() {
        let cfg = BartConfig {
            encoder_layers: 6,
            ..Default::default()
        };
        assert!(cfg.prefix_geometry(5, 512).is_err());
    }
}
