//! Batched decoding with prefix prompts.
//!
//! Two policies: diverse (group) beam search and top-k / nucleus sampling.
//! Both return `num_return_sequences` token sequences per input row,
//! input-major, each starting with the decoder start token.

mod beams;
mod generator;
mod sampling;

pub use beams::{BeamHypothesis, FinishedHypotheses};
pub use generator::Seq2SeqGenerator;
pub use sampling::{
    apply_hamming_diversity, apply_min_length, apply_forced_tokens, sample_from_probs, temperature_scale,
    top_k_filtering, top_p_filtering,
};

use anyhow::{anyhow, Result};

use crate::config::{GenerateMode, RunConfig};
use crate::model::BartConfig;

/// Token ids the decoding loop needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub decoder_start: u32,
    pub eos: u32,
    pub pad: u32,
    pub forced_bos: Option<u32>,
    pub forced_eos: Option<u32>,
}

impl SpecialTokens {
    pub fn from_bart(config: &BartConfig) -> Self {
        Self {
            decoder_start: config.decoder_start_token_id,
            eos: config.eos_token_id,
            pad: config.pad_token_id,
            forced_bos: config.forced_bos_token_id,
            forced_eos: config.forced_eos_token_id,
        }
    }
}

/// Parameters for diverse beam search.
#[derive(Clone, Debug, PartialEq)]
pub struct BeamSearchParams {
    pub num_beams: usize,
    pub num_beam_groups: usize,
    pub diversity_penalty: f32,
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub num_return_sequences: usize,
}

impl Default for BeamSearchParams {
    fn default() -> Self {
        Self {
            num_beams: 4,
            num_beam_groups: 4,
            diversity_penalty: 1.0,
            length_penalty: 1.0,
            early_stopping: true,
            num_return_sequences: 4,
        }
    }
}

impl BeamSearchParams {
    pub fn group_size(&self) -> usize {
        self.num_beams / self.num_beam_groups.max(1)
    }
}

/// Parameters for sampling. `top_k == 0` and `top_p >= 1.0` disable those filters.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub num_return_sequences: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            num_return_sequences: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodingStrategy {
    BeamSearch(BeamSearchParams),
    Sample(SamplingParams),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    /// Maximum sequence length, counting the decoder start token.
    pub max_length: usize,
    /// EOS is suppressed until the sequence reaches this length.
    pub min_length: usize,
    pub tokens: SpecialTokens,
    pub strategy: DecodingStrategy,
}

impl GenerationConfig {
    /// Decoding settings for a run: one group per beam in beam mode.
    pub fn from_run_config(run: &RunConfig, bart: &BartConfig) -> Self {
        let strategy = match run.generate_mode {
            GenerateMode::Beam => DecodingStrategy::BeamSearch(BeamSearchParams {
                num_beams: run.beam,
                num_beam_groups: run.beam,
                diversity_penalty: run.diversity_penalty,
                length_penalty: run.length_penalty,
                early_stopping: true,
                num_return_sequences: run.beam,
            }),
            GenerateMode::Topk => DecodingStrategy::Sample(SamplingParams {
                temperature: run.temperature,
                top_k: run.top_k,
                top_p: run.top_p,
                num_return_sequences: run.return_num,
            }),
        };
        Self {
            max_length: run.max_len,
            min_length: run.min_len,
            tokens: SpecialTokens::from_bart(bart),
            strategy,
        }
    }

    /// Decoder rows per input row.
    pub fn sample_multiplier(&self) -> usize {
        match &self.strategy {
            DecodingStrategy::BeamSearch(p) => p.num_beams,
            DecodingStrategy::Sample(p) => p.num_return_sequences,
        }
    }

    pub fn num_return_sequences(&self) -> usize {
        match &self.strategy {
            DecodingStrategy::BeamSearch(p) => p.num_return_sequences,
            DecodingStrategy::Sample(p) => p.num_return_sequences,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_length < 2 {
            return Err(anyhow!("max_length must leave room for one generated token"));
        }
        match &self.strategy {
            DecodingStrategy::BeamSearch(p) => {
                if p.num_beams == 0 || p.num_beam_groups == 0 || p.num_beams % p.num_beam_groups != 0 {
                    return Err(anyhow!(
                        "num_beams ({}) must be a positive multiple of num_beam_groups ({})",
                        p.num_beams,
                        p.num_beam_groups
                    ));
                }
                if p.num_return_sequences == 0 || p.num_return_sequences > p.num_beams {
                    return Err(anyhow!(
                        "num_return_sequences ({}) must be in 1..={}",
                        p.num_return_sequences,
                        p.num_beams
                    ));
                }
            }
            DecodingStrategy::Sample(p) => {
                if p.num_return_sequences == 0 {
                    return Err(anyhow!("num_return_sequences must be positive"));
                }
                if p.temperature <= 0.0 {
                    return Err(anyhow!("temperature must be positive, got {}", p.temperature));
                }
            }
        }
        Ok(())
    }
}
