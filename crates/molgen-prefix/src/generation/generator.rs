use anyhow::{anyhow, Result};
use ndarray::Array2;
use rand::Rng;

use super::beams::run_group_beam_search;
use super::sampling::{
    apply_forced_tokens, apply_min_length, sample_from_probs, temperature_scale, top_k_filtering,
    top_p_filtering,
};
use super::{DecodingStrategy, GenerationConfig, SamplingParams};
use crate::activations::softmax_1d_inplace;
use crate::model::{DecoderState, PromptConditionedModel};
use crate::prefix::PromptBundle;

/// Drives a [`PromptConditionedModel`] through a full decode.
pub struct Seq2SeqGenerator<'a, M: PromptConditionedModel + ?Sized> {
    model: &'a M,
}

impl<'a, M: PromptConditionedModel + ?Sized> Seq2SeqGenerator<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self { model }
    }

    /// Generates `config.num_return_sequences()` sequences per row of
    /// `input_ids`, input-major.
    ///
    /// The bundle's layout must match the batch and the strategy's
    /// multiplier (beams or samples per input).
    pub fn generate<R: Rng + ?Sized>(
        &self,
        input_ids: &Array2<u32>,
        attention_mask: &Array2<f32>,
        prompts: &PromptBundle,
        config: &GenerationConfig,
        rng: &mut R,
    ) -> Result<Vec<Vec<u32>>> {
        config.validate()?;
        let batch = input_ids.nrows();
        if prompts.layout.batch_size != batch {
            return Err(anyhow!(
                "prompt bundle built for batch {} but input has {} rows",
                prompts.layout.batch_size,
                batch
            ));
        }
        if prompts.layout.sample_multiplier != config.sample_multiplier() {
            return Err(anyhow!(
                "prompt bundle expands each input {} times, decoding needs {}",
                prompts.layout.sample_multiplier,
                config.sample_multiplier()
            ));
        }

        let encoded = self.model.encode(input_ids, attention_mask, prompts)?;
        let mut state = self.model.start_decoding(&encoded, prompts)?;

        match &config.strategy {
            DecodingStrategy::BeamSearch(params) => {
                run_group_beam_search(self.model, &mut state, batch, config, params)
            }
            DecodingStrategy::Sample(params) => self.sample(&mut state, config, params, rng),
        }
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        state: &mut DecoderState,
        config: &GenerationConfig,
        params: &SamplingParams,
        rng: &mut R,
    ) -> Result<Vec<Vec<u32>>> {
        let tokens = config.tokens;
        let rows = state.batch_size();
        let mut sequences: Vec<Vec<u32>> = vec![vec![tokens.decoder_start]; rows];
        let mut unfinished = vec![true; rows];
        let mut cur_len = 1;

        while cur_len < config.max_length {
            let last: Vec<u32> = sequences.iter().map(|s| *s.last().unwrap_or(&tokens.pad)).collect();
            let logits = self.model.decode_step(&last, state)?;

            for (row, seq) in sequences.iter_mut().enumerate() {
                if !unfinished[row] {
                    seq.push(tokens.pad);
                    continue;
                }
                let mut scores = logits.row(row).to_owned();
                apply_min_length(&mut scores, cur_len, config.min_length, tokens.eos);
                apply_forced_tokens(&mut scores, cur_len, config.max_length, &tokens);

                let scores = temperature_scale(scores, params.temperature);
                let scores = top_k_filtering(scores, params.top_k);
                let mut probs = top_p_filtering(scores, params.top_p);
                softmax_1d_inplace(&mut probs);

                let token = sample_from_probs(&probs, rng)?;
                seq.push(token);
                if token == tokens.eos {
                    unfinished[row] = false;
                }
            }
            cur_len += 1;

            if unfinished.iter().all(|&u| !u) {
                log::debug!("sampling finished early at length {}", cur_len);
                break;
            }
        }
        Ok(sequences)
    }
}
