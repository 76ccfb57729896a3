//! Diverse (group) beam search.
//!
//! Beams of one input are split into `num_beam_groups` groups that are
//! advanced one after another within a step. A group's log-probabilities are
//! penalised for tokens the earlier groups picked at the same step (Hamming
//! diversity). All groups of one input share a single pool of finished
//! hypotheses with room for `num_beams` entries.

use anyhow::{anyhow, Result};
use ndarray::Array1;

use super::sampling::{apply_forced_tokens, apply_hamming_diversity, apply_min_length};
use super::{BeamSearchParams, GenerationConfig};
use crate::activations::log_softmax_1d;
use crate::model::{DecoderState, PromptConditionedModel};

/// Score given to every beam but the first of each group at step zero.
const INACTIVE_BEAM_SCORE: f32 = -1e9;

#[derive(Clone, Debug, PartialEq)]
pub struct BeamHypothesis {
    pub tokens: Vec<u32>,
    /// Sum of token log-probabilities.
    pub score: f32,
}

impl BeamHypothesis {
    /// `score / len^length_penalty`, `len` counting the decoder start token.
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        let len = self.tokens.len().max(1) as f32;
        self.score / len.powf(length_penalty)
    }
}

/// Finished hypotheses of one input, best first.
#[derive(Debug, Clone)]
pub struct FinishedHypotheses {
    hypotheses: Vec<BeamHypothesis>,
    length_penalty: f32,
    num_beams: usize,
    worst_score: f32,
}

impl FinishedHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams + 1),
            length_penalty,
            num_beams,
            worst_score: f32::INFINITY,
        }
    }

    pub fn add(&mut self, hypothesis: BeamHypothesis) {
        let score = hypothesis.normalized_score(self.length_penalty);
        if self.len() < self.num_beams || score > self.worst_score {
            self.hypotheses.push(hypothesis);
            let lp = self.length_penalty;
            self.hypotheses
                .sort_by(|a, b| b.normalized_score(lp).total_cmp(&a.normalized_score(lp)));
            self.hypotheses.truncate(self.num_beams);
            self.worst_score = self
                .hypotheses
                .last()
                .map(|h| h.normalized_score(lp))
                .unwrap_or(f32::INFINITY);
        }
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn worst_score(&self) -> f32 {
        self.worst_score
    }

    /// Whether no running beam can still improve the pool.
    pub fn is_done(&self, early_stopping: bool, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.len() < self.num_beams {
            return false;
        }
        if early_stopping {
            return true;
        }
        let highest_attainable = best_sum_logprobs / (cur_len.max(1) as f32).powf(self.length_penalty);
        self.worst_score >= highest_attainable
    }

    pub fn best(&self) -> Option<&BeamHypothesis> {
        self.hypotheses.first()
    }

    pub fn into_sorted(self) -> Vec<BeamHypothesis> {
        self.hypotheses
    }
}

/// Returns the `k` best `(score, beam, token)` candidates of one group, best first.
fn top_candidates(group_scores: &[Array1<f32>], k: usize) -> Vec<(f32, usize, u32)> {
    let mut all: Vec<(f32, usize, u32)> = group_scores
        .iter()
        .enumerate()
        .flat_map(|(beam, row)| row.iter().enumerate().map(move |(tok, &s)| (s, beam, tok as u32)))
        .collect();
    let k = k.min(all.len());
    if k == 0 {
        return Vec::new();
    }
    all.select_nth_unstable_by(k - 1, |a, b| b.0.total_cmp(&a.0));
    all.truncate(k);
    // stable order for ties: beam then token
    all.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    all
}

/// Runs group beam search for `batch` inputs whose decoder state already
/// holds `batch * num_beams` rows. Returns `num_return_sequences` sequences
/// per input, input-major.
pub(crate) fn run_group_beam_search<M: PromptConditionedModel + ?Sized>(
    model: &M,
    state: &mut DecoderState,
    batch: usize,
    config: &GenerationConfig,
    params: &BeamSearchParams,
) -> Result<Vec<Vec<u32>>> {
    let num_beams = params.num_beams;
    let group_size = params.group_size();
    let rows = batch * num_beams;
    let tokens = config.tokens;
    if state.batch_size() != rows {
        return Err(anyhow!(
            "decoder state has {} rows, beam search expects {}",
            state.batch_size(),
            rows
        ));
    }

    let mut sequences: Vec<Vec<u32>> = vec![vec![tokens.decoder_start]; rows];
    let mut beam_scores = vec![INACTIVE_BEAM_SCORE; rows];
    for b in 0..batch {
        for g in 0..params.num_beam_groups {
            beam_scores[b * num_beams + g * group_size] = 0.0;
        }
    }
    let mut finished: Vec<FinishedHypotheses> = (0..batch)
        .map(|_| FinishedHypotheses::new(num_beams, params.length_penalty))
        .collect();
    let mut done = vec![false; batch];
    let mut cur_len = 1;

    while cur_len < config.max_length {
        let last: Vec<u32> = sequences.iter().map(|s| *s.last().unwrap_or(&tokens.pad)).collect();
        let logits = model.decode_step(&last, state)?;

        let mut next_sequences = sequences.clone();
        let mut next_scores = beam_scores.clone();
        let mut current_tokens = vec![tokens.pad; rows];
        let mut reorder: Vec<usize> = (0..rows).collect();

        for g in 0..params.num_beam_groups {
            let group_start = g * group_size;
            for b in 0..batch {
                let group_rows: Vec<usize> = (0..group_size).map(|j| b * num_beams + group_start + j).collect();

                if done[b] {
                    for &row in &group_rows {
                        next_sequences[row].push(tokens.pad);
                        next_scores[row] = 0.0;
                    }
                    continue;
                }

                let previous = &current_tokens[b * num_beams..b * num_beams + group_start];
                let group_scores: Vec<Array1<f32>> = group_rows
                    .iter()
                    .map(|&row| {
                        let mut scores = log_softmax_1d(&logits.row(row).to_owned());
                        apply_hamming_diversity(&mut scores, previous, params.diversity_penalty);
                        apply_min_length(&mut scores, cur_len, config.min_length, tokens.eos);
                        apply_forced_tokens(&mut scores, cur_len, config.max_length, &tokens);
                        scores += beam_scores[row];
                        scores
                    })
                    .collect();

                let candidates = top_candidates(&group_scores, 2 * group_size);
                let mut picked = 0;
                for (rank, &(score, beam, token)) in candidates.iter().enumerate() {
                    let source = group_rows[beam];
                    if token == tokens.eos {
                        if rank >= group_size {
                            continue;
                        }
                        finished[b].add(BeamHypothesis {
                            tokens: sequences[source].clone(),
                            score,
                        });
                    } else {
                        let target = group_rows[picked];
                        let mut seq = sequences[source].clone();
                        seq.push(token);
                        next_sequences[target] = seq;
                        next_scores[target] = score;
                        current_tokens[target] = token;
                        reorder[target] = source;
                        picked += 1;
                    }
                    if picked == group_size {
                        break;
                    }
                }
                if picked < group_size {
                    return Err(anyhow!(
                        "beam group {} of input {} kept {} of {} beams; vocabulary too small",
                        g,
                        b,
                        picked,
                        group_size
                    ));
                }

                let best = candidates.first().map_or(f32::NEG_INFINITY, |c| c.0);
                done[b] = done[b] || finished[b].is_done(params.early_stopping, best, cur_len);
            }
        }

        state.reorder(&reorder)?;
        sequences = next_sequences;
        beam_scores = next_scores;
        cur_len += 1;

        if done.iter().all(|&d| d) {
            log::debug!("beam search finished early at length {}", cur_len);
            break;
        }
    }

    let mut outputs = Vec::with_capacity(batch * params.num_return_sequences);
    for (b, mut pool) in finished.into_iter().enumerate() {
        if !done[b] {
            for row in b * num_beams..(b + 1) * num_beams {
                pool.add(BeamHypothesis {
                    tokens: sequences[row].clone(),
                    score: beam_scores[row],
                });
            }
        }
        for mut hyp in pool.into_sorted().into_iter().take(params.num_return_sequences) {
            if hyp.tokens.len() < config.max_length {
                hyp.tokens.push(tokens.eos);
            }
            outputs.push(hyp.tokens);
        }
    }
    Ok(outputs)
}
