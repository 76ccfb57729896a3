//! Logit processors and sampling warpers.

use anyhow::{anyhow, Result};
use ndarray::{Array1, ArrayBase, DataMut, Ix1};
use rand::Rng;

use super::SpecialTokens;
use crate::activations::softmax_1d_inplace;

/// Suppresses EOS while the sequence is shorter than `min_length`.
pub fn apply_min_length<S>(scores: &mut ArrayBase<S, Ix1>, cur_len: usize, min_length: usize, eos: u32)
where
    S: DataMut<Elem = f32>,
{
    if cur_len < min_length {
        if let Some(v) = scores.get_mut(eos as usize) {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Forces BOS as the first generated token and EOS as the last one.
pub fn apply_forced_tokens<S>(scores: &mut ArrayBase<S, Ix1>, cur_len: usize, max_length: usize, tokens: &SpecialTokens)
where
    S: DataMut<Elem = f32>,
{
    let forced = match (tokens.forced_bos, tokens.forced_eos) {
        (Some(bos), _) if cur_len == 1 => Some(bos),
        (_, Some(eos)) if cur_len + 1 == max_length => Some(eos),
        _ => None,
    };
    if let Some(token) = forced {
        if (token as usize) < scores.len() {
            scores.fill(f32::NEG_INFINITY);
            scores[token as usize] = 0.0;
        }
    }
}

/// Penalises tokens already chosen by earlier beam groups at this step.
pub fn apply_hamming_diversity<S>(scores: &mut ArrayBase<S, Ix1>, previous_tokens: &[u32], penalty: f32)
where
    S: DataMut<Elem = f32>,
{
    if penalty == 0.0 {
        return;
    }
    for &token in previous_tokens {
        if let Some(v) = scores.get_mut(token as usize) {
            *v -= penalty;
        }
    }
}

pub fn temperature_scale(mut logits: Array1<f32>, temperature: f32) -> Array1<f32> {
    if temperature != 1.0 && temperature > 0.0 {
        logits.mapv_inplace(|v| v / temperature);
    }
    logits
}

fn descending_order(logits: &Array1<f32>) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    indices
}

/// Keeps the `k` largest logits. `k == 0` disables the filter.
pub fn top_k_filtering(mut logits: Array1<f32>, k: usize) -> Array1<f32> {
    if k == 0 || k >= logits.len() {
        return logits;
    }
    let indices = descending_order(&logits);
    for &idx in &indices[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
    logits
}

/// Keeps the smallest prefix of tokens whose probability mass exceeds `p`
/// (always at least one). `p >= 1.0` disables the filter.
pub fn top_p_filtering(mut logits: Array1<f32>, p: f32) -> Array1<f32> {
    if p >= 1.0 {
        return logits;
    }
    let indices = descending_order(&logits);
    let mut probs = logits.clone();
    softmax_1d_inplace(&mut probs);

    let mut cumulative = 0.0;
    for (i, &idx) in indices.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > p {
            for &invalid_idx in &indices[i + 1..] {
                logits[invalid_idx] = f32::NEG_INFINITY;
            }
            break;
        }
    }
    logits
}

/// Draws one index from a probability vector.
pub fn sample_from_probs<R: Rng + ?Sized>(probs: &Array1<f32>, rng: &mut R) -> Result<u32> {
    let total: f32 = probs.sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(anyhow!("cannot sample from a distribution with mass {}", total));
    }
    let target: f32 = rng.gen::<f32>() * total;
    let mut cumulative = 0.0;
    let mut last_nonzero = 0;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob > 0.0 {
            last_nonzero = idx;
        }
        cumulative += prob;
        if cumulative > target && prob > 0.0 {
            return Ok(idx as u32);
        }
    }
    Ok(last_nonzero as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tokens() -> SpecialTokens {
        SpecialTokens {
            decoder_start: 2,
            eos: 2,
            pad: 1,
            forced_bos: Some(0),
            forced_eos: Some(2),
        }
    }

    #[test]
    fn test_min_length_blocks_eos() {
        let mut scores = array![0.0, 0.0, 5.0, 0.0];
        apply_min_length(&mut scores, 1, 3, 2);
        assert_eq!(scores[2], f32::NEG_INFINITY);

        let mut scores = array![0.0, 0.0, 5.0, 0.0];
        apply_min_length(&mut scores, 3, 3, 2);
        assert_eq!(scores[2], 5.0);
    }

    #[test]
    fn test_forced_tokens() {
        let mut scores = array![-1.0, -2.0, -3.0, -4.0];
        apply_forced_tokens(&mut scores, 1, 10, &tokens());
        assert_eq!(scores, array![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY]);

        let mut scores = array![-1.0, -2.0, -3.0, -4.0];
        apply_forced_tokens(&mut scores, 9, 10, &tokens());
        assert_eq!(scores[2], 0.0);
        assert_eq!(scores[3], f32::NEG_INFINITY);

        let mut scores = array![-1.0, -2.0, -3.0, -4.0];
        apply_forced_tokens(&mut scores, 4, 10, &tokens());
        assert_eq!(scores, array![-1.0, -2.0, -3.0, -4.0]);
    }

    #[test]
    fn test_hamming_diversity_counts_repeats() {
        let mut scores = array![0.0, 0.0, 0.0];
        apply_hamming_diversity(&mut scores, &[1, 1, 2], 0.5);
        assert_eq!(scores, array![0.0, -1.0, -0.5]);
    }

    #[test]
    fn test_top_k() {
        let out = top_k_filtering(array![1.0, 3.0, 2.0, 0.0], 2);
        assert_eq!(out[0], f32::NEG_INFINITY);
        assert_eq!(out[1], 3.0);
        assert_eq!(out[2], 2.0);
        assert_eq!(top_k_filtering(array![1.0, 2.0], 0), array![1.0, 2.0]);
    }

    #[test]
    fn test_top_p_keeps_at_least_one() {
        let out = top_p_filtering(array![10.0, 0.0, 0.0], 0.5);
        assert_eq!(out[0], 10.0);
        assert!(out.iter().skip(1).all(|&v| v == f32::NEG_INFINITY));
    }

    #[test]
    fn test_sampling_is_seeded_and_respects_zeros() {
        let probs = array![0.0, 0.5, 0.0, 0.5];
        let mut a = StdRng::seed_from_u64(3);
        let mut b = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let x = sample_from_probs(&probs, &mut a).unwrap();
            assert_eq!(x, sample_from_probs(&probs, &mut b).unwrap());
            assert!(x == 1 || x == 3);
        }
        assert!(sample_from_probs(&array![0.0, 0.0], &mut a).is_err());
    }

    #[test]
    fn test_temperature() {
        assert_eq!(temperature_scale(array![2.0, 4.0], 2.0), array![1.0, 2.0]);
    }
}
