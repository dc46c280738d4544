//! Token sampling: repetition penalty, top-p, top-k, temperature.
#![allow(clippy::cast_precision_loss)]

use crate::config::RecognitionOptions;
use crate::tensor::{log_softmax_1d, softmax_1d};

/// How many history tokens the repetition penalty inspects.
const REPETITION_WINDOW: usize = 20;

/// Deterministic 64-bit generator for categorical sampling.
///
/// One stream per generation keeps repeated parses byte-identical.
#[derive(Debug, Clone)]
pub struct SampleRng {
    state: u64,
}

impl SampleRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(0x9E37_79B9_7F4A_7C15),
        }
    }

    /// splitmix64 step, mapped to `[0, 1)`.
    fn next_f32(&mut self) -> f32 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        (z >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Scale the logits of recently generated tokens.
///
/// Only the last 20 history tokens participate. The sign handling follows
/// the source implementation: negative logits are multiplied by the penalty
/// and non-negative ones divided, which inverts the conventional direction
/// for negative logits when the penalty exceeds one. Kept for output parity.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if penalty == 1.0 || history.is_empty() {
        return;
    }
    let window = &history[history.len().saturating_sub(REPETITION_WINDOW)..];
    for &token in window {
        let idx = token as usize;
        if idx < logits.len() {
            let selected = logits[idx];
            logits[idx] = if selected < 0.0 {
                selected * penalty
            } else {
                selected / penalty
            };
        }
    }
}

/// Sample the next token from raw last-position logits.
///
/// Applies the repetition penalty, log-softmax, then either argmax
/// (temperature zero) or top-p / top-k / temperature categorical sampling.
#[must_use = "returns the sampled token id"]
pub fn sample_token(
    logits: &mut Vec<f32>,
    history: &[u32],
    options: &RecognitionOptions,
    rng: &mut SampleRng,
) -> u32 {
    apply_repetition_penalty(logits, history, options.repetition_penalty);
    log_softmax_1d(logits);

    if options.temperature == 0.0 {
        return argmax(logits);
    }

    // Top-p: mask the low-probability tail via sort / inverse-sort.
    if options.top_p < 1.0 {
        let mut order: Vec<usize> = (0..logits.len()).collect();
        order.sort_by(|a, b| logits[*a].total_cmp(&logits[*b]));
        let mut cumulative = 0.0f32;
        for &idx in &order {
            cumulative += logits[idx].exp();
            if cumulative <= 1.0 - options.top_p {
                logits[idx] = f32::NEG_INFINITY;
            }
        }
    }

    // Top-k: keep only the k highest.
    if options.top_k > 0 && options.top_k < logits.len() {
        let mut order: Vec<usize> = (0..logits.len()).collect();
        order.sort_by(|a, b| logits[*b].total_cmp(&logits[*a]));
        for &idx in &order[options.top_k..] {
            logits[idx] = f32::NEG_INFINITY;
        }
    }

    // Temperature scale, softmax, categorical draw.
    let inv_temp = 1.0 / options.temperature;
    for v in logits.iter_mut() {
        *v *= inv_temp;
    }
    softmax_1d(logits);
    let draw = rng.next_f32();
    let mut cumulative = 0.0f32;
    for (i, p) in logits.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return i as u32;
        }
    }
    argmax(logits)
}

fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_v = f32::NEG_INFINITY;
    for (i, v) in values.iter().enumerate() {
        if *v > best_v {
            best_v = *v;
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(temperature: f32, top_p: f32, top_k: usize, penalty: f32) -> RecognitionOptions {
        RecognitionOptions {
            temperature,
            top_p,
            top_k,
            repetition_penalty: penalty,
            ..RecognitionOptions::default()
        }
    }

    #[test]
    fn test_zero_temperature_argmax() {
        let mut logits = vec![0.1f32, 3.0, -1.0, 2.9];
        let mut rng = SampleRng::new(0);
        let token = sample_token(&mut logits, &[], &options(0.0, 1.0, 1, 1.0), &mut rng);
        assert_eq!(token, 1);
    }

    #[test]
    fn test_top_k_one_is_greedy_regardless_of_temperature() {
        for seed in 0..5 {
            let mut logits = vec![0.1f32, 3.0, -1.0, 2.9];
            let mut rng = SampleRng::new(seed);
            let token = sample_token(&mut logits, &[], &options(0.8, 1.0, 1, 1.0), &mut rng);
            assert_eq!(token, 1);
        }
    }

    #[test]
    fn test_repetition_penalty_sign_quirk() {
        // Positive logits shrink; negative logits grow in magnitude.
        let mut logits = vec![2.0f32, -2.0];
        apply_repetition_penalty(&mut logits, &[0, 1], 2.0);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], -4.0);
    }

    #[test]
    fn test_repetition_penalty_window_is_twenty() {
        let mut logits = vec![1.0f32; 30];
        // Token 0 appears only outside the 20-token window.
        let mut history = vec![0u32];
        history.extend(1..=20u32);
        apply_repetition_penalty(&mut logits, &history, 2.0);
        assert_eq!(logits[0], 1.0);
        assert_eq!(logits[1], 0.5);
        assert_eq!(logits[20], 0.5);
    }

    #[test]
    fn test_sampling_is_deterministic_per_seed() {
        let opts = options(1.0, 0.9, 5, 1.0);
        let mut a_rng = SampleRng::new(7);
        let mut b_rng = SampleRng::new(7);
        let base = vec![0.5f32, 1.5, 0.2, 1.4, -3.0, 0.9];
        let a = sample_token(&mut base.clone(), &[], &opts, &mut a_rng);
        let b = sample_token(&mut base.clone(), &[], &opts, &mut b_rng);
        assert_eq!(a, b);
    }

    #[test]
    fn test_top_p_masks_tail() {
        // With a sharply peaked distribution and small top_p, only the peak
        // survives.
        let opts = options(1.0, 0.1, 0, 1.0);
        for seed in 0..10 {
            let mut logits = vec![10.0f32, 0.0, 0.0, 0.0];
            let mut rng = SampleRng::new(seed);
            assert_eq!(sample_token(&mut logits, &[], &opts, &mut rng), 0);
        }
    }
}
