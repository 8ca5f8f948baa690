//! Token sampling over next-token logits.
//!
//! Temperature-free top-k/top-p sampling, or deterministic argmax when
//! sampling is disabled.

use ndarray::Array1;
use rand::Rng;

use super::Token;
use crate::config::GenerationConfig;

/// Sampling knobs for one generation pass.
#[derive(Clone, Copy, Debug)]
pub struct SamplingParams {
    /// Keep only the k highest-probability tokens (0 disables)
    pub top_k: usize,
    /// Keep the smallest set of tokens with cumulative probability >= top_p
    pub top_p: f32,
    /// Sample when true, argmax when false
    pub do_sample: bool,
}

impl From<&GenerationConfig> for SamplingParams {
    fn from(gen: &GenerationConfig) -> Self {
        Self {
            top_k: gen.top_k,
            top_p: gen.top_p,
            do_sample: gen.do_sample,
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax decoding, used for evaluation passes.
    pub fn greedy() -> Self {
        Self {
            top_k: 0,
            top_p: 1.0,
            do_sample: false,
        }
    }
}

/// Numerically stable log-softmax over a logits row.
pub fn log_softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|l| (l - max).exp()).sum::<f32>().ln();
    logits.mapv(|l| l - max - log_sum)
}

fn argmax(logits: &Array1<f32>) -> Token {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &l) in logits.iter().enumerate() {
        if l > best_val {
            best_val = l;
            best = i;
        }
    }
    best as Token
}

/// Draw the next token from a logits row.
pub fn sample_token(logits: &Array1<f32>, params: &SamplingParams, rng: &mut impl Rng) -> Token {
    if !params.do_sample {
        return argmax(logits);
    }

    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (i, (l - max).exp()))
        .collect();
    let total: f32 = probs.iter().map(|(_, p)| p).sum();
    for (_, p) in probs.iter_mut() {
        *p /= total;
    }

    probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if params.top_k > 0 && params.top_k < probs.len() {
        probs.truncate(params.top_k);
    }

    if params.top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut keep = probs.len();
        for (i, (_, p)) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= params.top_p {
                keep = i + 1;
                break;
            }
        }
        probs.truncate(keep);
    }

    let mass: f32 = probs.iter().map(|(_, p)| p).sum();
    let mut draw = rng.gen::<f32>() * mass;
    for (i, p) in &probs {
        draw -= p;
        if draw <= 0.0 {
            return *i as Token;
        }
    }
    // Floating underflow can leave a sliver of unassigned mass
    probs.last().map(|(i, _)| *i as Token).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_greedy_picks_argmax() {
        let logits = array![0.1, 2.0, -1.0, 0.5];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let token = sample_token(&logits, &SamplingParams::greedy(), &mut rng);
        assert_eq!(token, 1);
    }

    #[test]
    fn test_top_k_restricts_support() {
        let logits = array![5.0, 4.0, -10.0, -10.0];
        let params = SamplingParams {
            top_k: 2,
            top_p: 1.0,
            do_sample: true,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..50 {
            let token = sample_token(&logits, &params, &mut rng);
            assert!(token < 2);
        }
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        // One token holds ~98% of the mass; top_p=0.9 keeps only it
        let logits = array![10.0, 5.0, 5.0];
        let params = SamplingParams {
            top_k: 0,
            top_p: 0.9,
            do_sample: true,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..50 {
            assert_eq!(sample_token(&logits, &params, &mut rng), 0);
        }
    }

    #[test]
    fn test_sampling_deterministic_with_seed() {
        let logits = array![0.2, 0.1, 0.4, 0.3];
        let params = SamplingParams {
            top_k: 0,
            top_p: 1.0,
            do_sample: true,
        };
        let a: Vec<Token> = {
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            (0..20).map(|_| sample_token(&logits, &params, &mut rng)).collect()
        };
        let b: Vec<Token> = {
            let mut rng = ChaCha8Rng::seed_from_u64(7);
            (0..20).map(|_| sample_token(&logits, &params, &mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let logits = array![1.0, 2.0, 3.0];
        let lp = log_softmax(&logits);
        let total: f32 = lp.iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }
}
