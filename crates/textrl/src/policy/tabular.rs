//! Built-in bigram policy.
//!
//! A softmax table over (previous token, next token) pairs with a per-token
//! value head and hand-derived SGD. It exists so the full training loop can
//! run and be tested without an external model backend; real deployments
//! implement [`TrainablePolicy`] over their own inference stack.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::sampling::log_softmax;
use super::{ReferencePolicy, SampleGrads, Token, TokenEval, TokenOutput, Tokenizer, TrainablePolicy};
use crate::checkpoint::Checkpointable;
use crate::distributed::DistributedBackend;
use crate::{Result, TextRlError};

pub struct BigramPolicy {
    vocab: usize,
    eos: Token,
    learning_rate: f32,
    /// Row per context token, column per next token
    weights: Array2<f32>,
    /// Value estimate per context token
    values: Array1<f32>,
    distributed: Option<Arc<dyn DistributedBackend>>,
}

impl BigramPolicy {
    pub fn new(vocab: usize, eos: Token, learning_rate: f32) -> Self {
        Self {
            vocab,
            eos,
            learning_rate,
            weights: Array2::zeros((vocab, vocab)),
            values: Array1::zeros(vocab),
            distributed: None,
        }
    }

    /// Byte-level policy matching [`ByteTokenizer`].
    pub fn byte_level(learning_rate: f32) -> Self {
        Self::new(257, 256, learning_rate)
    }

    /// Average gradients with cooperating workers before each step.
    pub fn with_distributed(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    fn context_token(&self, prompt: &[Token], completion: &[Token], pos: usize) -> Result<usize> {
        let token = if pos == 0 {
            *prompt
                .last()
                .ok_or_else(|| TextRlError::Generation("empty prompt".into()))?
        } else {
            completion[pos - 1]
        };
        self.check_token(token)
    }

    fn check_token(&self, token: Token) -> Result<usize> {
        if (token as usize) < self.vocab {
            Ok(token as usize)
        } else {
            Err(TextRlError::Generation(format!(
                "token {token} outside vocabulary of {}",
                self.vocab
            )))
        }
    }
}

impl ReferencePolicy for BigramPolicy {
    fn log_probs(&self, prompt: &[Token], completion: &[Token]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(completion.len());
        for (pos, &token) in completion.iter().enumerate() {
            let ctx = self.context_token(prompt, completion, pos)?;
            let row = log_softmax(&self.weights.row(ctx).to_owned());
            out.push(row[self.check_token(token)?]);
        }
        Ok(out)
    }
}

impl TrainablePolicy for BigramPolicy {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn eos_token(&self) -> Token {
        self.eos
    }

    fn next_token(&self, context: &[Token]) -> Result<TokenOutput> {
        let last = *context
            .last()
            .ok_or_else(|| TextRlError::Generation("empty context".into()))?;
        let ctx = self.check_token(last)?;
        Ok(TokenOutput {
            logits: self.weights.row(ctx).to_owned(),
            value: self.values[ctx],
        })
    }

    fn evaluate(&self, prompt: &[Token], completion: &[Token]) -> Result<TokenEval> {
        let mut log_probs = Vec::with_capacity(completion.len());
        let mut values = Vec::with_capacity(completion.len());
        for (pos, &token) in completion.iter().enumerate() {
            let ctx = self.context_token(prompt, completion, pos)?;
            let row = log_softmax(&self.weights.row(ctx).to_owned());
            log_probs.push(row[self.check_token(token)?]);
            values.push(self.values[ctx]);
        }
        Ok(TokenEval { log_probs, values })
    }

    fn apply_gradients(&mut self, batch: &[SampleGrads<'_>]) -> Result<()> {
        let mut grad_w: Array2<f32> = Array2::zeros((self.vocab, self.vocab));
        let mut grad_v: Array1<f32> = Array1::zeros(self.vocab);

        for sample in batch {
            for (pos, &token) in sample.completion.iter().enumerate() {
                let ctx = self.context_token(sample.prompt, sample.completion, pos)?;
                let target = self.check_token(token)?;

                // d logp(t) / d logits = onehot(t) - softmax(logits)
                let row = self.weights.row(ctx).to_owned();
                let probs = log_softmax(&row).mapv(f32::exp);
                let d_lp = sample.d_log_probs[pos];
                for j in 0..self.vocab {
                    let indicator = if j == target { 1.0 } else { 0.0 };
                    grad_w[[ctx, j]] += d_lp * (indicator - probs[j]);
                }
                grad_v[ctx] += sample.d_values[pos];
            }
        }

        if let Some(backend) = &self.distributed {
            backend.all_reduce_mean(grad_w.as_slice_mut().expect("contiguous gradient"));
            backend.all_reduce_mean(grad_v.as_slice_mut().expect("contiguous gradient"));
        }

        self.weights.scaled_add(-self.learning_rate, &grad_w);
        self.values.scaled_add(-self.learning_rate, &grad_v);
        Ok(())
    }

    fn snapshot(&self) -> Box<dyn ReferencePolicy> {
        Box::new(FrozenBigram {
            vocab: self.vocab,
            weights: self.weights.clone(),
        })
    }
}

/// Read-only snapshot of a [`BigramPolicy`], taken at training start.
pub struct FrozenBigram {
    vocab: usize,
    weights: Array2<f32>,
}

impl ReferencePolicy for FrozenBigram {
    fn log_probs(&self, prompt: &[Token], completion: &[Token]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(completion.len());
        for (pos, &token) in completion.iter().enumerate() {
            let ctx = if pos == 0 {
                *prompt
                    .last()
                    .ok_or_else(|| TextRlError::Generation("empty prompt".into()))?
            } else {
                completion[pos - 1]
            } as usize;
            if ctx >= self.vocab || token as usize >= self.vocab {
                return Err(TextRlError::Generation(format!(
                    "token outside vocabulary of {}",
                    self.vocab
                )));
            }
            let row = log_softmax(&self.weights.row(ctx).to_owned());
            out.push(row[token as usize]);
        }
        Ok(out)
    }
}

#[derive(Serialize, Deserialize)]
struct BigramState {
    vocab: usize,
    eos: Token,
    learning_rate: f32,
    weights: Vec<f32>,
    values: Vec<f32>,
}

impl Checkpointable for BigramPolicy {
    fn save_state(&self) -> Result<Vec<u8>> {
        let state = BigramState {
            vocab: self.vocab,
            eos: self.eos,
            learning_rate: self.learning_rate,
            weights: self.weights.iter().cloned().collect(),
            values: self.values.to_vec(),
        };
        serde_json::to_vec(&state)
            .map_err(|e| TextRlError::Persistence(format!("failed to serialize policy: {e}")))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let state: BigramState = serde_json::from_slice(data)
            .map_err(|e| TextRlError::Persistence(format!("failed to parse policy state: {e}")))?;
        let weights = Array2::from_shape_vec((state.vocab, state.vocab), state.weights)
            .map_err(|e| TextRlError::Persistence(format!("bad weight shape: {e}")))?;
        self.vocab = state.vocab;
        self.eos = state.eos;
        self.learning_rate = state.learning_rate;
        self.weights = weights;
        self.values = Array1::from_vec(state.values);
        Ok(())
    }
}

/// Byte-level tokenizer: one token per byte, plus a distinguished EOS id.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<Token> {
        text.bytes().map(|b| b as Token).collect()
    }

    fn decode(&self, tokens: &[Token]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|t| **t < 256)
            .map(|t| *t as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn artifact(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "type": "byte", "vocab": 257, "eos": 256 }))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_log_probs_at_init() {
        let policy = BigramPolicy::new(4, 3, 0.1);
        let lps = policy.log_probs(&[0], &[1, 2]).unwrap();
        let expected = (1.0f32 / 4.0).ln();
        for lp in lps {
            assert!((lp - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut policy = BigramPolicy::new(4, 3, 0.5);
        let reference = policy.snapshot();
        let before = reference.log_probs(&[0], &[1]).unwrap();

        // Push the live policy away from token 1
        let grads = vec![SampleGrads {
            prompt: &[0],
            completion: &[1],
            d_log_probs: vec![1.0],
            d_values: vec![0.0],
        }];
        policy.apply_gradients(&grads).unwrap();

        let live = policy.log_probs(&[0], &[1]).unwrap();
        let frozen = reference.log_probs(&[0], &[1]).unwrap();
        assert!(live[0] < before[0]);
        assert_eq!(frozen[0], before[0]);
    }

    #[test]
    fn test_gradient_step_moves_log_prob() {
        let mut policy = BigramPolicy::new(4, 3, 0.5);
        let before = policy.log_probs(&[2], &[0]).unwrap()[0];

        // Negative d_logp means increasing logp lowers the loss
        let grads = vec![SampleGrads {
            prompt: &[2],
            completion: &[0],
            d_log_probs: vec![-1.0],
            d_values: vec![0.0],
        }];
        policy.apply_gradients(&grads).unwrap();

        let after = policy.log_probs(&[2], &[0]).unwrap()[0];
        assert!(after > before);
    }

    #[test]
    fn test_value_head_updates() {
        let mut policy = BigramPolicy::new(4, 3, 0.5);
        let grads = vec![SampleGrads {
            prompt: &[1],
            completion: &[2],
            d_log_probs: vec![0.0],
            d_values: vec![-2.0],
        }];
        policy.apply_gradients(&grads).unwrap();
        let eval = policy.evaluate(&[1], &[2]).unwrap();
        assert!((eval.values[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut policy = BigramPolicy::new(4, 3, 0.5);
        let grads = vec![SampleGrads {
            prompt: &[0],
            completion: &[1],
            d_log_probs: vec![-1.0],
            d_values: vec![1.0],
        }];
        policy.apply_gradients(&grads).unwrap();
        let saved = policy.save_state().unwrap();

        let mut restored = BigramPolicy::new(4, 3, 0.5);
        restored.load_state(&saved).unwrap();
        assert_eq!(
            policy.log_probs(&[0], &[1]).unwrap(),
            restored.log_probs(&[0], &[1]).unwrap()
        );
    }

    #[test]
    fn test_out_of_vocab_token_rejected() {
        let policy = BigramPolicy::new(4, 3, 0.5);
        assert!(policy.log_probs(&[0], &[9]).is_err());
    }

    #[test]
    fn test_byte_tokenizer_roundtrip() {
        let tok = ByteTokenizer;
        let tokens = tok.encode("abc");
        assert_eq!(tokens, vec![97, 98, 99]);
        assert_eq!(tok.decode(&tokens), "abc");
    }
}
