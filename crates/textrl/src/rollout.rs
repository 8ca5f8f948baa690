//! Rollout generation.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::config::GenerationConfig;
use crate::policy::{
    log_softmax, sample_token, ReferencePolicy, SamplingParams, Token, TrainablePolicy,
};
use crate::utils::seeded_rng;
use crate::{Result, TextRlError};

/// One generated completion for one prompt, with the statistics needed for
/// training. The terminal score is attached after reward scoring.
#[derive(Clone, Debug)]
pub struct Rollout {
    pub prompt: Vec<Token>,
    pub response: Vec<Token>,
    /// Per-token log-probability under the policy that generated it
    pub log_probs: Vec<f32>,
    /// Per-token log-probability under the frozen reference policy
    pub ref_log_probs: Vec<f32>,
    /// Per-token value estimate
    pub values: Vec<f32>,
    /// Scalar terminal reward from the scorer
    pub score: f32,
}

/// Drives the policy over a batch of prompts to produce one rollout each.
pub struct RolloutGenerator {
    sampling: SamplingParams,
    max_new_tokens: usize,
    seq_length: usize,
    rng: ChaCha8Rng,
}

impl RolloutGenerator {
    pub fn new(gen_kwargs: &GenerationConfig, seq_length: usize, seed: u64) -> Self {
        Self {
            sampling: SamplingParams::from(gen_kwargs),
            max_new_tokens: gen_kwargs.max_new_tokens,
            seq_length,
            rng: seeded_rng(seed),
        }
    }

    /// Generate one rollout per prompt.
    ///
    /// Sampling is autoregressive until the policy emits its end-of-sequence
    /// token or `max_new_tokens` is reached. Prompts are never mutated. Any
    /// backend failure, or a prompt the backend cannot fit, rejects the
    /// whole batch; no partial rollouts are emitted.
    pub fn generate<P: TrainablePolicy>(
        &mut self,
        policy: &P,
        reference: &dyn ReferencePolicy,
        prompts: &[Vec<Token>],
    ) -> Result<Vec<Rollout>> {
        let mut rollouts = Vec::with_capacity(prompts.len());
        for (i, prompt) in prompts.iter().enumerate() {
            let rollout = self
                .generate_one(policy, reference, prompt)
                .map_err(|e| match e {
                    TextRlError::Generation(msg) => {
                        TextRlError::Generation(format!("prompt {i}: {msg}"))
                    }
                    other => other,
                })?;
            rollouts.push(rollout);
        }
        Ok(rollouts)
    }

    fn generate_one<P: TrainablePolicy>(
        &mut self,
        policy: &P,
        reference: &dyn ReferencePolicy,
        prompt: &[Token],
    ) -> Result<Rollout> {
        if prompt.is_empty() {
            return Err(TextRlError::Generation("prompt is empty".into()));
        }
        if prompt.len() + self.max_new_tokens > self.seq_length {
            return Err(TextRlError::Generation(format!(
                "prompt of {} tokens overflows sequence length {} with {} new tokens",
                prompt.len(),
                self.seq_length,
                self.max_new_tokens
            )));
        }

        let mut context = prompt.to_vec();
        let mut response = Vec::new();
        let mut log_probs = Vec::new();
        let mut values = Vec::new();

        for _ in 0..self.max_new_tokens {
            let output = policy.next_token(&context)?;
            if output.logits.iter().any(|l| !l.is_finite()) || !output.value.is_finite() {
                return Err(TextRlError::Generation(
                    "policy produced non-finite logits or value".into(),
                ));
            }

            let token = sample_token(&output.logits, &self.sampling, &mut self.rng);
            log_probs.push(log_softmax(&output.logits)[token as usize]);
            values.push(output.value);
            response.push(token);
            context.push(token);

            if token == policy.eos_token() {
                break;
            }
        }

        let ref_log_probs = reference.log_probs(prompt, &response)?;
        if ref_log_probs.len() != response.len() {
            return Err(TextRlError::Generation(format!(
                "reference returned {} log-probs for {} tokens",
                ref_log_probs.len(),
                response.len()
            )));
        }

        Ok(Rollout {
            prompt: prompt.to_vec(),
            response,
            log_probs,
            ref_log_probs,
            values,
            score: 0.0,
        })
    }
}

/// Ordered or shuffled source of prompt strings, cycling with replacement
/// once exhausted.
pub struct PromptSource {
    prompts: Vec<String>,
    shuffle: bool,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl PromptSource {
    pub fn new(prompts: Vec<String>, shuffle: bool) -> Self {
        Self::with_seed(prompts, shuffle, 0)
    }

    pub fn with_seed(prompts: Vec<String>, shuffle: bool, seed: u64) -> Self {
        let mut source = Self {
            prompts,
            shuffle,
            cursor: 0,
            rng: seeded_rng(seed),
        };
        if source.shuffle {
            source.prompts.shuffle(&mut source.rng);
        }
        source
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Draw the next `n` prompts, wrapping (and reshuffling, if configured)
    /// when the source runs out.
    pub fn next_batch(&mut self, n: usize) -> Vec<String> {
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            if self.cursor >= self.prompts.len() {
                self.cursor = 0;
                if self.shuffle {
                    self.prompts.shuffle(&mut self.rng);
                }
            }
            batch.push(self.prompts[self.cursor].clone());
            self.cursor += 1;
        }
        batch
    }
}
