//! Policy capability traits.
//!
//! The generation model is consumed as a black box behind two capabilities:
//! a [`ReferencePolicy`] can only be queried for log-probabilities, while a
//! [`TrainablePolicy`] additionally generates tokens, re-evaluates stored
//! sequences under its current parameters, and applies gradient steps. The
//! frozen reference used for the KL penalty is a read-only snapshot taken at
//! training start, not a second trainable model.

mod sampling;
mod tabular;

pub use sampling::{log_softmax, sample_token, SamplingParams};
pub use tabular::{BigramPolicy, ByteTokenizer, FrozenBigram};

use ndarray::Array1;

use crate::Result;

/// Token id within the policy's vocabulary.
pub type Token = u32;

/// Output of a single autoregressive step: next-token logits and the value
/// estimate for the current state.
pub struct TokenOutput {
    pub logits: Array1<f32>,
    pub value: f32,
}

/// Per-token statistics recomputed for a stored sequence.
pub struct TokenEval {
    /// Log-probability of each generated token under current parameters
    pub log_probs: Vec<f32>,
    /// Value estimate at each generated position
    pub values: Vec<f32>,
}

/// Per-sequence loss gradients handed back to the policy for one step.
///
/// The trainer differentiates the clipped objective with respect to the
/// recomputed log-probabilities and values; backpropagation into parameters
/// is the backend's business.
pub struct SampleGrads<'a> {
    pub prompt: &'a [Token],
    pub completion: &'a [Token],
    /// d(loss)/d(log-prob) per generated token
    pub d_log_probs: Vec<f32>,
    /// d(loss)/d(value) per generated token
    pub d_values: Vec<f32>,
}

/// A policy that can be queried for log-probabilities but not trained.
pub trait ReferencePolicy: Send {
    /// Log-probability of each completion token given the preceding context.
    fn log_probs(&self, prompt: &[Token], completion: &[Token]) -> Result<Vec<f32>>;
}

/// A trainable generation policy with a value head.
pub trait TrainablePolicy: ReferencePolicy {
    fn vocab_size(&self) -> usize;

    /// End-of-sequence token; generation stops when it is emitted.
    fn eos_token(&self) -> Token;

    /// One autoregressive step over a non-empty context.
    fn next_token(&self, context: &[Token]) -> Result<TokenOutput>;

    /// Recompute log-probabilities and values for a stored sequence.
    fn evaluate(&self, prompt: &[Token], completion: &[Token]) -> Result<TokenEval>;

    /// Apply a single joint policy/value parameter update from per-token
    /// loss gradients.
    fn apply_gradients(&mut self, batch: &[SampleGrads<'_>]) -> Result<()>;

    /// Capture a frozen read-only snapshot for KL reference queries.
    fn snapshot(&self) -> Box<dyn ReferencePolicy>;
}

/// Text encoding seam between prompt strings and policy tokens.
pub trait Tokenizer: Send {
    fn encode(&self, text: &str) -> Vec<Token>;
    fn decode(&self, tokens: &[Token]) -> String;

    /// Serialized artifact sufficient to reload the tokenizer, stored next
    /// to policy weights in checkpoints.
    fn artifact(&self) -> Vec<u8>;
}
