//! # TextRL
//!
//! PPO fine-tuning of language-generation policies against a scalar reward.
//!
//! ## Overview
//!
//! TextRL provides:
//! - Policy capability traits (`TrainablePolicy`, `ReferencePolicy`) over an
//!   external generation backend
//! - Rollout generation with top-k/top-p sampling
//! - Reward scoring with running normalization and clipping
//! - GAE advantage estimation with a per-token KL penalty
//! - An adaptive KL controller targeting a desired divergence
//! - The PPO trainer loop with clipped policy/value objectives
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use textrl::prelude::*;
//!
//! let config = TrlConfig::default();
//! let policy = BigramPolicy::new(257, 256, 0.1);
//! let mut trainer = PpoTrainer::new(
//!     config,
//!     policy,
//!     Box::new(ByteTokenizer),
//!     Box::new(|samples: &[String]| Ok(vec![1.0; samples.len()])),
//!     PromptSource::new(vec!["the movie was".into()], true),
//!     vec!["this film".into()],
//! )?;
//! trainer.train()?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod gae;
pub mod kl;
pub mod log;
pub mod policy;
pub mod reward;
pub mod rollout;
pub mod store;
pub mod sync;
pub mod trainer;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointConfig, CheckpointManager, Checkpointable};
    pub use crate::config::{PpoConfig, RewardScaling, TrainConfig, TrlConfig};
    pub use crate::distributed::{DistributedBackend, ThreadDistributedBackend};
    pub use crate::kl::KlController;
    pub use crate::log::{
        CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger, NoOpLogger, RoundMetrics,
    };
    pub use crate::policy::{
        BigramPolicy, ByteTokenizer, ReferencePolicy, SamplingParams, Tokenizer, TrainablePolicy,
    };
    pub use crate::reward::{RewardFn, RewardScorer};
    pub use crate::rollout::{PromptSource, Rollout, RolloutGenerator};
    pub use crate::store::{ExperienceStore, TrainSample};
    pub use crate::sync::{ObjectStore, RemoteUri};
    pub use crate::trainer::PpoTrainer;
    pub use crate::{Result, TextRlError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum TextRlError {
    /// Malformed or type-mismatched configuration, including override merges.
    #[error("configuration error: {0}")]
    Config(String),

    /// Policy backend failure during rollout generation.
    #[error("generation error: {0}")]
    Generation(String),

    /// External reward function failure.
    #[error("scoring error: {0}")]
    Scoring(String),

    /// Non-finite advantage, loss, or KL value.
    #[error("non-finite {quantity} (round {round}, epoch {epoch}, chunk {chunk})")]
    NumericInstability {
        quantity: String,
        round: u64,
        epoch: usize,
        chunk: usize,
    },

    /// Checkpoint write or remote sync failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TextRlError {
    /// Tag a component-level error with the round it occurred in.
    pub fn in_round(self, round: u64) -> Self {
        match self {
            TextRlError::Generation(msg) => {
                TextRlError::Generation(format!("round {round}: {msg}"))
            }
            TextRlError::Scoring(msg) => TextRlError::Scoring(format!("round {round}: {msg}")),
            TextRlError::NumericInstability {
                quantity,
                epoch,
                chunk,
                ..
            } => TextRlError::NumericInstability {
                quantity,
                round,
                epoch,
                chunk,
            },
            other => other,
        }
    }

    /// True for errors that abort the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TextRlError::Persistence(_))
    }
}

pub type Result<T> = core::result::Result<T, TextRlError>;
