//! Checkpoint state and trait definitions.

use serde::{Deserialize, Serialize};

use crate::{Result, TextRlError};

/// Components whose state can be saved and restored as bytes.
pub trait Checkpointable {
    /// Serialize the component's state to bytes.
    fn save_state(&self) -> Result<Vec<u8>>;

    /// Restore the component's state from bytes.
    fn load_state(&mut self, data: &[u8]) -> Result<()>;
}

/// Run bookkeeping stored alongside policy weights, enough to resume
/// training or compare checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunState {
    /// Generation round the checkpoint was taken at
    pub round: u64,
    /// Optimization steps completed
    pub global_step: u64,
    /// KL penalty coefficient at checkpoint time
    pub kl_coef: f64,
    /// Mean evaluation reward at checkpoint time
    pub eval_reward: f64,
    /// Library version that wrote the checkpoint
    pub version: String,
}

impl RunState {
    pub fn new(round: u64, global_step: u64, kl_coef: f64, eval_reward: f64) -> Self {
        Self {
            round,
            global_step,
            kl_coef,
            eval_reward,
            version: crate::VERSION.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| TextRlError::Persistence(format!("failed to serialize run state: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| TextRlError::Persistence(format!("failed to parse run state: {e}")))
    }
}
