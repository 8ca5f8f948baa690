//! Checkpoint persistence for trained policies.

mod manager;
mod state;

pub use manager::{CheckpointConfig, CheckpointManager, POLICY_FILE, STATE_FILE, TOKENIZER_FILE};
pub use state::{Checkpointable, RunState};
