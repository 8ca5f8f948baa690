//! Run configuration.
//!
//! A run is described by a nested config with flat key groups: `train`,
//! `model`, `tokenizer`, `optimizer`, `scheduler`, and `method`. Overrides
//! supplied at call time are merged key-by-key into the defaults and fail
//! loudly on type mismatches or unknown keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, TextRlError};

/// Training schedule and persistence knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Maximum total sequence length (prompt + generated tokens)
    pub seq_length: usize,
    /// Maximum number of generation rounds
    pub epochs: u64,
    /// Maximum number of optimization steps
    pub total_steps: u64,
    /// Prompt batch size for generation
    pub batch_size: usize,
    /// Save a checkpoint every N rounds
    pub checkpoint_interval: u64,
    /// Run an evaluation pass every N rounds
    pub eval_interval: u64,
    /// Directory for checkpoints
    pub checkpoint_dir: String,
    /// Random seed
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            seq_length: 64,
            epochs: 400,
            total_steps: 100,
            batch_size: 32,
            checkpoint_interval: 500,
            eval_interval: 4,
            checkpoint_dir: "ckpts".to_string(),
            seed: 42,
        }
    }
}

/// Policy backend description. Opaque to the training core; forwarded to
/// whichever backend constructs the policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_path: String,
    pub num_layers_unfrozen: i64,
    /// Parameter-efficient adapter settings (e.g. low-rank adapters)
    pub adapter_kwargs: Value,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: "bigram".to_string(),
            num_layers_unfrozen: -1,
            adapter_kwargs: Value::Null,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub tokenizer_path: String,
    pub truncation_side: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            tokenizer_path: "byte".to_string(),
            truncation_side: "right".to_string(),
        }
    }
}

/// Optimizer selection. The kwargs are opaque numeric knobs surfaced to the
/// policy backend, not interpreted by the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub name: String,
    pub kwargs: Value,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: "sgd".to_string(),
            kwargs: serde_json::json!({ "lr": 0.1 }),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    pub kwargs: Value,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "constant".to_string(),
            kwargs: Value::Null,
        }
    }
}

/// Reward scaling mode applied by the scorer adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardScaling {
    /// Pass rewards through untouched
    None,
    /// Rewards used as-is; running statistics are not even tracked
    Ignore,
    /// Normalize by a running mean/std (or fixed `ref_mean`/`ref_std`)
    Running,
}

/// Generation sampling parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Keep only the k highest-probability tokens (0 disables)
    pub top_k: usize,
    /// Nucleus sampling threshold (1.0 disables)
    pub top_p: f32,
    /// Sample when true, greedy argmax when false
    pub do_sample: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 40,
            top_k: 0,
            top_p: 1.0,
            do_sample: true,
        }
    }
}

/// PPO method hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PpoConfig {
    /// Rollouts generated (and stored) per round
    pub num_rollouts: usize,
    /// Rollouts consumed per optimization step
    pub chunk_size: usize,
    /// Inner passes over the store per round
    pub ppo_epochs: usize,
    /// Initial KL penalty coefficient
    pub init_kl_coef: f64,
    /// Target KL divergence (non-positive fixes the coefficient)
    pub target: f64,
    /// Horizon for the adaptive KL controller
    pub horizon: f64,
    /// Discount factor
    pub gamma: f32,
    /// GAE lambda
    pub lam: f32,
    /// Policy ratio clip range
    pub cliprange: f32,
    /// Value estimate clip range
    pub cliprange_value: f32,
    /// Value loss coefficient
    pub vf_coef: f32,
    pub scale_reward: RewardScaling,
    /// Fixed reference mean for `running` scaling (estimated online if unset)
    pub ref_mean: Option<f32>,
    /// Fixed reference std for `running` scaling (estimated online if unset)
    pub ref_std: Option<f32>,
    /// Symmetric clip magnitude applied to scaled rewards
    pub cliprange_reward: f32,
    pub gen_kwargs: GenerationConfig,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            num_rollouts: 128,
            chunk_size: 128,
            ppo_epochs: 4,
            init_kl_coef: 0.05,
            target: 6.0,
            horizon: 10000.0,
            gamma: 1.0,
            lam: 0.95,
            cliprange: 0.2,
            cliprange_value: 0.2,
            vf_coef: 1.0,
            scale_reward: RewardScaling::Ignore,
            ref_mean: None,
            ref_std: None,
            cliprange_reward: 10.0,
            gen_kwargs: GenerationConfig::default(),
        }
    }
}

/// Complete configuration snapshot for a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrlConfig {
    pub train: TrainConfig,
    pub model: ModelConfig,
    pub tokenizer: TokenizerConfig,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub method: PpoConfig,
}

impl TrlConfig {
    /// Parse a config from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrlConfig = serde_json::from_str(json)
            .map_err(|e| TextRlError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Merge override values into this config.
    ///
    /// Overrides are applied as a nested dictionary merge: objects recurse,
    /// scalars replace. Unknown keys and kind mismatches (e.g. a string
    /// overriding a number, or a scalar overriding a whole group) are
    /// configuration errors, never silently dropped.
    pub fn update(&self, overrides: &Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)
            .map_err(|e| TextRlError::Config(format!("failed to serialize config: {e}")))?;
        merge_value(&mut base, overrides, "")?;
        let merged: TrlConfig = serde_json::from_value(base)
            .map_err(|e| TextRlError::Config(format!("invalid value after merge: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let m = &self.method;
        if m.num_rollouts == 0 {
            return Err(TextRlError::Config("num_rollouts must be positive".into()));
        }
        if m.chunk_size == 0 || m.chunk_size > m.num_rollouts {
            return Err(TextRlError::Config(format!(
                "chunk_size {} must be in 1..={}",
                m.chunk_size, m.num_rollouts
            )));
        }
        if m.ppo_epochs == 0 {
            return Err(TextRlError::Config("ppo_epochs must be positive".into()));
        }
        if m.horizon <= 0.0 {
            return Err(TextRlError::Config("horizon must be positive".into()));
        }
        if !(0.0..1.0).contains(&m.cliprange) || m.cliprange == 0.0 {
            return Err(TextRlError::Config(format!(
                "cliprange {} must be in (0, 1)",
                m.cliprange
            )));
        }
        if m.cliprange_value <= 0.0 {
            return Err(TextRlError::Config(
                "cliprange_value must be positive".into(),
            ));
        }
        if m.cliprange_reward <= 0.0 {
            return Err(TextRlError::Config(
                "cliprange_reward must be positive".into(),
            ));
        }
        if m.gen_kwargs.max_new_tokens == 0 {
            return Err(TextRlError::Config("max_new_tokens must be positive".into()));
        }
        if self.train.seq_length <= m.gen_kwargs.max_new_tokens {
            return Err(TextRlError::Config(format!(
                "seq_length {} leaves no room for {} generated tokens",
                self.train.seq_length, m.gen_kwargs.max_new_tokens
            )));
        }
        if self.train.checkpoint_dir.is_empty() {
            return Err(TextRlError::Config("checkpoint_dir must be set".into()));
        }
        if self.train.eval_interval == 0 || self.train.checkpoint_interval == 0 {
            return Err(TextRlError::Config(
                "eval_interval and checkpoint_interval must be positive".into(),
            ));
        }
        // Zero limits would run no rounds yet still emit a final artifact
        if self.train.epochs == 0 || self.train.total_steps == 0 {
            return Err(TextRlError::Config(
                "epochs and total_steps must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn merge_value(base: &mut Value, overrides: &Value, path: &str) -> Result<()> {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            for (key, over_val) in over_map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match base_map.get_mut(key) {
                    Some(base_val) => merge_value(base_val, over_val, &child_path)?,
                    None => {
                        return Err(TextRlError::Config(format!(
                            "unknown config key `{child_path}`"
                        )))
                    }
                }
            }
            Ok(())
        }
        (Value::Object(_), other) => Err(TextRlError::Config(format!(
            "cannot replace group `{path}` with {}",
            json_kind(other)
        ))),
        (base_val, over_val) => {
            // Null slots (unset optionals, opaque kwargs) accept any value.
            let compatible = matches!(base_val, Value::Null)
                || matches!(over_val, Value::Null)
                || json_kind(base_val) == json_kind(over_val);
            if !compatible {
                return Err(TextRlError::Config(format!(
                    "type mismatch at `{path}`: expected {}, got {}",
                    json_kind(base_val),
                    json_kind(over_val)
                )));
            }
            *base_val = over_val.clone();
            Ok(())
        }
    }
}
