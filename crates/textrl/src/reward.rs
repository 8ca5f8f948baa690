//! Reward scoring adapter.
//!
//! Wraps the external reward function, feeding it completions in batches
//! sized to the scorer's own throughput rather than the rollout count, then
//! applies the configured scaling and a symmetric outlier clip.

use crate::config::{PpoConfig, RewardScaling};
use crate::utils::RunningMoments;
use crate::{Result, TextRlError};

/// External reward function: decoded completions in, one scalar per
/// completion out. Must be pure with respect to training state.
pub trait RewardFn: Send {
    fn score(&self, samples: &[String]) -> Result<Vec<f32>>;
}

impl<F> RewardFn for F
where
    F: Fn(&[String]) -> Result<Vec<f32>> + Send,
{
    fn score(&self, samples: &[String]) -> Result<Vec<f32>> {
        self(samples)
    }
}

/// Scorer adapter owning its normalization state.
pub struct RewardScorer {
    reward_fn: Box<dyn RewardFn>,
    /// Throughput batch size of the external scorer
    batch_size: usize,
    scaling: RewardScaling,
    ref_mean: Option<f32>,
    ref_std: Option<f32>,
    clip: f32,
    /// Running statistics for `running` scaling. Instance state, never
    /// global, so concurrent runs keep independent normalizers.
    moments: RunningMoments,
}

impl RewardScorer {
    pub fn new(reward_fn: Box<dyn RewardFn>, batch_size: usize, method: &PpoConfig) -> Self {
        Self {
            reward_fn,
            batch_size: batch_size.max(1),
            scaling: method.scale_reward,
            ref_mean: method.ref_mean,
            ref_std: method.ref_std,
            clip: method.cliprange_reward,
            moments: RunningMoments::new(),
        }
    }

    /// Score a round's completions.
    ///
    /// Any scorer failure fails the whole round; rewards are never silently
    /// defaulted.
    pub fn score(&mut self, samples: &[String]) -> Result<Vec<f32>> {
        let raw = self.score_raw(samples)?;
        let scaled = self.scale(raw);
        Ok(scaled
            .into_iter()
            .map(|r| r.clamp(-self.clip, self.clip))
            .collect())
    }

    /// Score without scaling, clipping, or statistics updates. Used for
    /// held-out evaluation, where the raw reward is the quantity of record.
    pub fn score_raw(&self, samples: &[String]) -> Result<Vec<f32>> {
        let mut raw = Vec::with_capacity(samples.len());
        for batch in samples.chunks(self.batch_size) {
            let scores = self.reward_fn.score(batch)?;
            if scores.len() != batch.len() {
                return Err(TextRlError::Scoring(format!(
                    "reward function returned {} scores for {} samples",
                    scores.len(),
                    batch.len()
                )));
            }
            if let Some(bad) = scores.iter().find(|s| !s.is_finite()) {
                return Err(TextRlError::Scoring(format!(
                    "reward function returned non-finite score {bad}"
                )));
            }
            raw.extend(scores);
        }
        Ok(raw)
    }

    fn scale(&mut self, raw: Vec<f32>) -> Vec<f32> {
        match self.scaling {
            // `ignore` disables all normalization; ref_mean/ref_std are not
            // consulted in this mode.
            RewardScaling::None | RewardScaling::Ignore => raw,
            RewardScaling::Running => {
                self.moments.update(&raw);
                let mean = self.ref_mean.unwrap_or(self.moments.mean);
                let std = self.ref_std.unwrap_or(self.moments.std).max(1e-8);
                raw.into_iter().map(|r| (r - mean) / std).collect()
            }
        }
    }

    /// Current running mean/std, for metric logging.
    pub fn moments(&self) -> (f32, f32) {
        (self.moments.mean, self.moments.std)
    }
}
