//! Shared numeric helpers.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Epsilon floor used when dividing by a standard deviation.
pub const STD_EPS: f32 = 1e-8;

/// Build the deterministic RNG used throughout a run.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

pub fn mean(xs: &[f32]) -> f32 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f32>() / xs.len() as f32
}

fn variance(xs: &[f32], mean: f32) -> f32 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / xs.len() as f32
}

/// Mean-subtract and std-normalize a sequence.
///
/// When every element is equal the numerator vanishes and the output is all
/// zeros rather than a division blowup.
pub fn whiten(xs: &[f32]) -> Vec<f32> {
    let m = mean(xs);
    let std = (variance(xs, m) + STD_EPS).sqrt();
    xs.iter().map(|x| (x - m) / std).collect()
}

/// Running first and second moments over reward batches.
///
/// Owned by the scorer instance that feeds it, so concurrent runs cannot
/// cross-contaminate normalization statistics.
#[derive(Clone, Debug)]
pub struct RunningMoments {
    pub mean: f32,
    pub std: f32,
    var: f32,
    count: f64,
}

impl Default for RunningMoments {
    fn default() -> Self {
        Self {
            mean: 0.0,
            std: 1.0,
            var: 1.0,
            count: 1e-24,
        }
    }
}

impl RunningMoments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch into the running statistics.
    ///
    /// Returns the batch's own mean and (sample) std.
    pub fn update(&mut self, xs: &[f32]) -> (f32, f32) {
        let n = xs.len() as f64;
        let batch_mean = mean(xs);
        let batch_var = variance(xs, batch_mean);

        let delta = (batch_mean - self.mean) as f64;
        let total = self.count + n;

        let new_sum = batch_var as f64 * n;
        let old_sum = self.var as f64 * self.count + delta * delta * self.count * n / total;

        self.mean += (delta * n / total) as f32;
        self.var = ((old_sum + new_sum) / total) as f32;
        self.std = ((self.var as f64 * total / (total - 1.0).max(1.0)) as f32).sqrt();
        self.count = total;

        let batch_std = if xs.len() > 1 {
            (batch_var * xs.len() as f32 / (xs.len() as f32 - 1.0)).sqrt()
        } else {
            0.0
        };
        (batch_mean, batch_std)
    }
}
