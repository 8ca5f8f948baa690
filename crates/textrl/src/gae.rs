//! Advantage estimation.
//!
//! Per-token rewards are the KL penalty against the reference policy, plus
//! the scored terminal reward at the final generated position. Advantages
//! and returns come from generalized advantage estimation run backward over
//! the response. Everything here is deterministic given identical inputs.

use crate::rollout::Rollout;
use crate::store::TrainSample;
use crate::utils::mean;
use crate::{Result, TextRlError};

/// Build the per-token reward sequence for one rollout.
///
/// Every generated position is charged `kl_coef` times the per-token KL,
/// approximated as (policy log-prob − reference log-prob); the last position
/// additionally receives the scaled terminal score.
pub fn kl_penalized_rewards(
    score: f32,
    log_probs: &[f32],
    ref_log_probs: &[f32],
    kl_coef: f32,
) -> Vec<f32> {
    let mut rewards: Vec<f32> = log_probs
        .iter()
        .zip(ref_log_probs)
        .map(|(lp, ref_lp)| -kl_coef * (lp - ref_lp))
        .collect();
    if let Some(last) = rewards.last_mut() {
        *last += score;
    }
    rewards
}

/// Backward GAE over one response.
///
/// `delta_t = r_t + gamma * v_{t+1} - v_t` with the value past the end
/// treated as zero, `a_t = delta_t + gamma * lam * a_{t+1}`, and
/// `return_t = a_t + v_t`.
pub fn gae_advantages(
    rewards: &[f32],
    values: &[f32],
    gamma: f32,
    lam: f32,
) -> (Vec<f32>, Vec<f32>) {
    let n = rewards.len();
    let mut advantages = vec![0.0f32; n];
    let mut last_gae = 0.0f32;

    for t in (0..n).rev() {
        let next_value = if t + 1 < n { values[t + 1] } else { 0.0 };
        let delta = rewards[t] + gamma * next_value - values[t];
        last_gae = delta + gamma * lam * last_gae;
        advantages[t] = last_gae;
    }

    let returns = advantages
        .iter()
        .zip(values)
        .map(|(a, v)| a + v)
        .collect();
    (advantages, returns)
}

/// Enrich a scored rollout into a train-ready sample.
///
/// Fails with a numeric-instability error if any estimate comes out
/// non-finite, so NaNs never reach the optimizer.
pub fn estimate(rollout: Rollout, kl_coef: f32, gamma: f32, lam: f32) -> Result<TrainSample> {
    let kl: Vec<f32> = rollout
        .log_probs
        .iter()
        .zip(&rollout.ref_log_probs)
        .map(|(lp, ref_lp)| lp - ref_lp)
        .collect();

    let rewards = kl_penalized_rewards(
        rollout.score,
        &rollout.log_probs,
        &rollout.ref_log_probs,
        kl_coef,
    );
    let (advantages, returns) = gae_advantages(&rewards, &rollout.values, gamma, lam);

    let finite = advantages.iter().chain(&returns).all(|x| x.is_finite());
    if !finite {
        return Err(TextRlError::NumericInstability {
            quantity: "advantage".into(),
            round: 0,
            epoch: 0,
            chunk: 0,
        });
    }

    Ok(TrainSample {
        mean_kl: mean(&kl),
        prompt: rollout.prompt,
        response: rollout.response,
        log_probs: rollout.log_probs,
        values: rollout.values,
        rewards,
        advantages,
        returns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_token_degenerates() {
        // At sequence length 1: return == reward, advantage == reward - value
        let (advantages, returns) = gae_advantages(&[2.0], &[0.5], 0.99, 0.95);
        assert!((returns[0] - 2.0).abs() < 1e-6);
        assert!((advantages[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_returns_are_reward_suffix_sums_at_gamma_lam_one() {
        let rewards = vec![0.1, -0.2, 1.0];
        let values = vec![0.3, 0.4, 0.5];
        let (_, returns) = gae_advantages(&rewards, &values, 1.0, 1.0);
        assert!((returns[0] - 0.9).abs() < 1e-6);
        assert!((returns[1] - 0.8).abs() < 1e-6);
        assert!((returns[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_lambda_is_one_step_td() {
        let rewards = vec![1.0, 1.0];
        let values = vec![0.5, 0.25];
        let (advantages, _) = gae_advantages(&rewards, &values, 0.9, 0.0);
        assert!((advantages[0] - (1.0 + 0.9 * 0.25 - 0.5)).abs() < 1e-6);
        assert!((advantages[1] - (1.0 - 0.25)).abs() < 1e-6);
    }

    #[test]
    fn test_kl_penalty_placement() {
        let rewards = kl_penalized_rewards(1.0, &[-1.0, -2.0], &[-1.5, -1.0], 0.1);
        // kl_0 = 0.5, kl_1 = -1.0
        assert!((rewards[0] - (-0.05)).abs() < 1e-6);
        assert!((rewards[1] - (1.0 + 0.1)).abs() < 1e-6);
    }

    #[test]
    fn test_estimate_rejects_non_finite() {
        let rollout = Rollout {
            prompt: vec![0],
            response: vec![1],
            log_probs: vec![f32::NAN],
            ref_log_probs: vec![-1.0],
            values: vec![0.0],
            score: 1.0,
        };
        let err = estimate(rollout, 0.1, 1.0, 1.0).unwrap_err();
        assert!(matches!(err, TextRlError::NumericInstability { .. }));
    }

    #[test]
    fn test_estimate_is_deterministic() {
        let rollout = || Rollout {
            prompt: vec![0],
            response: vec![1, 2],
            log_probs: vec![-1.0, -2.0],
            ref_log_probs: vec![-1.1, -1.9],
            values: vec![0.2, 0.1],
            score: 0.7,
        };
        let a = estimate(rollout(), 0.05, 1.0, 0.95).unwrap();
        let b = estimate(rollout(), 0.05, 1.0, 0.95).unwrap();
        assert_eq!(a.advantages, b.advantages);
        assert_eq!(a.returns, b.returns);
    }
}
