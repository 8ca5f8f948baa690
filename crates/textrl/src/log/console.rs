//! Console metric sink.

use super::{MetricLogger, RoundMetrics};

/// Reports each round on one tracing line: reward, realized KL and its
/// coefficient, and the loss breakdown.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_round(&mut self, metrics: &RoundMetrics) {
        tracing::info!(
            round = metrics.round,
            step = metrics.step,
            reward = format!("{:.4}", metrics.reward_mean),
            kl = format!("{:.4}", metrics.kl_observed),
            kl_coef = format!("{:.4}", metrics.kl_coef),
            policy_loss = format!("{:.4}", metrics.policy_loss),
            value_loss = format!("{:.4}", metrics.value_loss),
            loss = format!("{:.4}", metrics.total_loss),
            "Round metrics"
        );
    }

    fn log_eval(&mut self, step: u64, reward: f64) {
        tracing::info!(step, reward = format!("{reward:.4}"), "Eval reward");
    }
}
