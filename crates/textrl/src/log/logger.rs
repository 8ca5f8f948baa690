//! Metric sinks for the training loop.

use serde::Serialize;

/// One generation round's worth of training metrics, emitted after the
/// round's optimization passes and KL update.
#[derive(Clone, Debug, Serialize)]
pub struct RoundMetrics {
    pub round: u64,
    /// Optimization steps completed so far
    pub step: u64,
    /// Mean scaled reward over the round's rollouts
    pub reward_mean: f64,
    /// Batch-mean per-token KL against the reference policy
    pub kl_observed: f64,
    /// Penalty coefficient after this round's controller update
    pub kl_coef: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub total_loss: f64,
    /// Mean drift of stored log-probs under current parameters
    pub approx_kl: f64,
}

/// Sink for training metrics. One call per round, plus evaluation results
/// on their own cadence.
pub trait MetricLogger: Send {
    fn log_round(&mut self, metrics: &RoundMetrics);

    /// Record a held-out evaluation result.
    fn log_eval(&mut self, step: u64, reward: f64);

    /// Flush any pending writes.
    fn close(&mut self) {}
}

/// Discards everything (default).
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_round(&mut self, _metrics: &RoundMetrics) {}
    fn log_eval(&mut self, _step: u64, _reward: f64) {}
}

/// Fans every record out to several sinks, e.g. console plus a metrics
/// file for the same run.
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }
}

impl MetricLogger for CompositeLogger {
    fn log_round(&mut self, metrics: &RoundMetrics) {
        for logger in &mut self.loggers {
            logger.log_round(metrics);
        }
    }

    fn log_eval(&mut self, step: u64, reward: f64) {
        for logger in &mut self.loggers {
            logger.log_eval(step, reward);
        }
    }

    fn close(&mut self) {
        for logger in &mut self.loggers {
            logger.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        rounds: Arc<Mutex<Vec<u64>>>,
        evals: Arc<Mutex<Vec<f64>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl MetricLogger for Recorder {
        fn log_round(&mut self, metrics: &RoundMetrics) {
            self.rounds.lock().unwrap().push(metrics.round);
        }
        fn log_eval(&mut self, _step: u64, reward: f64) {
            self.evals.lock().unwrap().push(reward);
        }
        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn metrics(round: u64) -> RoundMetrics {
        RoundMetrics {
            round,
            step: round * 4,
            reward_mean: 0.5,
            kl_observed: 0.02,
            kl_coef: 0.05,
            policy_loss: -0.1,
            value_loss: 0.2,
            total_loss: 0.1,
            approx_kl: 0.01,
        }
    }

    #[test]
    fn test_composite_fans_out_to_every_sink() {
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let evals = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));

        let sinks: Vec<Box<dyn MetricLogger>> = (0..2)
            .map(|_| {
                Box::new(Recorder {
                    rounds: rounds.clone(),
                    evals: evals.clone(),
                    closed: closed.clone(),
                }) as Box<dyn MetricLogger>
            })
            .collect();
        let mut composite = CompositeLogger::new(sinks);

        composite.log_round(&metrics(1));
        composite.log_eval(4, 0.9);
        composite.close();

        assert_eq!(*rounds.lock().unwrap(), vec![1, 1]);
        assert_eq!(*evals.lock().unwrap(), vec![0.9, 0.9]);
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_noop_accepts_everything() {
        let mut logger = NoOpLogger;
        logger.log_round(&metrics(3));
        logger.log_eval(12, 1.0);
        logger.close();
    }
}
