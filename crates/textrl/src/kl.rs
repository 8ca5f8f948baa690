//! Adaptive KL penalty control.
//!
//! The penalty coefficient is nudged multiplicatively once per generation
//! round so the realized divergence from the reference policy oscillates
//! around a target, without a fixed schedule.

use serde::{Deserialize, Serialize};

/// Smallest admissible coefficient; keeps the penalty from collapsing.
const KL_COEF_FLOOR: f64 = 1e-8;

/// Proportional errors are clamped to this band before being applied.
const PROPORTIONAL_CLAMP: f64 = 0.2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KlController {
    /// Coefficient chases a target divergence over a horizon of samples.
    Adaptive {
        coef: f64,
        target: f64,
        horizon: f64,
    },
    /// Coefficient never moves.
    Fixed { coef: f64 },
}

impl KlController {
    /// Adaptive controller; a non-positive target degrades to fixed.
    pub fn new(init_kl_coef: f64, target: f64, horizon: f64) -> Self {
        if target > 0.0 {
            KlController::Adaptive {
                coef: init_kl_coef,
                target,
                horizon,
            }
        } else {
            KlController::Fixed { coef: init_kl_coef }
        }
    }

    pub fn kl_coef(&self) -> f64 {
        match self {
            KlController::Adaptive { coef, .. } | KlController::Fixed { coef } => *coef,
        }
    }

    /// Fold one round's batch-mean observed KL into the coefficient.
    ///
    /// `n_steps` is the number of rollouts the observation covers; the
    /// update magnitude scales with the fraction of the horizon consumed.
    pub fn update(&mut self, observed_kl: f64, n_steps: usize) {
        if let KlController::Adaptive {
            coef,
            target,
            horizon,
        } = self
        {
            let proportional_error =
                (observed_kl / *target - 1.0).clamp(-PROPORTIONAL_CLAMP, PROPORTIONAL_CLAMP);
            let mult = 1.0 + proportional_error * n_steps as f64 / *horizon;
            *coef = (*coef * mult).max(KL_COEF_FLOOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_target_leaves_coefficient_unchanged() {
        let mut ctl = KlController::new(0.05, 6.0, 10000.0);
        ctl.update(6.0, 128);
        assert_eq!(ctl.kl_coef(), 0.05);
    }

    #[test]
    fn test_monotone_above_target() {
        let mut ctl = KlController::new(0.05, 6.0, 10000.0);
        let mut prev = ctl.kl_coef();
        for _ in 0..10 {
            ctl.update(9.0, 128);
            assert!(ctl.kl_coef() >= prev);
            prev = ctl.kl_coef();
        }
    }

    #[test]
    fn test_monotone_below_target() {
        let mut ctl = KlController::new(0.05, 6.0, 10000.0);
        let mut prev = ctl.kl_coef();
        for _ in 0..10 {
            ctl.update(1.0, 128);
            assert!(ctl.kl_coef() <= prev);
            prev = ctl.kl_coef();
        }
    }

    #[test]
    fn test_proportional_error_is_clamped() {
        let mut wild = KlController::new(0.05, 6.0, 10000.0);
        let mut mild = KlController::new(0.05, 6.0, 10000.0);
        // 100x over target moves no faster than 1.2x over target
        wild.update(600.0, 128);
        mild.update(7.2, 128);
        assert!((wild.kl_coef() - mild.kl_coef()).abs() < 1e-12);
    }

    #[test]
    fn test_coefficient_floor() {
        let mut ctl = KlController::new(1e-8, 6.0, 1.0);
        for _ in 0..100 {
            ctl.update(0.0, 128);
        }
        assert!(ctl.kl_coef() >= KL_COEF_FLOOR);
    }

    #[test]
    fn test_fixed_controller_never_moves() {
        let mut ctl = KlController::Fixed { coef: 0.1 };
        ctl.update(100.0, 128);
        assert_eq!(ctl.kl_coef(), 0.1);
    }
}
