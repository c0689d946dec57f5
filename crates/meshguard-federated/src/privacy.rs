//! Differential privacy: per-update clipping, Gaussian noise, and the
//! running (epsilon, delta) budget accountant

use meshguard_common::config::DpConfig;
use meshguard_common::{Error, Result};
use parking_lot::Mutex;
use rand_distr::{Distribution, Normal};
use tracing::{debug, warn};

/// Differential-privacy engine shared by all rounds of one aggregator
pub struct DpEngine {
    config: DpConfig,
    epsilon_spent: Mutex<f64>,
}

impl DpEngine {
    pub fn new(config: DpConfig) -> Self {
        DpEngine {
            config,
            epsilon_spent: Mutex::new(0.0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn epsilon_spent(&self) -> f64 {
        *self.epsilon_spent.lock()
    }

    pub fn delta(&self) -> f64 {
        self.config.delta
    }

    /// Whether another round can still be admitted
    pub fn exhausted(&self) -> bool {
        self.config.enabled
            && *self.epsilon_spent.lock() + self.config.epsilon_per_round
                > self.config.epsilon_budget + 1e-12
    }

    /// Admit a new round or refuse because the budget is spent. Call at
    /// round open; the actual charge happens on publish.
    pub fn admit_round(&self) -> Result<()> {
        if self.exhausted() {
            warn!(
                spent = self.epsilon_spent(),
                budget = self.config.epsilon_budget,
                "privacy budget exhausted, refusing round"
            );
            return Err(Error::BudgetExhausted(format!(
                "epsilon spent {:.3} of {:.3}",
                self.epsilon_spent(),
                self.config.epsilon_budget
            )));
        }
        Ok(())
    }

    /// Charge one round's epsilon after a successful publish
    pub fn charge_round(&self) {
        if !self.config.enabled {
            return;
        }
        let mut spent = self.epsilon_spent.lock();
        *spent += self.config.epsilon_per_round;
        debug!(spent = *spent, "privacy budget charged");
    }

    /// Clip an update to the configured L2 norm in place
    pub fn clip(&self, update: &mut [f64]) {
        if !self.config.enabled {
            return;
        }
        let norm = update.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > self.config.clip_norm && norm > 0.0 {
            let factor = self.config.clip_norm / norm;
            for v in update.iter_mut() {
                *v *= factor;
            }
        }
    }

    /// Add calibrated Gaussian noise to the aggregate in place
    pub fn add_noise(&self, aggregate: &mut [f64]) -> Result<()> {
        if !self.config.enabled || self.config.noise_sigma == 0.0 {
            return Ok(());
        }
        let normal = Normal::new(0.0, self.config.noise_sigma)
            .map_err(|e| Error::Internal(format!("bad noise parameters: {}", e)))?;
        let mut rng = rand::thread_rng();
        for v in aggregate.iter_mut() {
            *v += normal.sample(&mut rng);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool) -> DpConfig {
        DpConfig {
            enabled,
            clip_norm: 1.0,
            noise_sigma: 0.01,
            epsilon_budget: 1.0,
            epsilon_per_round: 0.1,
            delta: 1e-5,
        }
    }

    #[test]
    fn clipping_caps_the_l2_norm() {
        let engine = DpEngine::new(config(true));
        let mut update = vec![3.0, 4.0]; // norm 5
        engine.clip(&mut update);
        let norm = update.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
        // Direction preserved
        assert!((update[0] / update[1] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn short_vectors_are_untouched() {
        let engine = DpEngine::new(config(true));
        let mut update = vec![0.3, 0.4]; // norm 0.5
        engine.clip(&mut update);
        assert_eq!(update, vec![0.3, 0.4]);
    }

    #[test]
    fn budget_admits_exactly_ten_rounds() {
        let engine = DpEngine::new(config(true));
        for round in 0..10 {
            assert!(engine.admit_round().is_ok(), "round {} refused early", round);
            engine.charge_round();
        }
        let err = engine.admit_round().unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted(_)));
        assert!(engine.exhausted());
        assert!((engine.epsilon_spent() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_engine_never_exhausts() {
        let engine = DpEngine::new(config(false));
        for _ in 0..100 {
            assert!(engine.admit_round().is_ok());
            engine.charge_round();
        }
        assert!(!engine.exhausted());
        assert_eq!(engine.epsilon_spent(), 0.0);
    }

    #[test]
    fn noise_perturbs_but_stays_finite() {
        let engine = DpEngine::new(config(true));
        let mut aggregate = vec![0.0; 256];
        engine.add_noise(&mut aggregate).unwrap();
        assert!(aggregate.iter().all(|v| v.is_finite()));
        assert!(aggregate.iter().any(|v| *v != 0.0));
    }
}
