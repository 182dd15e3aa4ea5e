use crate::error::EpResult;
use crate::specfun::log_gaussian_density;

use super::{EvalStats, Moments, ScalarPotential, SiteDensity, check_inputs, require};

/// Gaussian observation N(y; s, σ²).
#[derive(Debug, Clone)]
pub struct GaussianPotential {
    observation: f64,
    variance: f64,
}

impl GaussianPotential {
    pub fn new(observation: f64, variance: f64) -> EpResult<Self> {
        require(observation.is_finite(), || {
            format!("gaussian observation must be finite, got {observation}")
        })?;
        require(variance.is_finite() && variance > 0.0, || {
            format!("gaussian variance must be finite and > 0, got {variance}")
        })?;
        Ok(Self {
            observation,
            variance,
        })
    }
}

impl ScalarPotential for GaussianPotential {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments> {
        check_inputs(cavity_mean, cavity_variance)?;
        let v = cavity_variance + self.variance;
        let log_z = log_gaussian_density(self.observation, cavity_mean, v);
        Moments::checked(
            log_z,
            (self.observation - cavity_mean) / v,
            -1.0 / v,
            EvalStats::default(),
        )
    }
}

impl SiteDensity for GaussianPotential {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn log_density(&self, s: f64) -> f64 {
        log_gaussian_density(self.observation, s, self.variance)
    }

    fn has_derivatives(&self) -> bool {
        true
    }

    fn derivatives(&self, s: f64) -> Option<(f64, f64)> {
        Some(((self.observation - s) / self.variance, -1.0 / self.variance))
    }
}
