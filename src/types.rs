use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{EpError, EpResult};

/// Order in which the driver visits sites within a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepOrder {
    #[default]
    Fixed,
    Random,
    Priority,
}

/// Runtime choice of quadrature backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuadratureBackend {
    #[default]
    Standard,
    CompatibilityMode,
}

pub fn default_damping() -> f64 {
    1.0
}

pub fn default_convergence_tolerance() -> f64 {
    1e-6
}

pub fn default_max_sweeps() -> usize {
    50
}

pub fn default_max_retry() -> usize {
    4
}

pub fn default_retry_damping_shrink() -> f64 {
    0.5
}

pub fn default_seed() -> u64 {
    0x5eed
}

pub fn default_min_change_for_priority() -> f64 {
    0.0
}

/// Driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpConfig {
    #[serde(default)]
    pub sweep_order: SweepOrder,
    /// Fraction η ∈ (0, 1] of the full natural-parameter step taken per update.
    #[serde(default = "default_damping")]
    pub damping: f64,
    /// Largest change of any marginal mean or variance accepted as converged.
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,
    #[serde(default = "default_max_sweeps")]
    pub max_sweeps: usize,
    /// Rejected updates are retried this many times with a shrunken damping.
    #[serde(default = "default_max_retry")]
    pub max_retry_on_rejected_update: usize,
    #[serde(default = "default_retry_damping_shrink")]
    pub retry_damping_shrink: f64,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Rebuild the representation from scratch after every sweep.
    #[serde(default)]
    pub refresh_each_sweep: bool,
    /// Priority order treats changes at or below this as "no change".
    #[serde(default = "default_min_change_for_priority")]
    pub min_change_for_priority: f64,
}

impl Default for EpConfig {
    fn default() -> Self {
        Self {
            sweep_order: SweepOrder::Fixed,
            damping: default_damping(),
            convergence_tolerance: default_convergence_tolerance(),
            max_sweeps: default_max_sweeps(),
            max_retry_on_rejected_update: default_max_retry(),
            retry_damping_shrink: default_retry_damping_shrink(),
            parallel: false,
            seed: default_seed(),
            refresh_each_sweep: false,
            min_change_for_priority: default_min_change_for_priority(),
        }
    }
}

impl EpConfig {
    pub fn validate(&self) -> EpResult<()> {
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(EpError::InvalidSpecification(format!(
                "damping must lie in (0, 1], got {}",
                self.damping
            )));
        }
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance > 0.0) {
            return Err(EpError::InvalidSpecification(format!(
                "convergence_tolerance must be positive, got {}",
                self.convergence_tolerance
            )));
        }
        if self.max_sweeps == 0 {
            return Err(EpError::InvalidSpecification(
                "max_sweeps must be at least 1".to_string(),
            ));
        }
        if !(self.retry_damping_shrink > 0.0 && self.retry_damping_shrink < 1.0) {
            return Err(EpError::InvalidSpecification(format!(
                "retry_damping_shrink must lie in (0, 1), got {}",
                self.retry_damping_shrink
            )));
        }
        if !(self.min_change_for_priority >= 0.0) {
            return Err(EpError::InvalidSpecification(format!(
                "min_change_for_priority must be non-negative, got {}",
                self.min_change_for_priority
            )));
        }
        Ok(())
    }
}

pub fn default_rel_tolerance() -> f64 {
    1e-10
}

pub fn default_abs_tolerance() -> f64 {
    1e-13
}

pub fn default_max_subdivisions() -> usize {
    200
}

pub fn default_retry_relaxation() -> f64 {
    1e3
}

/// Accuracy and budget for every quadrature job issued by a potential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuadratureOptions {
    #[serde(default)]
    pub backend: QuadratureBackend,
    #[serde(default = "default_rel_tolerance")]
    pub rel_tolerance: f64,
    #[serde(default = "default_abs_tolerance")]
    pub abs_tolerance: f64,
    #[serde(default = "default_max_subdivisions")]
    pub max_subdivisions: usize,
    /// Tolerance multiplier for the single retry after non-convergence.
    #[serde(default = "default_retry_relaxation")]
    pub retry_relaxation: f64,
    #[serde(default)]
    pub trace: bool,
}

impl Default for QuadratureOptions {
    fn default() -> Self {
        Self {
            backend: QuadratureBackend::Standard,
            rel_tolerance: default_rel_tolerance(),
            abs_tolerance: default_abs_tolerance(),
            max_subdivisions: default_max_subdivisions(),
            retry_relaxation: default_retry_relaxation(),
            trace: false,
        }
    }
}

impl QuadratureOptions {
    pub fn validate(&self) -> EpResult<()> {
        if !(self.rel_tolerance > 0.0 && self.abs_tolerance >= 0.0) {
            return Err(EpError::InvalidSpecification(format!(
                "quadrature tolerances must be positive (rel {}, abs {})",
                self.rel_tolerance, self.abs_tolerance
            )));
        }
        if self.max_subdivisions == 0 {
            return Err(EpError::InvalidSpecification(
                "max_subdivisions must be at least 1".to_string(),
            ));
        }
        if !(self.retry_relaxation >= 1.0) {
            return Err(EpError::InvalidSpecification(format!(
                "retry_relaxation must be >= 1, got {}",
                self.retry_relaxation
            )));
        }
        Ok(())
    }
}

pub fn default_proximal_tolerance() -> f64 {
    1e-10
}

pub fn default_proximal_max_iterations() -> usize {
    50
}

pub fn default_max_step_halving() -> usize {
    30
}

pub fn default_min_step_size() -> f64 {
    1e-12
}

/// Budget of the proximal Newton sub-solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximalOptions {
    /// Gradient tolerance, scaled by max(1, |precision · x|).
    #[serde(default = "default_proximal_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_proximal_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_step_halving")]
    pub max_step_halving: usize,
    #[serde(default = "default_min_step_size")]
    pub min_step_size: f64,
}

impl Default for ProximalOptions {
    fn default() -> Self {
        Self {
            tolerance: default_proximal_tolerance(),
            max_iterations: default_proximal_max_iterations(),
            max_step_halving: default_max_step_halving(),
            min_step_size: default_min_step_size(),
        }
    }
}

impl ProximalOptions {
    pub fn validate(&self) -> EpResult<()> {
        if !(self.tolerance > 0.0) {
            return Err(EpError::InvalidSpecification(format!(
                "proximal tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(EpError::InvalidSpecification(
                "proximal max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gaussian belief over one site's linear functional with the site removed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cavity {
    pub mean: f64,
    pub variance: f64,
}

impl Cavity {
    pub fn new(mean: f64, variance: f64) -> Self {
        Self { mean, variance }
    }
}

/// Approximating Gaussian factor of one site in natural parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SiteFactor {
    pub tau: f64,
    pub nu: f64,
}

impl SiteFactor {
    pub fn new(tau: f64, nu: f64) -> Self {
        Self { tau, nu }
    }

    /// Convex combination (1 - η) · self + η · target.
    pub fn damped_towards(&self, target: SiteFactor, eta: f64) -> SiteFactor {
        SiteFactor {
            tau: (1.0 - eta) * self.tau + eta * target.tau,
            nu: (1.0 - eta) * self.nu + eta * target.nu,
        }
    }
}

/// Joint marginal means and variances of every model variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marginals {
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
}

impl Marginals {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Largest absolute change of any mean or variance between two states.
    pub fn max_change(&self, other: &Marginals) -> f64 {
        let mean = self
            .mean
            .iter()
            .zip(other.mean.iter())
            .map(|(a, b)| (a - b).abs());
        let var = self
            .variance
            .iter()
            .zip(other.variance.iter())
            .map(|(a, b)| (a - b).abs());
        mean.chain(var).fold(0.0_f64, |acc, d| {
            if d.is_nan() { f64::INFINITY } else { acc.max(d) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn defaults_validate() {
        assert!(EpConfig::default().validate().is_ok());
        assert!(QuadratureOptions::default().validate().is_ok());
        assert!(ProximalOptions::default().validate().is_ok());
    }

    #[test]
    fn damping_outside_unit_interval_is_rejected() {
        for bad in [0.0, -0.1, 1.5, f64::NAN] {
            let cfg = EpConfig {
                damping: bad,
                ..EpConfig::default()
            };
            assert!(matches!(
                cfg.validate(),
                Err(EpError::InvalidSpecification(_))
            ));
        }
    }

    #[test]
    fn damped_factor_interpolates() {
        let old = SiteFactor::new(1.0, 2.0);
        let new = old.damped_towards(SiteFactor::new(3.0, -2.0), 0.25);
        assert_relative_eq!(new.tau, 1.5, epsilon = 1e-15);
        assert_relative_eq!(new.nu, 1.0, epsilon = 1e-15);
    }

    #[test]
    fn max_change_covers_means_and_variances() {
        let a = Marginals {
            mean: array![0.0, 1.0],
            variance: array![1.0, 1.0],
        };
        let b = Marginals {
            mean: array![0.1, 1.0],
            variance: array![1.0, 0.5],
        };
        assert_relative_eq!(a.max_change(&b), 0.5, epsilon = 1e-15);
        let nan = Marginals {
            mean: array![f64::NAN, 1.0],
            variance: array![1.0, 1.0],
        };
        assert!(a.max_change(&nan).is_infinite());
    }
}
