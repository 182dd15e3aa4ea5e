use crate::error::EpResult;
use crate::specfun::{log_gaussian_density, log_sum_exp};

use super::{EvalStats, Moments, SiteDensity, require};

/// Closed-form moments of Σ_k w_k N(s; μ_k, v_k) against the cavity N(h, ρ).
///
/// Components may have `v_k = 0` (point masses); each contributes
/// w_k N(h; μ_k, ρ + v_k) to Z. Weights enter as logs so that zero weights
/// are allowed.
pub fn gaussian_mixture_moments(
    log_weights: &[f64],
    means: &[f64],
    variances: &[f64],
    cavity_mean: f64,
    cavity_variance: f64,
) -> EpResult<Moments> {
    let terms: Vec<f64> = log_weights
        .iter()
        .zip(means.iter().zip(variances.iter()))
        .map(|(lw, (mu, v))| lw + log_gaussian_density(cavity_mean, *mu, cavity_variance + v))
        .collect();
    let log_z = log_sum_exp(&terms);
    let mut d1 = 0.0;
    let mut second = 0.0;
    if log_z.is_finite() {
        for (k, term) in terms.iter().enumerate() {
            let r = (term - log_z).exp();
            if r == 0.0 {
                continue;
            }
            let total = cavity_variance + variances[k];
            let g = (means[k] - cavity_mean) / total;
            d1 += r * g;
            second += r * (g * g - 1.0 / total);
        }
    }
    Moments::checked(log_z, d1, second - d1 * d1, EvalStats::default())
}

/// Gaussian mixture density Σ_k w_k N(s; μ_k, v_k), evaluated by quadrature.
#[derive(Debug, Clone)]
pub struct GaussMixtureDensity {
    log_weights: Vec<f64>,
    means: Vec<f64>,
    variances: Vec<f64>,
}

impl GaussMixtureDensity {
    /// Weights are normalized; they must be non-negative with a positive sum.
    pub fn new(weights: &[f64], means: &[f64], variances: &[f64]) -> EpResult<Self> {
        require(
            !weights.is_empty() && weights.len() == means.len() && means.len() == variances.len(),
            || {
                format!(
                    "gauss_mixture needs matching non-empty weights/means/variances ({}, {}, {})",
                    weights.len(),
                    means.len(),
                    variances.len()
                )
            },
        )?;
        require(weights.iter().all(|w| w.is_finite() && *w >= 0.0), || {
            "gauss_mixture weights must be finite and non-negative".to_string()
        })?;
        let total: f64 = weights.iter().sum();
        require(total > 0.0, || "gauss_mixture weights must not all be zero".to_string())?;
        require(means.iter().all(|m| m.is_finite()), || {
            "gauss_mixture means must be finite".to_string()
        })?;
        require(variances.iter().all(|v| v.is_finite() && *v > 0.0), || {
            "gauss_mixture variances must be finite and > 0".to_string()
        })?;
        Ok(Self {
            log_weights: weights.iter().map(|w| (w / total).ln()).collect(),
            means: means.to_vec(),
            variances: variances.to_vec(),
        })
    }

    /// Closed-form moments; the quadrature path is checked against this.
    pub fn exact_moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments> {
        gaussian_mixture_moments(
            &self.log_weights,
            &self.means,
            &self.variances,
            cavity_mean,
            cavity_variance,
        )
    }
}

impl SiteDensity for GaussMixtureDensity {
    fn name(&self) -> &'static str {
        "gauss_mixture"
    }

    fn log_density(&self, s: f64) -> f64 {
        let terms: Vec<f64> = self
            .log_weights
            .iter()
            .zip(self.means.iter().zip(self.variances.iter()))
            .map(|(lw, (mu, v))| lw + log_gaussian_density(s, *mu, *v))
            .collect();
        log_sum_exp(&terms)
    }

    fn breakpoints(&self) -> Vec<f64> {
        // Not kinks: seeding the partition at each component keeps narrow
        // components from being stepped over.
        self.means.clone()
    }
}
