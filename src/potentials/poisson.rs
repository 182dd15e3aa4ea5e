//! Poisson observations with a nonlinear rate link λ(s).
//!
//! Both links are log-concave in s; the tilted mode is found by proximal
//! Newton before integrating.

use std::sync::Arc;

use crate::error::EpResult;
use crate::specfun::{SpecialFunctions, sigmoid, softplus};

use super::{SiteDensity, require};

fn check_count(count: f64) -> EpResult<u64> {
    require(count.is_finite() && count >= 0.0 && count.fract() == 0.0, || {
        format!("poisson count must be a non-negative integer, got {count}")
    })?;
    Ok(count as u64)
}

/// Poisson(y; e^s).
#[derive(Debug, Clone)]
pub struct PoissonExpDensity {
    count: f64,
    log_factorial: f64,
}

impl PoissonExpDensity {
    pub fn new(count: f64, specfun: &Arc<dyn SpecialFunctions>) -> EpResult<Self> {
        let y = check_count(count)?;
        Ok(Self {
            count,
            log_factorial: specfun.log_factorial(y),
        })
    }
}

impl SiteDensity for PoissonExpDensity {
    fn name(&self) -> &'static str {
        "poisson_exp"
    }

    fn log_density(&self, s: f64) -> f64 {
        self.count * s - s.exp() - self.log_factorial
    }

    fn has_derivatives(&self) -> bool {
        true
    }

    fn derivatives(&self, s: f64) -> Option<(f64, f64)> {
        let rate = s.exp();
        Some((self.count - rate, -rate))
    }
}

/// Poisson(y; log(1 + e^s)).
#[derive(Debug, Clone)]
pub struct PoissonLogisticDensity {
    count: f64,
    log_factorial: f64,
}

impl PoissonLogisticDensity {
    pub fn new(count: f64, specfun: &Arc<dyn SpecialFunctions>) -> EpResult<Self> {
        let y = check_count(count)?;
        Ok(Self {
            count,
            log_factorial: specfun.log_factorial(y),
        })
    }

    /// σ(s) / λ(s), which tends to 1 as s → −∞.
    fn slope_ratio(s: f64) -> f64 {
        if s < -35.0 {
            1.0
        } else {
            sigmoid(s) / softplus(s)
        }
    }
}

impl SiteDensity for PoissonLogisticDensity {
    fn name(&self) -> &'static str {
        "poisson_logistic"
    }

    fn log_density(&self, s: f64) -> f64 {
        let rate = softplus(s);
        let count_term = if self.count == 0.0 {
            0.0
        } else {
            self.count * rate.ln()
        };
        count_term - rate - self.log_factorial
    }

    fn has_derivatives(&self) -> bool {
        true
    }

    fn derivatives(&self, s: f64) -> Option<(f64, f64)> {
        let p = sigmoid(s);
        let dp = p * (1.0 - p);
        let ratio = Self::slope_ratio(s);
        let d1 = self.count * ratio - p;
        let rate = softplus(s);
        let ratio_slope = if s < -35.0 {
            0.0
        } else {
            dp / rate - ratio * ratio
        };
        Some((d1, self.count * ratio_slope - dp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specfun::StatrsSpecfun;
    use approx::assert_relative_eq;

    fn sf() -> Arc<dyn SpecialFunctions> {
        Arc::new(StatrsSpecfun)
    }

    fn check_derivatives(d: &dyn SiteDensity, s: f64) {
        let eps = 1e-5;
        let (g, h) = d.derivatives(s).unwrap_or((f64::NAN, f64::NAN));
        let fd1 = (d.log_density(s + eps) - d.log_density(s - eps)) / (2.0 * eps);
        let (g_up, _) = d.derivatives(s + eps).unwrap_or((f64::NAN, f64::NAN));
        let (g_down, _) = d.derivatives(s - eps).unwrap_or((f64::NAN, f64::NAN));
        let fd2 = (g_up - g_down) / (2.0 * eps);
        assert_relative_eq!(g, fd1, epsilon = 1e-6, max_relative = 1e-6);
        assert_relative_eq!(h, fd2, epsilon = 1e-6, max_relative = 1e-6);
    }

    #[test]
    fn exp_link_derivatives_match_finite_differences() {
        let d = PoissonExpDensity::new(4.0, &sf()).expect("valid");
        for &s in &[-2.0, 0.0, 1.3, 3.0] {
            check_derivatives(&d, s);
        }
    }

    #[test]
    fn logistic_link_derivatives_match_finite_differences() {
        let d = PoissonLogisticDensity::new(3.0, &sf()).expect("valid");
        for &s in &[-5.0, -0.4, 0.0, 2.0, 8.0] {
            check_derivatives(&d, s);
        }
    }

    #[test]
    fn log_density_is_a_probability_mass() {
        let d = PoissonExpDensity::new(2.0, &sf()).expect("valid");
        // λ = e^0 = 1: P(2) = e^{-1} / 2.
        assert_relative_eq!(d.log_density(0.0), -1.0 - 2.0_f64.ln(), epsilon = 1e-12);
        let z = PoissonLogisticDensity::new(0.0, &sf()).expect("valid");
        assert!(z.log_density(-800.0).is_finite());
    }

    #[test]
    fn counts_must_be_non_negative_integers() {
        assert!(PoissonExpDensity::new(-1.0, &sf()).is_err());
        assert!(PoissonExpDensity::new(1.5, &sf()).is_err());
        assert!(PoissonLogisticDensity::new(f64::NAN, &sf()).is_err());
    }
}
