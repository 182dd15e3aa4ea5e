use crate::error::EpResult;

use super::{SiteDensity, require};

/// Laplace density (τ/2) exp(−τ |s − μ|).
#[derive(Debug, Clone)]
pub struct LaplaceDensity {
    rate: f64,
    location: f64,
}

impl LaplaceDensity {
    pub fn new(rate: f64, location: f64) -> EpResult<Self> {
        require(rate.is_finite() && rate > 0.0, || {
            format!("laplace rate must be finite and > 0, got {rate}")
        })?;
        require(location.is_finite(), || {
            format!("laplace location must be finite, got {location}")
        })?;
        Ok(Self { rate, location })
    }
}

impl SiteDensity for LaplaceDensity {
    fn name(&self) -> &'static str {
        "laplace"
    }

    fn log_density(&self, s: f64) -> f64 {
        (0.5 * self.rate).ln() - self.rate * (s - self.location).abs()
    }

    fn breakpoints(&self) -> Vec<f64> {
        vec![self.location]
    }

    fn proximal(&self, center: f64, precision: f64) -> Option<f64> {
        // Soft thresholding around the location.
        let d = center - self.location;
        let shrink = (d.abs() - self.rate / precision).max(0.0);
        Some(self.location + d.signum() * shrink)
    }
}
