use crate::error::EpResult;

use super::{SiteDensity, require};

/// Asymmetric Laplace likelihood of quantile regression:
///
///   t(s) = q (1 − q) / σ · exp(−ρ_q((y − s) / σ)),  ρ_q(u) = u (q − 1{u < 0}).
#[derive(Debug, Clone)]
pub struct QuantileDensity {
    observation: f64,
    quantile: f64,
    scale: f64,
}

impl QuantileDensity {
    pub fn new(observation: f64, quantile: f64, scale: f64) -> EpResult<Self> {
        require(observation.is_finite(), || {
            format!("quantile observation must be finite, got {observation}")
        })?;
        require(quantile > 0.0 && quantile < 1.0, || {
            format!("quantile level must lie in (0, 1), got {quantile}")
        })?;
        require(scale.is_finite() && scale > 0.0, || {
            format!("quantile scale must be finite and > 0, got {scale}")
        })?;
        Ok(Self {
            observation,
            quantile,
            scale,
        })
    }

    fn check_loss(&self, u: f64) -> f64 {
        if u < 0.0 {
            u * (self.quantile - 1.0)
        } else {
            u * self.quantile
        }
    }
}

impl SiteDensity for QuantileDensity {
    fn name(&self) -> &'static str {
        "quantile"
    }

    fn log_density(&self, s: f64) -> f64 {
        let q = self.quantile;
        (q * (1.0 - q) / self.scale).ln() - self.check_loss((self.observation - s) / self.scale)
    }

    fn breakpoints(&self) -> Vec<f64> {
        vec![self.observation]
    }

    fn proximal(&self, center: f64, precision: f64) -> Option<f64> {
        // Below y the loss slope in s is −q/σ; above y it is (1 − q)/σ.
        let below = center + self.quantile / (self.scale * precision);
        if below < self.observation {
            return Some(below);
        }
        let above = center - (1.0 - self.quantile) / (self.scale * precision);
        if above > self.observation {
            return Some(above);
        }
        Some(self.observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn median_reduces_to_symmetric_laplace() {
        let d = QuantileDensity::new(1.0, 0.5, 2.0).expect("valid");
        let up = d.log_density(1.0 + 0.7);
        let down = d.log_density(1.0 - 0.7);
        assert_relative_eq!(up, down, epsilon = 1e-15);
    }

    #[test]
    fn proximal_map_is_stationary() {
        let d = QuantileDensity::new(0.0, 0.2, 1.0).expect("valid");
        let precision = 4.0;
        for &c in &[-3.0, -0.01, 0.0, 0.1, 2.5] {
            let s = d.proximal(c, precision).unwrap_or(f64::NAN);
            // Objective −log t(s) + ½ p (s − c)² is no worse than nearby points.
            let obj = |x: f64| -d.log_density(x) + 0.5 * precision * (x - c).powi(2);
            assert!(obj(s) <= obj(s + 1e-6) + 1e-12, "c={c}");
            assert!(obj(s) <= obj(s - 1e-6) + 1e-12, "c={c}");
        }
    }

    #[test]
    fn density_integrates_to_one() {
        let d = QuantileDensity::new(0.5, 0.9, 0.7).expect("valid");
        let n = 400_000;
        let (lo, hi) = (-60.0, 40.0);
        let h = (hi - lo) / n as f64;
        let sum: f64 = (0..n)
            .map(|i| d.log_density(lo + (i as f64 + 0.5) * h).exp() * h)
            .sum();
        assert_relative_eq!(sum, 1.0, max_relative = 1e-5);
    }

    #[test]
    fn invalid_levels_are_rejected() {
        assert!(QuantileDensity::new(0.0, 0.0, 1.0).is_err());
        assert!(QuantileDensity::new(0.0, 1.0, 1.0).is_err());
        assert!(QuantileDensity::new(0.0, 0.5, 0.0).is_err());
    }
}
