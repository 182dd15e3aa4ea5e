use std::sync::Arc;

use crate::error::EpResult;
use crate::specfun::SpecialFunctions;

use super::{EvalStats, Moments, ScalarPotential, SiteDensity, check_inputs, require};

fn check_label(label: f64) -> EpResult<()> {
    require(label == 1.0 || label == -1.0, || {
        format!("probit label must be +1 or -1, got {label}")
    })
}

/// Probit likelihood Φ(y (s + b) / √v) with label y ∈ {−1, +1}.
///
/// `noise_variance = 0` is the hard step 1{y (s + b) > 0}.
#[derive(Clone)]
pub struct ProbitPotential {
    label: f64,
    bias: f64,
    noise_variance: f64,
    specfun: Arc<dyn SpecialFunctions>,
}

impl std::fmt::Debug for ProbitPotential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbitPotential")
            .field("label", &self.label)
            .field("bias", &self.bias)
            .field("noise_variance", &self.noise_variance)
            .finish()
    }
}

impl ProbitPotential {
    pub fn new(
        label: f64,
        bias: f64,
        noise_variance: f64,
        specfun: Arc<dyn SpecialFunctions>,
    ) -> EpResult<Self> {
        check_label(label)?;
        require(bias.is_finite(), || format!("probit bias must be finite, got {bias}"))?;
        require(noise_variance.is_finite() && noise_variance >= 0.0, || {
            format!("probit noise variance must be finite and >= 0, got {noise_variance}")
        })?;
        Ok(Self {
            label,
            bias,
            noise_variance,
            specfun,
        })
    }
}

impl ScalarPotential for ProbitPotential {
    fn name(&self) -> &'static str {
        "probit"
    }

    fn moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments> {
        check_inputs(cavity_mean, cavity_variance)?;
        let v = cavity_variance + self.noise_variance;
        let sd = v.sqrt();
        let z = self.label * (cavity_mean + self.bias) / sd;
        let log_z = self.specfun.log_normal_cdf(z);
        let r = self.specfun.inverse_mills(z);
        Moments::checked(
            log_z,
            self.label * r / sd,
            -r * (z + r) / v,
            EvalStats::default(),
        )
    }
}

/// Raw probit density, used to cross-check the closed form by quadrature.
#[derive(Clone)]
pub struct ProbitDensity {
    label: f64,
    bias: f64,
    noise_variance: f64,
    specfun: Arc<dyn SpecialFunctions>,
}

impl std::fmt::Debug for ProbitDensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbitDensity")
            .field("label", &self.label)
            .field("bias", &self.bias)
            .field("noise_variance", &self.noise_variance)
            .finish()
    }
}

impl ProbitDensity {
    pub fn new(
        label: f64,
        bias: f64,
        noise_variance: f64,
        specfun: Arc<dyn SpecialFunctions>,
    ) -> EpResult<Self> {
        check_label(label)?;
        require(bias.is_finite() && noise_variance >= 0.0, || {
            "probit density needs a finite bias and non-negative noise".to_string()
        })?;
        Ok(Self {
            label,
            bias,
            noise_variance,
            specfun,
        })
    }

    fn is_step(&self) -> bool {
        self.noise_variance == 0.0
    }
}

impl SiteDensity for ProbitDensity {
    fn name(&self) -> &'static str {
        "probit"
    }

    fn log_density(&self, s: f64) -> f64 {
        let a = self.label * (s + self.bias);
        if self.is_step() {
            if a >= 0.0 { 0.0 } else { f64::NEG_INFINITY }
        } else {
            self.specfun.log_normal_cdf(a / self.noise_variance.sqrt())
        }
    }

    fn breakpoints(&self) -> Vec<f64> {
        vec![-self.bias]
    }

    fn has_derivatives(&self) -> bool {
        !self.is_step()
    }

    fn derivatives(&self, s: f64) -> Option<(f64, f64)> {
        if self.is_step() {
            return None;
        }
        let sd = self.noise_variance.sqrt();
        let a = self.label * (s + self.bias) / sd;
        let r = self.specfun.inverse_mills(a);
        Some((self.label * r / sd, -r * (a + r) / self.noise_variance))
    }

    fn proximal(&self, center: f64, _precision: f64) -> Option<f64> {
        // Projection onto the feasible half-line.
        if !self.is_step() {
            return None;
        }
        if self.label * (center + self.bias) >= 0.0 {
            Some(center)
        } else {
            Some(-self.bias)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EpError;
    use crate::specfun::StatrsSpecfun;
    use approx::assert_relative_eq;

    fn probit(label: f64, bias: f64, noise: f64) -> ProbitPotential {
        ProbitPotential::new(label, bias, noise, Arc::new(StatrsSpecfun)).expect("valid")
    }

    #[test]
    fn positive_label_pulls_the_mean_up() {
        let m = probit(1.0, 0.0, 0.0).moments(0.0, 1.0).expect("moments");
        assert!(m.dlogz_dmean > 0.0);
        assert_relative_eq!(m.log_z, 0.5_f64.ln(), epsilon = 1e-12);
        // r(0) = φ(0)/Φ(0) = 2φ(0).
        let r = 2.0 * crate::specfun::normal_pdf(0.0);
        assert_relative_eq!(m.dlogz_dmean, r, max_relative = 1e-12);
        assert_relative_eq!(m.d2logz_dmean2, -r * r, max_relative = 1e-12);
    }

    #[test]
    fn negative_label_mirrors_positive_label() {
        let up = probit(1.0, 0.0, 0.3).moments(0.7, 2.0).expect("moments");
        let down = probit(-1.0, 0.0, 0.3).moments(-0.7, 2.0).expect("moments");
        assert_relative_eq!(up.log_z, down.log_z, epsilon = 1e-12);
        assert_relative_eq!(up.dlogz_dmean, -down.dlogz_dmean, epsilon = 1e-12);
        assert_relative_eq!(up.d2logz_dmean2, down.d2logz_dmean2, epsilon = 1e-12);
    }

    #[test]
    fn moments_stay_finite_deep_in_the_tail() {
        let m = probit(1.0, 0.0, 0.0).moments(-60.0, 1.0).expect("moments");
        assert!(m.log_z < -1000.0);
        assert!(m.dlogz_dmean > 59.0);
        // Tilted variance of a far truncated normal stays positive.
        assert!(1.0 + m.d2logz_dmean2 > 0.0);
    }

    #[test]
    fn label_must_be_signed_unit() {
        assert!(matches!(
            ProbitPotential::new(0.5, 0.0, 0.0, Arc::new(StatrsSpecfun)),
            Err(EpError::InvalidSpecification(_))
        ));
    }
}
