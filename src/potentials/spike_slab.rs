use crate::error::EpResult;

use super::{Moments, ScalarPotential, check_inputs, gaussian_mixture_moments, require};

/// Spike-and-slab prior (1 − p) δ(s) + p N(s; 0, v), with 0 < p ≤ 1.
///
/// A pure spike pins s to zero; its tilted variance is zero and no Gaussian
/// site can match it.
#[derive(Debug, Clone)]
pub struct SpikeSlabPotential {
    log_weights: [f64; 2],
    slab_variance: f64,
}

impl SpikeSlabPotential {
    pub fn new(slab_probability: f64, slab_variance: f64) -> EpResult<Self> {
        require(slab_probability > 0.0 && slab_probability <= 1.0, || {
            format!("spike_slab probability must lie in (0, 1], got {slab_probability}")
        })?;
        require(slab_variance.is_finite() && slab_variance > 0.0, || {
            format!("spike_slab slab variance must be finite and > 0, got {slab_variance}")
        })?;
        Ok(Self {
            log_weights: [(1.0 - slab_probability).ln(), slab_probability.ln()],
            slab_variance,
        })
    }
}

impl ScalarPotential for SpikeSlabPotential {
    fn name(&self) -> &'static str {
        "spike_slab"
    }

    fn moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments> {
        check_inputs(cavity_mean, cavity_variance)?;
        gaussian_mixture_moments(
            &self.log_weights,
            &[0.0, 0.0],
            &[0.0, self.slab_variance],
            cavity_mean,
            cavity_variance,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EpError;
    use crate::potentials::project_site;
    use crate::specfun::log_gaussian_density;
    use crate::types::Cavity;
    use approx::assert_relative_eq;

    #[test]
    fn pure_slab_is_a_zero_mean_gaussian_site() {
        let pot = SpikeSlabPotential::new(1.0, 2.0).expect("valid");
        let cavity = Cavity::new(0.7, 0.5);
        let m = pot.moments(cavity.mean, cavity.variance).expect("moments");
        let site = project_site(cavity, &m).expect("projection");
        assert_relative_eq!(site.tau, 0.5, max_relative = 1e-12);
        assert_relative_eq!(site.nu, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn nearly_pure_spike_still_projects_to_a_proper_site() {
        let pot = SpikeSlabPotential::new(1e-6, 2.0).expect("valid");
        let cavity = Cavity::new(0.7, 0.5);
        let m = pot.moments(cavity.mean, cavity.variance).expect("moments");
        assert_relative_eq!(
            m.log_z,
            log_gaussian_density(0.0, 0.7, 0.5),
            epsilon = 1e-5
        );
        assert!(m.tilted_mean(cavity).abs() < 1e-5);
        assert!(m.tilted_variance(cavity) > 0.0);
        let site = project_site(cavity, &m).expect("projection");
        assert!(site.tau > 0.0);
    }

    #[test]
    fn pure_spike_is_rejected_at_construction() {
        assert!(matches!(
            SpikeSlabPotential::new(0.0, 2.0),
            Err(EpError::InvalidSpecification(_))
        ));
    }

    #[test]
    fn mixed_prior_shrinks_towards_zero() {
        let pot = SpikeSlabPotential::new(0.5, 4.0).expect("valid");
        let cavity = Cavity::new(1.0, 1.0);
        let m = pot.moments(cavity.mean, cavity.variance).expect("moments");
        let mean = m.tilted_mean(cavity);
        assert!(mean > 0.0 && mean < 1.0);
        assert!(m.tilted_variance(cavity) > 0.0);
    }

    #[test]
    fn probability_outside_unit_interval_is_rejected() {
        assert!(SpikeSlabPotential::new(1.5, 1.0).is_err());
        assert!(SpikeSlabPotential::new(-0.1, 1.0).is_err());
        assert!(SpikeSlabPotential::new(0.5, -1.0).is_err());
    }
}
