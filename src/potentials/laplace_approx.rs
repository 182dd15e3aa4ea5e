use std::f64::consts::PI;

use crate::error::{EpError, EpResult, NumericalFailure};
use crate::solver::{ProximalObjective, proximal_newton};
use crate::specfun::log_gaussian_density;

use super::quadrature::NegLogDensity;
use super::{EvalStats, Moments, NumericalServices, ScalarPotential, SiteDensity, check_inputs};

/// Laplace approximation of the tilted distribution around its mode.
///
/// The tilted distribution is replaced by N(m, 1/C), where m is the mode of
/// log t(s) + log N(s; h, ρ) and C the negative curvature there, and
/// log Z ≈ L(m) + ½ log(2π / C). The resulting site precision equals the
/// negative curvature of log t at the mode.
#[derive(Debug, Clone)]
pub struct LaplaceApproxPotential<D> {
    tag: &'static str,
    density: D,
    services: NumericalServices,
}

impl<D: SiteDensity> LaplaceApproxPotential<D> {
    pub fn new(density: D, services: NumericalServices) -> EpResult<Self> {
        if !density.has_derivatives() {
            return Err(EpError::InvalidSpecification(format!(
                "Laplace approximation needs a twice-differentiable density; '{}' is not",
                density.name()
            )));
        }
        Ok(Self {
            tag: density.name(),
            density,
            services,
        })
    }

    /// Registers the potential under a tag other than the density's own.
    pub fn with_tag(mut self, tag: &'static str) -> Self {
        self.tag = tag;
        self
    }
}

impl<D: SiteDensity> ScalarPotential for LaplaceApproxPotential<D> {
    fn name(&self) -> &'static str {
        self.tag
    }

    fn moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments> {
        check_inputs(cavity_mean, cavity_variance)?;
        let term = NegLogDensity(&self.density);
        let objective = ProximalObjective {
            term: &term,
            center: cavity_mean,
            precision: 1.0 / cavity_variance,
        };
        let solution = proximal_newton(&objective, cavity_mean, &self.services.proximal_options)?;
        let curvature = solution.curvature;
        if !(curvature.is_finite() && curvature > 0.0) {
            return Err(NumericalFailure::NonFinite {
                quantity: "Laplace curvature",
            }
            .into());
        }
        let mode = solution.argmin;
        let log_z = self.density.log_density(mode)
            + log_gaussian_density(mode, cavity_mean, cavity_variance)
            + 0.5 * (2.0 * PI / curvature).ln();
        let stats = EvalStats {
            proximal_iterations: solution.iterations,
            ..EvalStats::default()
        };
        Moments::from_tilted(
            cavity_mean,
            cavity_variance,
            log_z,
            mode,
            1.0 / curvature,
            stats,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potentials::{GaussianPotential, LaplaceDensity, PoissonExpDensity, project_site};
    use crate::specfun::{SpecialFunctions, StatrsSpecfun};
    use crate::types::Cavity;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn exact_for_gaussian_sites() {
        let density = GaussianPotential::new(1.0, 0.25).expect("valid");
        let pot = LaplaceApproxPotential::new(density.clone(), NumericalServices::default())
            .expect("differentiable");
        let a = pot.moments(-0.5, 2.0).expect("moments");
        let b = ScalarPotential::moments(&density, -0.5, 2.0).expect("closed form");
        assert_relative_eq!(a.log_z, b.log_z, epsilon = 1e-9);
        assert_relative_eq!(a.dlogz_dmean, b.dlogz_dmean, epsilon = 1e-9);
        assert_relative_eq!(a.d2logz_dmean2, b.d2logz_dmean2, epsilon = 1e-9);
    }

    #[test]
    fn site_precision_is_the_rate_at_the_mode() {
        let sf: Arc<dyn SpecialFunctions> = Arc::new(StatrsSpecfun);
        let pot = LaplaceApproxPotential::new(
            PoissonExpDensity::new(3.0, &sf).expect("valid"),
            NumericalServices::default(),
        )
        .expect("differentiable")
        .with_tag("poisson_exp_laplace");
        let cavity = Cavity::new(0.5, 0.8);
        let m = pot.moments(cavity.mean, cavity.variance).expect("moments");
        let mode = m.tilted_mean(cavity);
        let site = project_site(cavity, &m).expect("projection");
        assert_relative_eq!(site.tau, mode.exp(), max_relative = 1e-8);
        assert_eq!(pot.name(), "poisson_exp_laplace");
    }

    #[test]
    fn non_differentiable_density_is_rejected() {
        let laplace = LaplaceDensity::new(1.0, 0.0).expect("valid");
        assert!(matches!(
            LaplaceApproxPotential::new(laplace, NumericalServices::default()),
            Err(EpError::InvalidSpecification(_))
        ));
    }
}
