//! Moments of an arbitrary site density by adaptive quadrature.
//!
//! With L(s) = log t(s) + log N(s; h, ρ), the tilted integrals are evaluated
//! after the substitution s = loc + scale · u and a shift c ≈ max L:
//!
//!   J_k = ∫ u^k exp(L(loc + scale · u) − c) du,  k = 0, 1, 2
//!
//! so that log Z = c + log(scale · J₀), the tilted mean is
//! loc + scale · J₁/J₀ and the tilted variance is scale² (J₂/J₀ − (J₁/J₀)²).
//! `loc` is the tilted mode when it can be found, which keeps the integrand
//! centred and of unit width regardless of how far the site pulls the cavity.

use crate::error::{EpError, EpResult, NumericalFailure};
use crate::quadrature::{QuadratureResult, Tolerance};
use crate::solver::{ProximalObjective, proximal_newton};
use crate::specfun::log_gaussian_density;

use super::{EvalStats, Moments, NumericalServices, ScalarPotential, SiteDensity, check_inputs};

/// Probe offsets (in units of `scale`) used to find the shift c.
const PROBE_OFFSETS: [f64; 6] = [-4.0, -2.0, -1.0, 1.0, 2.0, 4.0];

/// Generic numerical potential over a `SiteDensity`.
#[derive(Debug, Clone)]
pub struct QuadraturePotential<D> {
    density: D,
    services: NumericalServices,
}

/// Where and how wide the tilted distribution is believed to be.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Centre {
    pub loc: f64,
    pub scale: f64,
    pub proximal_iterations: usize,
}

/// Negative log-density term for the proximal Newton solver.
pub(crate) struct NegLogDensity<'a, D: ?Sized>(pub &'a D);

impl<D: SiteDensity + ?Sized> crate::solver::SmoothTerm for NegLogDensity<'_, D> {
    fn evaluate(&self, x: f64) -> Option<(f64, f64, f64)> {
        let value = self.0.log_density(x);
        let (g, h) = self.0.derivatives(x)?;
        if value.is_finite() {
            Some((-value, -g, -h))
        } else {
            None
        }
    }
}

/// Tilted mode and local width: closed-form prox, else proximal Newton when
/// derivatives exist, else the cavity itself.
pub(crate) fn locate_tilted_mode<D: SiteDensity + ?Sized>(
    density: &D,
    services: &NumericalServices,
    cavity_mean: f64,
    cavity_variance: f64,
) -> EpResult<Centre> {
    let precision = 1.0 / cavity_variance;
    if let Some(loc) = density.proximal(cavity_mean, precision)
        && loc.is_finite()
    {
        let scale = match density.derivatives(loc) {
            Some((_, h)) if precision - h > 0.0 => 1.0 / (precision - h).sqrt(),
            _ => cavity_variance.sqrt(),
        };
        return Ok(Centre {
            loc,
            scale,
            proximal_iterations: 0,
        });
    }
    if density.has_derivatives() {
        let term = NegLogDensity(density);
        let objective = ProximalObjective {
            term: &term,
            center: cavity_mean,
            precision,
        };
        let solution = proximal_newton(&objective, cavity_mean, &services.proximal_options)?;
        let scale = if solution.curvature > 0.0 {
            1.0 / solution.curvature.sqrt()
        } else {
            cavity_variance.sqrt()
        };
        return Ok(Centre {
            loc: solution.argmin,
            scale,
            proximal_iterations: solution.iterations,
        });
    }
    Ok(Centre {
        loc: cavity_mean,
        scale: cavity_variance.sqrt(),
        proximal_iterations: 0,
    })
}

impl<D: SiteDensity> QuadraturePotential<D> {
    pub fn new(density: D, services: NumericalServices) -> Self {
        Self { density, services }
    }

    pub fn density(&self) -> &D {
        &self.density
    }

    fn log_tilted(&self, s: f64, cavity_mean: f64, cavity_variance: f64) -> f64 {
        let lt = self.density.log_density(s);
        if lt == f64::NEG_INFINITY {
            return lt;
        }
        lt + log_gaussian_density(s, cavity_mean, cavity_variance)
    }

    fn integrate(
        &self,
        centre: Centre,
        shift: f64,
        cavity_mean: f64,
        cavity_variance: f64,
        breakpoints: &[f64],
        tolerance: Tolerance,
    ) -> QuadratureResult<3> {
        let Centre { loc, scale, .. } = centre;
        let integrand = |u: f64| {
            let w = (self.log_tilted(loc + scale * u, cavity_mean, cavity_variance) - shift).exp();
            if w == 0.0 {
                [0.0; 3]
            } else {
                [w, u * w, u * u * w]
            }
        };
        self.services.quadrature.integrate_moments(
            &integrand,
            f64::NEG_INFINITY,
            f64::INFINITY,
            breakpoints,
            tolerance,
            self.services.quadrature_options.max_subdivisions,
        )
    }
}

impl<D: SiteDensity> ScalarPotential for QuadraturePotential<D> {
    fn name(&self) -> &'static str {
        self.density.name()
    }

    fn moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments> {
        check_inputs(cavity_mean, cavity_variance)?;
        let centre =
            locate_tilted_mode(&self.density, &self.services, cavity_mean, cavity_variance)?;
        let mut stats = EvalStats {
            proximal_iterations: centre.proximal_iterations,
            ..EvalStats::default()
        };
        if !(centre.scale.is_finite() && centre.scale > 0.0) {
            return Err(NumericalFailure::NonFinite {
                quantity: "integration scale",
            }
            .into());
        }

        let breakpoints: Vec<f64> = self
            .density
            .breakpoints()
            .into_iter()
            .map(|b| (b - centre.loc) / centre.scale)
            .collect();
        let shift = std::iter::once(0.0)
            .chain(PROBE_OFFSETS)
            .chain(breakpoints.iter().copied())
            .map(|u| self.log_tilted(centre.loc + centre.scale * u, cavity_mean, cavity_variance))
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        if shift == f64::NEG_INFINITY {
            return Err(NumericalFailure::ZeroMass.into());
        }

        let options = &self.services.quadrature_options;
        let tolerance = Tolerance::new(options.abs_tolerance, options.rel_tolerance);
        let mut result = self.integrate(
            centre,
            shift,
            cavity_mean,
            cavity_variance,
            &breakpoints,
            tolerance,
        );
        stats.quadrature_calls += 1;
        stats.integrand_evaluations += result.evaluations;
        stats.subdivisions += result.subdivisions;
        if !result.converged {
            log::debug!(
                "[EP quad] {} did not converge (err {:.3e}); retrying with relaxed tolerance",
                self.density.name(),
                result.error_estimate
            );
            result = self.integrate(
                centre,
                shift,
                cavity_mean,
                cavity_variance,
                &breakpoints,
                tolerance.relaxed(options.retry_relaxation),
            );
            stats.quadrature_calls += 1;
            stats.integrand_evaluations += result.evaluations;
            stats.subdivisions += result.subdivisions;
            if !result.converged {
                return Err(EpError::Numerical(
                    NumericalFailure::QuadratureNotConverged {
                        error_estimate: result.error_estimate,
                        subdivisions: result.subdivisions,
                    },
                ));
            }
        }

        let [j0, j1, j2] = result.estimate;
        if !(j0 > 0.0) {
            return Err(NumericalFailure::ZeroMass.into());
        }
        let m1 = j1 / j0;
        let tilted_mean = centre.loc + centre.scale * m1;
        let tilted_variance = centre.scale * centre.scale * (j2 / j0 - m1 * m1);
        if !(tilted_variance > 0.0) {
            return Err(NumericalFailure::InvalidProjection {
                factor: tilted_variance / cavity_variance,
            }
            .into());
        }
        let log_z = shift + (centre.scale * j0).ln();
        Moments::from_tilted(
            cavity_mean,
            cavity_variance,
            log_z,
            tilted_mean,
            tilted_variance,
            stats,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potentials::{
        GaussMixtureDensity, GaussianPotential, LaplaceDensity, PoissonExpDensity, ProbitDensity,
        ProbitPotential,
    };
    use crate::specfun::{SpecialFunctions, StatrsSpecfun};
    use crate::types::{ProximalOptions, QuadratureBackend, QuadratureOptions};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn services() -> NumericalServices {
        NumericalServices::default()
    }

    fn assert_moments_close(a: &Moments, b: &Moments, rel: f64) {
        assert_relative_eq!(a.log_z, b.log_z, epsilon = rel, max_relative = rel);
        assert_relative_eq!(a.dlogz_dmean, b.dlogz_dmean, epsilon = rel, max_relative = rel);
        assert_relative_eq!(a.d2logz_dmean2, b.d2logz_dmean2, epsilon = rel, max_relative = rel);
    }

    #[test]
    fn gaussian_density_matches_closed_form() {
        let exact = GaussianPotential::new(1.5, 0.3).expect("valid");
        let quad = QuadraturePotential::new(exact.clone(), services());
        for &(h, rho) in &[(0.0, 1.0), (4.0, 0.1), (-2.0, 9.0)] {
            let a = quad.moments(h, rho).expect("quadrature moments");
            let b = ScalarPotential::moments(&exact, h, rho).expect("closed form");
            assert_moments_close(&a, &b, 1e-7);
            assert!(a.stats.quadrature_calls >= 1);
        }
    }

    #[test]
    fn step_probit_matches_closed_form() {
        let sf: Arc<dyn SpecialFunctions> = Arc::new(StatrsSpecfun);
        let exact = ProbitPotential::new(1.0, 0.2, 0.0, sf.clone()).expect("valid");
        let quad = QuadraturePotential::new(
            ProbitDensity::new(1.0, 0.2, 0.0, sf).expect("valid"),
            services(),
        );
        for &(h, rho) in &[(0.0, 1.0), (-3.0, 1.0), (2.0, 0.5)] {
            let a = quad.moments(h, rho).expect("quadrature moments");
            let b = exact.moments(h, rho).expect("closed form");
            assert_moments_close(&a, &b, 1e-6);
        }
    }

    #[test]
    fn mixture_matches_its_closed_form_on_both_backends() {
        let density =
            GaussMixtureDensity::new(&[0.2, 0.8], &[-1.0, 3.0], &[0.05, 0.5]).expect("valid");
        for backend in [QuadratureBackend::Standard, QuadratureBackend::CompatibilityMode] {
            let options = QuadratureOptions {
                backend,
                ..QuadratureOptions::default()
            };
            let quad = QuadraturePotential::new(
                density.clone(),
                NumericalServices::new(options, ProximalOptions::default()),
            );
            for &(h, rho) in &[(0.0, 1.0), (5.0, 0.2)] {
                let a = quad.moments(h, rho).expect("quadrature moments");
                let b = density.exact_moments(h, rho).expect("closed form");
                assert_moments_close(&a, &b, 1e-6);
            }
        }
    }

    #[test]
    fn laplace_tilted_mean_lies_between_location_and_cavity() {
        let quad = QuadraturePotential::new(LaplaceDensity::new(1.0, 0.0).expect("valid"), services());
        let m = quad.moments(3.0, 1.0).expect("moments");
        let mean = m.tilted_mean(crate::types::Cavity::new(3.0, 1.0));
        assert!(mean > 0.0 && mean < 3.0);
        assert!(m.d2logz_dmean2 < 0.0);
    }

    #[test]
    fn poisson_reports_proximal_iterations() {
        let sf: Arc<dyn SpecialFunctions> = Arc::new(StatrsSpecfun);
        let quad = QuadraturePotential::new(
            PoissonExpDensity::new(5.0, &sf).expect("valid"),
            services(),
        );
        let m = quad.moments(0.0, 1.0).expect("moments");
        assert!(m.stats.proximal_iterations >= 2);
        assert!(m.dlogz_dmean > 0.0);
    }

    #[test]
    fn poisson_with_single_proximal_iteration_is_a_numerical_error() {
        let sf: Arc<dyn SpecialFunctions> = Arc::new(StatrsSpecfun);
        let svc = NumericalServices::new(
            QuadratureOptions::default(),
            ProximalOptions {
                max_iterations: 1,
                ..ProximalOptions::default()
            },
        );
        let quad = QuadraturePotential::new(PoissonExpDensity::new(5.0, &sf).expect("valid"), svc);
        assert!(matches!(quad.moments(0.0, 1.0), Err(EpError::Numerical(_))));
    }

    #[test]
    fn exhausted_quadrature_budget_is_a_numerical_error() {
        let options = QuadratureOptions {
            max_subdivisions: 1,
            rel_tolerance: f64::MIN_POSITIVE,
            abs_tolerance: 0.0,
            retry_relaxation: 1.0,
            ..QuadratureOptions::default()
        };
        let quad = QuadraturePotential::new(
            LaplaceDensity::new(1.0, 0.0).expect("valid"),
            NumericalServices::new(options, ProximalOptions::default()),
        );
        assert!(matches!(
            quad.moments(3.0, 1.0),
            Err(EpError::Numerical(NumericalFailure::QuadratureNotConverged { .. }))
        ));
    }

    #[test]
    fn invalid_cavity_is_a_domain_error() {
        let quad = QuadraturePotential::new(LaplaceDensity::new(1.0, 0.0).expect("valid"), services());
        assert!(matches!(quad.moments(0.0, -1.0), Err(EpError::Domain { .. })));
        assert!(matches!(quad.moments(f64::NAN, 1.0), Err(EpError::Domain { .. })));
    }
}
