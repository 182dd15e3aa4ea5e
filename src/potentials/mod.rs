//! Site potentials and their moment computations.
//!
//! Every potential answers one question: given the cavity N(h, ρ) of its
//! linear functional, what are log Z and its first two derivatives with
//! respect to h, where Z = ∫ t(s) N(s; h, ρ) ds. Closed-form potentials
//! implement `ScalarPotential` directly; everything else describes its raw
//! density through `SiteDensity` and is evaluated by `QuadraturePotential`
//! or `LaplaceApproxPotential`.

use std::fmt::Debug;
use std::ops::AddAssign;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EpError, EpResult, NumericalFailure, check_cavity};
use crate::quadrature::{QuadratureServices, quadrature_services};
use crate::specfun::{SpecialFunctions, StatrsSpecfun};
use crate::types::{Cavity, ProximalOptions, QuadratureOptions, SiteFactor};

pub mod factory;
pub mod gaussian;
pub mod laplace;
pub mod laplace_approx;
pub mod mixture;
pub mod poisson;
pub mod probit;
pub mod quadrature;
pub mod quantile;
pub mod spike_slab;

pub use factory::PotentialFactory;
pub use gaussian::GaussianPotential;
pub use laplace::LaplaceDensity;
pub use laplace_approx::LaplaceApproxPotential;
pub use mixture::{GaussMixtureDensity, gaussian_mixture_moments};
pub use poisson::{PoissonExpDensity, PoissonLogisticDensity};
pub use probit::{ProbitDensity, ProbitPotential};
pub use quadrature::QuadraturePotential;
pub use quantile::QuantileDensity;
pub use spike_slab::SpikeSlabPotential;

/// Work done while evaluating one set of moments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalStats {
    pub quadrature_calls: usize,
    pub integrand_evaluations: usize,
    pub subdivisions: usize,
    pub proximal_iterations: usize,
}

impl AddAssign for EvalStats {
    fn add_assign(&mut self, rhs: Self) {
        self.quadrature_calls += rhs.quadrature_calls;
        self.integrand_evaluations += rhs.integrand_evaluations;
        self.subdivisions += rhs.subdivisions;
        self.proximal_iterations += rhs.proximal_iterations;
    }
}

/// log Z and its derivatives with respect to the cavity mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub log_z: f64,
    pub dlogz_dmean: f64,
    pub d2logz_dmean2: f64,
    pub stats: EvalStats,
}

impl Moments {
    /// Builds a result, rejecting non-finite entries as a numerical failure.
    pub fn checked(log_z: f64, d1: f64, d2: f64, stats: EvalStats) -> EpResult<Self> {
        if log_z == f64::NEG_INFINITY {
            return Err(NumericalFailure::ZeroMass.into());
        }
        if !log_z.is_finite() {
            return Err(NumericalFailure::NonFinite { quantity: "log Z" }.into());
        }
        if !d1.is_finite() {
            return Err(NumericalFailure::NonFinite {
                quantity: "dlogZ/dmean",
            }
            .into());
        }
        if !d2.is_finite() {
            return Err(NumericalFailure::NonFinite {
                quantity: "d2logZ/dmean2",
            }
            .into());
        }
        Ok(Self {
            log_z,
            dlogz_dmean: d1,
            d2logz_dmean2: d2,
            stats,
        })
    }

    /// Moments from the mean and variance of the tilted distribution.
    pub(crate) fn from_tilted(
        cavity_mean: f64,
        cavity_variance: f64,
        log_z: f64,
        tilted_mean: f64,
        tilted_variance: f64,
        stats: EvalStats,
    ) -> EpResult<Self> {
        let d1 = (tilted_mean - cavity_mean) / cavity_variance;
        let d2 = (tilted_variance - cavity_variance) / (cavity_variance * cavity_variance);
        Self::checked(log_z, d1, d2, stats)
    }

    pub fn tilted_mean(&self, cavity: Cavity) -> f64 {
        cavity.mean + cavity.variance * self.dlogz_dmean
    }

    pub fn tilted_variance(&self, cavity: Cavity) -> f64 {
        cavity.variance + cavity.variance * cavity.variance * self.d2logz_dmean2
    }
}

/// Natural parameters of the Gaussian site that reproduces the tilted
/// moments when combined with the cavity.
pub fn project_site(cavity: Cavity, moments: &Moments) -> EpResult<SiteFactor> {
    let d1 = moments.dlogz_dmean;
    let d2 = moments.d2logz_dmean2;
    let factor = 1.0 + cavity.variance * d2;
    if !(factor.is_finite() && factor > 0.0) {
        return Err(NumericalFailure::InvalidProjection { factor }.into());
    }
    let tau = -d2 / factor;
    let nu = (d1 - cavity.mean * d2) / factor;
    if !(tau.is_finite() && nu.is_finite()) {
        return Err(NumericalFailure::NonFinite {
            quantity: "site natural parameters",
        }
        .into());
    }
    Ok(SiteFactor { tau, nu })
}

/// A site potential t(s) on a scalar linear functional.
pub trait ScalarPotential: Send + Sync + Debug {
    /// Registry tag of the potential family.
    fn name(&self) -> &'static str;

    /// log Z, dlogZ/dh and d²logZ/dh² for the cavity N(h, ρ).
    fn moments(&self, cavity_mean: f64, cavity_variance: f64) -> EpResult<Moments>;
}

/// Raw log-density of a site, evaluated by the generic numerical potentials.
pub trait SiteDensity: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// log t(s); `-inf` where the density vanishes.
    fn log_density(&self, s: f64) -> f64;

    /// Points where log t is not smooth, or where its mass concentrates.
    fn breakpoints(&self) -> Vec<f64> {
        Vec::new()
    }

    /// True when `derivatives` returns values.
    fn has_derivatives(&self) -> bool {
        false
    }

    /// First and second derivative of log t at `s`.
    fn derivatives(&self, _s: f64) -> Option<(f64, f64)> {
        None
    }

    /// argmax_s log t(s) − ½ · precision · (s − center)² in closed form.
    fn proximal(&self, _center: f64, _precision: f64) -> Option<f64> {
        None
    }
}

/// Numerical service handles shared by every potential of one model.
#[derive(Clone)]
pub struct NumericalServices {
    pub specfun: Arc<dyn SpecialFunctions>,
    pub quadrature: Arc<dyn QuadratureServices>,
    pub quadrature_options: QuadratureOptions,
    pub proximal_options: ProximalOptions,
}

impl NumericalServices {
    pub fn new(quadrature_options: QuadratureOptions, proximal_options: ProximalOptions) -> Self {
        Self {
            specfun: Arc::new(StatrsSpecfun),
            quadrature: quadrature_services(&quadrature_options),
            quadrature_options,
            proximal_options,
        }
    }

    pub fn with_specfun(mut self, specfun: Arc<dyn SpecialFunctions>) -> Self {
        self.specfun = specfun;
        self
    }

    pub fn with_quadrature(mut self, quadrature: Arc<dyn QuadratureServices>) -> Self {
        self.quadrature = quadrature;
        self
    }

    pub fn validate(&self) -> EpResult<()> {
        self.quadrature_options.validate()?;
        self.proximal_options.validate()
    }
}

impl Default for NumericalServices {
    fn default() -> Self {
        Self::new(QuadratureOptions::default(), ProximalOptions::default())
    }
}

impl Debug for NumericalServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumericalServices")
            .field("quadrature", &self.quadrature.name())
            .field("quadrature_options", &self.quadrature_options)
            .field("proximal_options", &self.proximal_options)
            .finish()
    }
}

pub(crate) fn check_inputs(cavity_mean: f64, cavity_variance: f64) -> EpResult<()> {
    check_cavity(cavity_mean, cavity_variance)
}

pub(crate) fn require(condition: bool, what: impl FnOnce() -> String) -> EpResult<()> {
    if condition {
        Ok(())
    } else {
        Err(EpError::InvalidSpecification(what()))
    }
}
