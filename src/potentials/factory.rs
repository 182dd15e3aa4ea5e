//! Named registry that turns a type tag plus a flat parameter list into a
//! potential.
//!
//! Parameter layouts of the built-in tags:
//!
//! | tag | params |
//! |---|---|
//! | `gaussian` | `[y, variance]` |
//! | `probit` | `[y, bias = 0, noise_variance = 0]` |
//! | `spike_slab` | `[slab_probability, slab_variance]` |
//! | `laplace` | `[rate, location = 0]` |
//! | `quantile` | `[y, quantile, scale = 1]` |
//! | `gauss_mixture` | `[w_1, mean_1, var_1, w_2, mean_2, var_2, ...]` |
//! | `poisson_exp`, `poisson_logistic`, `poisson_exp_laplace` | `[count]` |

use std::collections::BTreeMap;

use crate::error::{EpError, EpResult};

use super::{
    GaussMixtureDensity, GaussianPotential, LaplaceApproxPotential, LaplaceDensity,
    NumericalServices, PoissonExpDensity, PoissonLogisticDensity, ProbitPotential,
    QuadraturePotential, QuantileDensity, ScalarPotential, SpikeSlabPotential,
};

pub type PotentialConstructor = Box<
    dyn Fn(&[f64], &NumericalServices) -> EpResult<Box<dyn ScalarPotential>> + Send + Sync,
>;

pub struct PotentialFactory {
    constructors: BTreeMap<String, PotentialConstructor>,
}

struct Params<'a> {
    tag: &'a str,
    values: &'a [f64],
}

impl<'a> Params<'a> {
    fn new(tag: &'a str, values: &'a [f64], min: usize, max: usize) -> EpResult<Self> {
        if values.len() < min || values.len() > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(EpError::InvalidSpecification(format!(
                "'{tag}' expects {expected} parameters, got {}",
                values.len()
            )));
        }
        Ok(Self { tag, values })
    }

    fn get(&self, index: usize) -> EpResult<f64> {
        self.values.get(index).copied().ok_or_else(|| {
            EpError::InvalidSpecification(format!("'{}' is missing parameter {index}", self.tag))
        })
    }

    fn get_or(&self, index: usize, default: f64) -> f64 {
        self.values.get(index).copied().unwrap_or(default)
    }
}

impl PotentialFactory {
    /// A factory with no registered tags.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// A factory with every built-in tag registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.register("gaussian", |params, _| {
            let p = Params::new("gaussian", params, 2, 2)?;
            Ok(Box::new(GaussianPotential::new(p.get(0)?, p.get(1)?)?))
        });
        factory.register("probit", |params, services| {
            let p = Params::new("probit", params, 1, 3)?;
            Ok(Box::new(ProbitPotential::new(
                p.get(0)?,
                p.get_or(1, 0.0),
                p.get_or(2, 0.0),
                services.specfun.clone(),
            )?))
        });
        factory.register("spike_slab", |params, _| {
            let p = Params::new("spike_slab", params, 2, 2)?;
            Ok(Box::new(SpikeSlabPotential::new(p.get(0)?, p.get(1)?)?))
        });
        factory.register("laplace", |params, services| {
            let p = Params::new("laplace", params, 1, 2)?;
            let density = LaplaceDensity::new(p.get(0)?, p.get_or(1, 0.0))?;
            Ok(Box::new(QuadraturePotential::new(density, services.clone())))
        });
        factory.register("quantile", |params, services| {
            let p = Params::new("quantile", params, 2, 3)?;
            let density = QuantileDensity::new(p.get(0)?, p.get(1)?, p.get_or(2, 1.0))?;
            Ok(Box::new(QuadraturePotential::new(density, services.clone())))
        });
        factory.register("gauss_mixture", |params, services| {
            if params.is_empty() || params.len() % 3 != 0 {
                return Err(EpError::InvalidSpecification(format!(
                    "'gauss_mixture' expects (weight, mean, variance) triples, got {} values",
                    params.len()
                )));
            }
            let weights: Vec<f64> = params.chunks(3).map(|c| c[0]).collect();
            let means: Vec<f64> = params.chunks(3).map(|c| c[1]).collect();
            let variances: Vec<f64> = params.chunks(3).map(|c| c[2]).collect();
            let density = GaussMixtureDensity::new(&weights, &means, &variances)?;
            Ok(Box::new(QuadraturePotential::new(density, services.clone())))
        });
        factory.register("poisson_exp", |params, services| {
            let p = Params::new("poisson_exp", params, 1, 1)?;
            let density = PoissonExpDensity::new(p.get(0)?, &services.specfun)?;
            Ok(Box::new(QuadraturePotential::new(density, services.clone())))
        });
        factory.register("poisson_logistic", |params, services| {
            let p = Params::new("poisson_logistic", params, 1, 1)?;
            let density = PoissonLogisticDensity::new(p.get(0)?, &services.specfun)?;
            Ok(Box::new(QuadraturePotential::new(density, services.clone())))
        });
        factory.register("poisson_exp_laplace", |params, services| {
            let p = Params::new("poisson_exp_laplace", params, 1, 1)?;
            let density = PoissonExpDensity::new(p.get(0)?, &services.specfun)?;
            Ok(Box::new(
                LaplaceApproxPotential::new(density, services.clone())?
                    .with_tag("poisson_exp_laplace"),
            ))
        });
        factory
    }

    /// Registers (or replaces) the constructor for `tag`.
    pub fn register<F>(&mut self, tag: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&[f64], &NumericalServices) -> EpResult<Box<dyn ScalarPotential>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(tag.into(), Box::new(constructor));
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        tag: &str,
        params: &[f64],
        services: &NumericalServices,
    ) -> EpResult<Box<dyn ScalarPotential>> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| EpError::UnknownPotential(tag.to_string()))?;
        constructor(params, services)
    }
}

impl Default for PotentialFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for PotentialFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PotentialFactory")
            .field("tags", &self.tags().collect::<Vec<_>>())
            .finish()
    }
}
