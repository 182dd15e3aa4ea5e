//! Global Gaussian belief state plus per-site approximating factors.
//!
//! Two parameterizations share one interface:
//! - `CovarianceRepresentation`: dense mean and covariance, rank-one updates.
//! - `FactorizedRepresentation`: fully factorized marginals with per-edge
//!   natural-parameter messages.

use serde::{Deserialize, Serialize};

use crate::error::{EpError, EpResult};
use crate::types::{Cavity, Marginals, SiteFactor};

pub mod covariance;
pub mod factorized;

pub use covariance::CovarianceRepresentation;
pub use factorized::{FactorizedRepresentation, MaxPiValues};

/// Sparse coefficient vector b of a site's linear functional s = bᵀx.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteLink {
    pub indices: Vec<usize>,
    pub coefficients: Vec<f64>,
}

impl SiteLink {
    pub fn new(pairs: &[(usize, f64)]) -> Self {
        Self {
            indices: pairs.iter().map(|p| p.0).collect(),
            coefficients: pairs.iter().map(|p| p.1).collect(),
        }
    }

    /// A site acting on a single variable with unit coefficient.
    pub fn unit(index: usize) -> Self {
        Self {
            indices: vec![index],
            coefficients: vec![1.0],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.indices
            .iter()
            .copied()
            .zip(self.coefficients.iter().copied())
    }

    /// Rejects empty links, repeated or out-of-range variables, and zero or
    /// non-finite coefficients.
    pub fn validate(&self, site: usize, num_variables: usize) -> EpResult<()> {
        if self.indices.is_empty() || self.indices.len() != self.coefficients.len() {
            return Err(EpError::InvalidSpecification(format!(
                "site {site} needs a non-empty linkage with one coefficient per variable"
            )));
        }
        for (k, (index, coef)) in self.iter().enumerate() {
            if index >= num_variables {
                return Err(EpError::Index {
                    index,
                    len: num_variables,
                });
            }
            if !(coef.is_finite() && coef != 0.0) {
                return Err(EpError::InvalidSpecification(format!(
                    "site {site} has a zero or non-finite coefficient {coef} on variable {index}"
                )));
            }
            if self.indices[..k].contains(&index) {
                return Err(EpError::InvalidSpecification(format!(
                    "site {site} links variable {index} more than once"
                )));
            }
        }
        Ok(())
    }
}

/// Natural-parameter change actually applied by an accepted update.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SiteDelta {
    pub delta_tau: f64,
    pub delta_nu: f64,
}

impl SiteDelta {
    pub fn magnitude(&self) -> f64 {
        self.delta_tau.abs().max(self.delta_nu.abs())
    }
}

/// Which parameterization `build_model` should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentationKind {
    Covariance,
    Factorized,
    #[default]
    Auto,
}

/// Operations the driver needs from a belief state.
pub trait EpRepresentation: Send + Sync {
    fn num_sites(&self) -> usize;

    fn num_variables(&self) -> usize;

    /// Cavity of the site's linear functional with the site's factor removed.
    fn cavity(&self, site: usize) -> EpResult<Cavity>;

    fn site_factor(&self, site: usize) -> EpResult<SiteFactor>;

    /// Replaces the site's factor. Rejected with `NonPositiveDefinite` or
    /// `ImproperCavity` when the result would be invalid; the state is left
    /// unchanged on rejection.
    fn update_site(&mut self, site: usize, factor: SiteFactor) -> EpResult<SiteDelta>;

    fn marginals(&self) -> Marginals;

    /// Rebuilds derived state from the prior and site factors.
    fn refresh(&mut self) -> EpResult<()>;

    fn site_factors(&self) -> Vec<SiteFactor> {
        (0..self.num_sites())
            .filter_map(|i| self.site_factor(i).ok())
            .collect()
    }
}

pub(crate) fn check_site(site: usize, len: usize) -> EpResult<()> {
    if site >= len {
        Err(EpError::Index { index: site, len })
    } else {
        Ok(())
    }
}

/// Either parameterization behind one concrete type.
#[derive(Debug, Clone)]
pub enum AnyRepresentation {
    Covariance(CovarianceRepresentation),
    Factorized(FactorizedRepresentation),
}

impl AnyRepresentation {
    pub fn kind(&self) -> RepresentationKind {
        match self {
            AnyRepresentation::Covariance(_) => RepresentationKind::Covariance,
            AnyRepresentation::Factorized(_) => RepresentationKind::Factorized,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $r:ident => $body:expr) => {
        match $self {
            AnyRepresentation::Covariance($r) => $body,
            AnyRepresentation::Factorized($r) => $body,
        }
    };
}

impl EpRepresentation for AnyRepresentation {
    fn num_sites(&self) -> usize {
        dispatch!(self, r => r.num_sites())
    }

    fn num_variables(&self) -> usize {
        dispatch!(self, r => r.num_variables())
    }

    fn cavity(&self, site: usize) -> EpResult<Cavity> {
        dispatch!(self, r => r.cavity(site))
    }

    fn site_factor(&self, site: usize) -> EpResult<SiteFactor> {
        dispatch!(self, r => r.site_factor(site))
    }

    fn update_site(&mut self, site: usize, factor: SiteFactor) -> EpResult<SiteDelta> {
        dispatch!(self, r => r.update_site(site, factor))
    }

    fn marginals(&self) -> Marginals {
        dispatch!(self, r => r.marginals())
    }

    fn refresh(&mut self) -> EpResult<()> {
        dispatch!(self, r => r.refresh())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_validation() {
        assert!(SiteLink::new(&[(0, 1.0), (2, -0.5)]).validate(0, 3).is_ok());
        assert!(matches!(
            SiteLink::new(&[(3, 1.0)]).validate(0, 3),
            Err(EpError::Index { index: 3, len: 3 })
        ));
        assert!(SiteLink::new(&[]).validate(0, 3).is_err());
        assert!(SiteLink::new(&[(0, 0.0)]).validate(0, 3).is_err());
        assert!(SiteLink::new(&[(1, 1.0), (1, 2.0)]).validate(0, 3).is_err());
    }
}
