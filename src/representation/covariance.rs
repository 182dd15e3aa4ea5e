use faer::Side;
use ndarray::{Array1, Array2};

use crate::error::{EpError, EpResult};
use crate::linalg::{FaerCholesky, min_eigenvalue, symmetrize};
use crate::types::{Cavity, Marginals, SiteFactor};

use super::{EpRepresentation, SiteDelta, SiteLink, check_site};

/// Updates with 1 + Δτ · bᵀΣb at or below this are refused.
const PD_EPSILON: f64 = 1e-10;

/// Dense joint Gaussian N(m, Σ) over all variables.
///
/// The joint precision is P₀ + Σ τᵢ bᵢbᵢᵀ and the joint shift is
/// P₀m₀ + Σ νᵢ bᵢ; `mean` and `covariance` are kept equal to the moments of
/// that Gaussian through rank-one Sherman-Morrison updates.
#[derive(Debug, Clone)]
pub struct CovarianceRepresentation {
    prior_precision: Array2<f64>,
    prior_shift: Array1<f64>,
    links: Vec<SiteLink>,
    sites: Vec<SiteFactor>,
    mean: Array1<f64>,
    covariance: Array2<f64>,
}

impl CovarianceRepresentation {
    pub fn new(
        prior_mean: Array1<f64>,
        prior_covariance: Array2<f64>,
        links: Vec<SiteLink>,
    ) -> EpResult<Self> {
        let n = prior_mean.len();
        if prior_covariance.dim() != (n, n) {
            return Err(EpError::InvalidSpecification(format!(
                "prior covariance is {:?}, expected {n}x{n}",
                prior_covariance.dim()
            )));
        }
        if prior_mean.iter().any(|v| !v.is_finite())
            || prior_covariance.iter().any(|v| !v.is_finite())
        {
            return Err(EpError::InvalidSpecification(
                "prior mean and covariance must be finite".to_string(),
            ));
        }
        for (site, link) in links.iter().enumerate() {
            link.validate(site, n)?;
        }
        let covariance = symmetrize(prior_covariance);
        let chol = covariance.cholesky(Side::Lower).map_err(|_| {
            EpError::InvalidSpecification("prior covariance is not positive definite".to_string())
        })?;
        let prior_precision = chol.inverse();
        let prior_shift = prior_precision.dot(&prior_mean);
        let sites = vec![SiteFactor::default(); links.len()];
        Ok(Self {
            prior_precision,
            prior_shift,
            links,
            sites,
            mean: prior_mean,
            covariance,
        })
    }

    /// Independent prior N(mᵢ, vᵢ) on every variable.
    pub fn from_diagonal(
        prior_mean: Array1<f64>,
        prior_variance: &Array1<f64>,
        links: Vec<SiteLink>,
    ) -> EpResult<Self> {
        if prior_variance.len() != prior_mean.len() {
            return Err(EpError::InvalidSpecification(format!(
                "prior variance has {} entries, mean has {}",
                prior_variance.len(),
                prior_mean.len()
            )));
        }
        Self::new(prior_mean, Array2::from_diag(prior_variance), links)
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    /// Σb and bᵀΣb for the site's coefficient vector.
    fn project(&self, site: usize) -> (Array1<f64>, f64, f64) {
        let link = &self.links[site];
        let mut w = Array1::<f64>::zeros(self.mean.len());
        for (j, b) in link.iter() {
            w.scaled_add(b, &self.covariance.column(j));
        }
        let variance: f64 = link.iter().map(|(j, b)| b * w[j]).sum();
        let mean: f64 = link.iter().map(|(j, b)| b * self.mean[j]).sum();
        (w, variance, mean)
    }

    /// P₀ + Σ τᵢ bᵢbᵢᵀ.
    pub fn joint_precision(&self) -> Array2<f64> {
        let mut precision = self.prior_precision.clone();
        for (link, factor) in self.links.iter().zip(self.sites.iter()) {
            for (j, bj) in link.iter() {
                for (k, bk) in link.iter() {
                    precision[[j, k]] += factor.tau * bj * bk;
                }
            }
        }
        precision
    }

    fn joint_shift(&self) -> Array1<f64> {
        let mut shift = self.prior_shift.clone();
        for (link, factor) in self.links.iter().zip(self.sites.iter()) {
            for (j, b) in link.iter() {
                shift[j] += factor.nu * b;
            }
        }
        shift
    }

    /// Mean and covariance recomputed from scratch.
    fn rebuild(&self) -> EpResult<(Array1<f64>, Array2<f64>)> {
        let precision = self.joint_precision();
        let chol = precision.cholesky(Side::Lower)?;
        let covariance = chol.inverse();
        let mean = chol.solve_vec(&self.joint_shift());
        Ok((mean, covariance))
    }

    /// Smallest eigenvalue of the joint precision.
    pub fn min_precision_eigenvalue(&self) -> EpResult<f64> {
        Ok(min_eigenvalue(&self.joint_precision())?)
    }

    /// Largest absolute deviation of the running mean and covariance from a
    /// fresh rebuild of prior plus sites.
    pub fn consistency_error(&self) -> EpResult<f64> {
        let (mean, covariance) = self.rebuild()?;
        let mean_err = (&mean - &self.mean)
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let cov_err = (&covariance - &self.covariance)
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        Ok(mean_err.max(cov_err))
    }
}

impl EpRepresentation for CovarianceRepresentation {
    fn num_sites(&self) -> usize {
        self.links.len()
    }

    fn num_variables(&self) -> usize {
        self.mean.len()
    }

    fn cavity(&self, site: usize) -> EpResult<Cavity> {
        check_site(site, self.links.len())?;
        let (_, variance, mean) = self.project(site);
        if !(variance > 0.0) {
            return Err(EpError::NonPositiveDefinite {
                site,
                pivot: variance,
            });
        }
        let factor = self.sites[site];
        let precision = 1.0 / variance - factor.tau;
        if !(precision > 0.0 && precision.is_finite()) {
            return Err(EpError::ImproperCavity { site, precision });
        }
        Ok(Cavity {
            mean: (mean / variance - factor.nu) / precision,
            variance: 1.0 / precision,
        })
    }

    fn site_factor(&self, site: usize) -> EpResult<SiteFactor> {
        check_site(site, self.sites.len())?;
        Ok(self.sites[site])
    }

    fn update_site(&mut self, site: usize, factor: SiteFactor) -> EpResult<SiteDelta> {
        check_site(site, self.links.len())?;
        if !(factor.tau.is_finite() && factor.nu.is_finite()) {
            return Err(EpError::domain(format!(
                "site {site} factor must be finite, got tau {} nu {}",
                factor.tau, factor.nu
            )));
        }
        let old = self.sites[site];
        let delta = SiteDelta {
            delta_tau: factor.tau - old.tau,
            delta_nu: factor.nu - old.nu,
        };
        if delta.delta_tau == 0.0 && delta.delta_nu == 0.0 {
            return Ok(delta);
        }
        let (w, variance, mean) = self.project(site);
        let denom = 1.0 + delta.delta_tau * variance;
        if !(denom > PD_EPSILON && denom.is_finite()) {
            return Err(EpError::NonPositiveDefinite { site, pivot: denom });
        }
        let mean_step = (delta.delta_nu - delta.delta_tau * mean) / denom;
        self.mean.scaled_add(mean_step, &w);
        let cov_step = delta.delta_tau / denom;
        if cov_step != 0.0 {
            let n = w.len();
            for i in 0..n {
                let wi = w[i];
                if wi == 0.0 {
                    continue;
                }
                for j in 0..n {
                    self.covariance[[i, j]] -= cov_step * wi * w[j];
                }
            }
        }
        self.sites[site] = factor;
        Ok(delta)
    }

    fn marginals(&self) -> Marginals {
        Marginals {
            mean: self.mean.clone(),
            variance: self.covariance.diag().to_owned(),
        }
    }

    fn refresh(&mut self) -> EpResult<()> {
        let (mean, covariance) = self.rebuild()?;
        self.mean = mean;
        self.covariance = covariance;
        Ok(())
    }
}
