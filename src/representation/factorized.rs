use ndarray::Array1;

use crate::error::{EpError, EpResult};
use crate::types::{Cavity, Marginals, SiteFactor};

use super::{EpRepresentation, SiteDelta, SiteLink, check_site};

/// Message from one site to one variable, in natural parameters.
#[derive(Debug, Clone, Copy)]
struct Edge {
    variable: usize,
    coefficient: f64,
    pi: f64,
    beta: f64,
}

/// Per-variable cache of the two largest incoming message precisions.
///
/// Removing site i from variable j leaves precision Πⱼ − πᵢⱼ for every other
/// site's cavity, so a new marginal precision is admissible only if it stays
/// above the largest message of any *other* site on that variable.
#[derive(Debug, Clone)]
pub struct MaxPiValues {
    top1: Vec<f64>,
    top1_site: Vec<Option<usize>>,
    top2: Vec<f64>,
    top2_site: Vec<Option<usize>>,
}

impl MaxPiValues {
    pub fn new(num_variables: usize) -> Self {
        Self {
            top1: vec![f64::NEG_INFINITY; num_variables],
            top1_site: vec![None; num_variables],
            top2: vec![f64::NEG_INFINITY; num_variables],
            top2_site: vec![None; num_variables],
        }
    }

    /// Recomputes the entry of `variable` from its (site, πᵢⱼ) messages.
    pub fn rebuild_variable(&mut self, variable: usize, messages: impl Iterator<Item = (usize, f64)>) {
        let (mut t1, mut s1, mut t2, mut s2) = (f64::NEG_INFINITY, None, f64::NEG_INFINITY, None);
        for (site, pi) in messages {
            if s1.is_none() || pi > t1 {
                t2 = t1;
                s2 = s1;
                t1 = pi;
                s1 = Some(site);
            } else if s2.is_none() || pi > t2 {
                t2 = pi;
                s2 = Some(site);
            }
        }
        self.top1[variable] = t1;
        self.top1_site[variable] = s1;
        self.top2[variable] = t2;
        self.top2_site[variable] = s2;
    }

    /// Largest message precision on `variable` from any site other than `site`,
    /// with the site it comes from.
    pub fn max_excluding(&self, variable: usize, site: usize) -> (f64, Option<usize>) {
        if self.top1_site[variable] == Some(site) {
            (self.top2[variable], self.top2_site[variable])
        } else {
            (self.top1[variable], self.top1_site[variable])
        }
    }
}

/// Fully factorized Gaussian belief ∏ⱼ N(xⱼ; Βⱼ/Πⱼ, 1/Πⱼ).
///
/// Each site sends one message (πᵢⱼ, βᵢⱼ) to every variable of its linear
/// functional. An update to site i forms the tilted Gaussian on sᵢ from the
/// requested factor, pushes its moments back onto the variables through the
/// independent edge cavities, and stores the new marginals minus the cavities
/// as the site's messages.
#[derive(Debug, Clone)]
pub struct FactorizedRepresentation {
    prior_pi: Array1<f64>,
    prior_beta: Array1<f64>,
    pi: Array1<f64>,
    beta: Array1<f64>,
    edges: Vec<Vec<Edge>>,
    incident: Vec<Vec<(usize, usize)>>,
    sites: Vec<SiteFactor>,
    max_pi: MaxPiValues,
}

/// Cavity of one edge.
#[derive(Debug, Clone, Copy)]
struct EdgeCavity {
    pi: f64,
    beta: f64,
}

impl EdgeCavity {
    fn mean(&self) -> f64 {
        self.beta / self.pi
    }

    fn variance(&self) -> f64 {
        1.0 / self.pi
    }
}

impl FactorizedRepresentation {
    pub fn new(
        prior_mean: &Array1<f64>,
        prior_variance: &Array1<f64>,
        links: Vec<SiteLink>,
    ) -> EpResult<Self> {
        let n = prior_mean.len();
        if prior_variance.len() != n {
            return Err(EpError::InvalidSpecification(format!(
                "prior variance has {} entries, mean has {n}",
                prior_variance.len()
            )));
        }
        if prior_mean.iter().any(|m| !m.is_finite())
            || prior_variance.iter().any(|v| !(v.is_finite() && *v > 0.0))
        {
            return Err(EpError::InvalidSpecification(
                "prior means must be finite and prior variances finite and > 0".to_string(),
            ));
        }
        let prior_pi = prior_variance.mapv(|v| 1.0 / v);
        let prior_beta = &prior_pi * prior_mean;

        let mut incident = vec![Vec::new(); n];
        let mut edges = Vec::with_capacity(links.len());
        for (site, link) in links.iter().enumerate() {
            link.validate(site, n)?;
            let site_edges: Vec<Edge> = link
                .iter()
                .enumerate()
                .map(|(slot, (variable, coefficient))| {
                    incident[variable].push((site, slot));
                    Edge {
                        variable,
                        coefficient,
                        pi: 0.0,
                        beta: 0.0,
                    }
                })
                .collect();
            edges.push(site_edges);
        }
        let mut rep = Self {
            pi: prior_pi.clone(),
            beta: prior_beta.clone(),
            prior_pi,
            prior_beta,
            sites: vec![SiteFactor::default(); edges.len()],
            edges,
            incident,
            max_pi: MaxPiValues::new(n),
        };
        for j in 0..n {
            rep.rebuild_max_pi(j);
        }
        Ok(rep)
    }

    fn rebuild_max_pi(&mut self, variable: usize) {
        let edges = &self.edges;
        let messages = self.incident[variable]
            .iter()
            .map(|&(site, slot)| (site, edges[site][slot].pi));
        self.max_pi.rebuild_variable(variable, messages);
    }

    fn edge_cavities(&self, site: usize) -> EpResult<Vec<EdgeCavity>> {
        self.edges[site]
            .iter()
            .map(|e| {
                let pi = self.pi[e.variable] - e.pi;
                if !(pi > 0.0 && pi.is_finite()) {
                    return Err(EpError::ImproperCavity {
                        site,
                        precision: pi,
                    });
                }
                Ok(EdgeCavity {
                    pi,
                    beta: self.beta[e.variable] - e.beta,
                })
            })
            .collect()
    }

    fn functional_cavity(&self, site: usize, cavities: &[EdgeCavity]) -> Cavity {
        let mut mean = 0.0;
        let mut variance = 0.0;
        for (e, c) in self.edges[site].iter().zip(cavities.iter()) {
            mean += e.coefficient * c.mean();
            variance += e.coefficient * e.coefficient * c.variance();
        }
        Cavity { mean, variance }
    }

    /// Smallest cavity precision any site currently sees on any variable.
    pub fn min_cavity_precision(&self) -> f64 {
        (0..self.pi.len())
            .flat_map(|j| {
                self.incident[j]
                    .iter()
                    .map(move |&(site, slot)| self.pi[j] - self.edges[site][slot].pi)
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl EpRepresentation for FactorizedRepresentation {
    fn num_sites(&self) -> usize {
        self.edges.len()
    }

    fn num_variables(&self) -> usize {
        self.pi.len()
    }

    fn cavity(&self, site: usize) -> EpResult<Cavity> {
        check_site(site, self.edges.len())?;
        let cavities = self.edge_cavities(site)?;
        Ok(self.functional_cavity(site, &cavities))
    }

    fn site_factor(&self, site: usize) -> EpResult<SiteFactor> {
        check_site(site, self.sites.len())?;
        Ok(self.sites[site])
    }

    fn update_site(&mut self, site: usize, factor: SiteFactor) -> EpResult<SiteDelta> {
        check_site(site, self.edges.len())?;
        if !(factor.tau.is_finite() && factor.nu.is_finite()) {
            return Err(EpError::domain(format!(
                "site {site} factor must be finite, got tau {} nu {}",
                factor.tau, factor.nu
            )));
        }
        let cavities = self.edge_cavities(site)?;
        let cavity = self.functional_cavity(site, &cavities);
        let (h, rho) = (cavity.mean, cavity.variance);

        let tilted_precision = 1.0 / rho + factor.tau;
        if !(tilted_precision > 0.0 && tilted_precision.is_finite()) {
            return Err(EpError::NonPositiveDefinite {
                site,
                pivot: tilted_precision * rho,
            });
        }
        let tilted_variance = 1.0 / tilted_precision;
        let tilted_mean = tilted_variance * (h / rho + factor.nu);
        let alpha = (tilted_mean - h) / rho;
        let shrink = (rho - tilted_variance) / (rho * rho);

        let mut proposals = Vec::with_capacity(cavities.len());
        for (e, c) in self.edges[site].iter().zip(cavities.iter()) {
            let cv = c.variance();
            let variance = cv - e.coefficient * e.coefficient * cv * cv * shrink;
            if !(variance > 0.0 && variance.is_finite()) {
                return Err(EpError::NonPositiveDefinite {
                    site,
                    pivot: variance,
                });
            }
            let mean = c.mean() + e.coefficient * cv * alpha;
            let new_pi = 1.0 / variance;
            let (other_max, other_site) = self.max_pi.max_excluding(e.variable, site);
            if other_site.is_some() && !(new_pi - other_max > 0.0) {
                return Err(EpError::ImproperCavity {
                    site: other_site.unwrap_or(site),
                    precision: new_pi - other_max,
                });
            }
            proposals.push((new_pi, mean / variance, c));
        }

        for (slot, (new_pi, new_beta, c)) in proposals.into_iter().enumerate() {
            let edge = &mut self.edges[site][slot];
            edge.pi = new_pi - c.pi;
            edge.beta = new_beta - c.beta;
            self.pi[edge.variable] = new_pi;
            self.beta[edge.variable] = new_beta;
        }
        let variables: Vec<usize> = self.edges[site].iter().map(|e| e.variable).collect();
        for j in variables {
            self.rebuild_max_pi(j);
        }
        let old = std::mem::replace(&mut self.sites[site], factor);
        Ok(SiteDelta {
            delta_tau: factor.tau - old.tau,
            delta_nu: factor.nu - old.nu,
        })
    }

    fn marginals(&self) -> Marginals {
        Marginals {
            mean: &self.beta / &self.pi,
            variance: self.pi.mapv(|p| 1.0 / p),
        }
    }

    fn refresh(&mut self) -> EpResult<()> {
        let mut pi = self.prior_pi.clone();
        let mut beta = self.prior_beta.clone();
        for e in self.edges.iter().flatten() {
            pi[e.variable] += e.pi;
            beta[e.variable] += e.beta;
        }
        if let Some((j, p)) = pi.iter().enumerate().find(|(_, p)| !(**p > 0.0)) {
            return Err(EpError::NonPositiveDefinite {
                site: self.incident[j].first().map_or(0, |s| s.0),
                pivot: *p,
            });
        }
        self.pi = pi;
        self.beta = beta;
        for j in 0..self.pi.len() {
            self.rebuild_max_pi(j);
        }
        Ok(())
    }
}
