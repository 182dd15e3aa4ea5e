//! Model assembly: prior, site list and linkage into a manager plus a
//! representation, fully validated before any sweep runs.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::driver::{EpDriver, EpOutcome};
use crate::error::{EpError, EpResult};
use crate::manager::{ContainerPotManager, DefaultPotManager, PotManagerFactory, PotentialManager};
use crate::potentials::{NumericalServices, PotentialFactory};
use crate::representation::{
    AnyRepresentation, CovarianceRepresentation, EpRepresentation, FactorizedRepresentation,
    RepresentationKind, SiteLink,
};
use crate::types::EpConfig;

/// `Auto` keeps the dense covariance up to this many variables.
pub const AUTO_DENSE_MAX_VARIABLES: usize = 256;

/// Gaussian prior over the model variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorSpec {
    Diagonal {
        mean: Array1<f64>,
        variance: Array1<f64>,
    },
    Dense {
        mean: Array1<f64>,
        covariance: Array2<f64>,
    },
}

impl PriorSpec {
    /// Independent N(0, variance) on `n` variables.
    pub fn isotropic(n: usize, variance: f64) -> Self {
        PriorSpec::Diagonal {
            mean: Array1::zeros(n),
            variance: Array1::from_elem(n, variance),
        }
    }

    pub fn num_variables(&self) -> usize {
        match self {
            PriorSpec::Diagonal { mean, .. } | PriorSpec::Dense { mean, .. } => mean.len(),
        }
    }

    fn has_correlations(&self) -> bool {
        match self {
            PriorSpec::Diagonal { .. } => false,
            PriorSpec::Dense { covariance, .. } => covariance
                .indexed_iter()
                .any(|((i, j), v)| i != j && *v != 0.0),
        }
    }
}

/// One site: a potential tag, its parameters and the linear functional it
/// observes, as (variable, coefficient) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSpec {
    pub potential: String,
    #[serde(default)]
    pub params: Vec<f64>,
    pub linkage: Vec<(usize, f64)>,
}

impl SiteSpec {
    pub fn new(potential: impl Into<String>, params: &[f64], linkage: &[(usize, f64)]) -> Self {
        Self {
            potential: potential.into(),
            params: params.to_vec(),
            linkage: linkage.to_vec(),
        }
    }

    /// A site observing variable `index` directly.
    pub fn unit(potential: impl Into<String>, params: &[f64], index: usize) -> Self {
        Self::new(potential, params, &[(index, 1.0)])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub prior: PriorSpec,
    pub sites: Vec<SiteSpec>,
}

impl ModelSpec {
    pub fn new(prior: PriorSpec) -> Self {
        Self {
            prior,
            sites: Vec::new(),
        }
    }

    pub fn with_site(mut self, site: SiteSpec) -> Self {
        self.sites.push(site);
        self
    }

    fn links(&self) -> Vec<SiteLink> {
        self.sites.iter().map(|s| SiteLink::new(&s.linkage)).collect()
    }

    fn site_descriptions(&self) -> impl Iterator<Item = (&str, &[f64])> + '_ {
        self.sites
            .iter()
            .map(|s| (s.potential.as_str(), s.params.as_slice()))
    }

    /// Representation `Auto` resolves to for this model.
    pub fn resolve_kind(&self, kind: RepresentationKind) -> RepresentationKind {
        match kind {
            RepresentationKind::Auto => {
                let dense_links = self.sites.iter().any(|s| s.linkage.len() > 1);
                if self.prior.has_correlations()
                    || dense_links
                    || self.prior.num_variables() <= AUTO_DENSE_MAX_VARIABLES
                {
                    RepresentationKind::Covariance
                } else {
                    RepresentationKind::Factorized
                }
            }
            explicit => explicit,
        }
    }
}

fn build_representation(
    spec: &ModelSpec,
    kind: RepresentationKind,
) -> EpResult<AnyRepresentation> {
    if spec.prior.num_variables() == 0 {
        return Err(EpError::InvalidSpecification(
            "the prior must cover at least one variable".to_string(),
        ));
    }
    let links = spec.links();
    let rep = match (spec.resolve_kind(kind), &spec.prior) {
        (RepresentationKind::Factorized, PriorSpec::Diagonal { mean, variance }) => {
            AnyRepresentation::Factorized(FactorizedRepresentation::new(mean, variance, links)?)
        }
        (RepresentationKind::Factorized, PriorSpec::Dense { mean, covariance }) => {
            if spec.prior.has_correlations() {
                return Err(EpError::InvalidSpecification(
                    "the factorized representation needs an uncorrelated prior".to_string(),
                ));
            }
            if covariance.dim() != (mean.len(), mean.len()) {
                return Err(EpError::InvalidSpecification(format!(
                    "prior covariance is {:?}, expected {n}x{n}",
                    covariance.dim(),
                    n = mean.len()
                )));
            }
            let variance = covariance.diag().to_owned();
            AnyRepresentation::Factorized(FactorizedRepresentation::new(mean, &variance, links)?)
        }
        (_, PriorSpec::Diagonal { mean, variance }) => AnyRepresentation::Covariance(
            CovarianceRepresentation::from_diagonal(mean.clone(), variance, links)?,
        ),
        (_, PriorSpec::Dense { mean, covariance }) => AnyRepresentation::Covariance(
            CovarianceRepresentation::new(mean.clone(), covariance.clone(), links)?,
        ),
    };
    Ok(rep)
}

/// Builds a flat manager and a representation for `spec`.
///
/// Unknown tags, bad parameters, out-of-range linkage and invalid priors are
/// all reported here.
pub fn build_model(
    spec: &ModelSpec,
    factory: &PotentialFactory,
    services: &NumericalServices,
    kind: RepresentationKind,
) -> EpResult<(DefaultPotManager, AnyRepresentation)> {
    services.validate()?;
    let representation = build_representation(spec, kind)?;
    let manager =
        PotManagerFactory::new(factory, services).build_default(spec.site_descriptions())?;
    log::debug!(
        "[EP] built model: {} variables, {} sites, {:?} representation",
        representation.num_variables(),
        manager.num_sites(),
        representation.kind()
    );
    Ok((manager, representation))
}

/// As `build_model`, grouping consecutive sites of the same potential family
/// into one part each.
pub fn build_grouped_model(
    spec: &ModelSpec,
    factory: &PotentialFactory,
    services: &NumericalServices,
    kind: RepresentationKind,
) -> EpResult<(ContainerPotManager, AnyRepresentation)> {
    services.validate()?;
    let representation = build_representation(spec, kind)?;
    let manager =
        PotManagerFactory::new(factory, services).build_grouped(spec.site_descriptions())?;
    Ok((manager, representation))
}

/// Builds `spec` with the default potential catalogue and runs EP to the end.
pub fn run_model(
    spec: &ModelSpec,
    config: &EpConfig,
    services: &NumericalServices,
    kind: RepresentationKind,
) -> EpResult<EpOutcome> {
    let factory = PotentialFactory::with_defaults();
    let (manager, representation) = build_model(spec, &factory, services, kind)?;
    EpDriver::new(&manager, representation, config.clone())?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn regression() -> ModelSpec {
        ModelSpec::new(PriorSpec::isotropic(2, 1.0))
            .with_site(SiteSpec::unit("gaussian", &[2.0, 0.5], 0))
            .with_site(SiteSpec::new("gaussian", &[1.0, 1.0], &[(0, 1.0), (1, -1.0)]))
    }

    #[test]
    fn setup_errors_surface_before_any_sweep() {
        let factory = PotentialFactory::with_defaults();
        let services = NumericalServices::default();
        let unknown = regression().with_site(SiteSpec::unit("student_t", &[1.0], 0));
        assert!(matches!(
            build_model(&unknown, &factory, &services, RepresentationKind::Auto),
            Err(EpError::UnknownPotential(_))
        ));
        let out_of_range = regression().with_site(SiteSpec::unit("gaussian", &[0.0, 1.0], 5));
        assert!(matches!(
            build_model(&out_of_range, &factory, &services, RepresentationKind::Auto),
            Err(EpError::Index { index: 5, len: 2 })
        ));
        let bad_params = regression().with_site(SiteSpec::unit("gaussian", &[0.0, -1.0], 0));
        assert!(build_model(&bad_params, &factory, &services, RepresentationKind::Auto).is_err());
    }

    #[test]
    fn auto_prefers_the_dense_form_for_linked_sites() {
        assert_eq!(
            regression().resolve_kind(RepresentationKind::Auto),
            RepresentationKind::Covariance
        );
        let wide = ModelSpec::new(PriorSpec::isotropic(AUTO_DENSE_MAX_VARIABLES + 1, 1.0))
            .with_site(SiteSpec::unit("probit", &[1.0], 3));
        assert_eq!(
            wide.resolve_kind(RepresentationKind::Auto),
            RepresentationKind::Factorized
        );
        assert_eq!(
            wide.resolve_kind(RepresentationKind::Covariance),
            RepresentationKind::Covariance
        );
    }

    #[test]
    fn factorized_form_refuses_correlated_priors() {
        let spec = ModelSpec::new(PriorSpec::Dense {
            mean: array![0.0, 0.0],
            covariance: array![[1.0, 0.3], [0.3, 1.0]],
        })
        .with_site(SiteSpec::unit("gaussian", &[0.0, 1.0], 0));
        let factory = PotentialFactory::with_defaults();
        assert!(matches!(
            build_model(
                &spec,
                &factory,
                &NumericalServices::default(),
                RepresentationKind::Factorized
            ),
            Err(EpError::InvalidSpecification(_))
        ));
    }

    #[test]
    fn linear_gaussian_model_reaches_the_exact_posterior() {
        let outcome = run_model(
            &regression(),
            &EpConfig::default(),
            &NumericalServices::default(),
            RepresentationKind::Auto,
        )
        .expect("run");
        assert!(outcome.status.is_converged());
        // Exact posterior precision: I + diag(2, 0) + [1, -1][1, -1]ᵀ.
        let precision = array![[4.0, -1.0], [-1.0, 2.0]];
        let shift = array![5.0, -1.0];
        let det: f64 = 4.0 * 2.0 - 1.0;
        let cov = array![[2.0, 1.0], [1.0, 4.0]] / det;
        let mean = cov.dot(&shift);
        assert_relative_eq!(outcome.marginals.mean[0], mean[0], epsilon = 1e-10);
        assert_relative_eq!(outcome.marginals.mean[1], mean[1], epsilon = 1e-10);
        assert_relative_eq!(outcome.marginals.variance[1], cov[[1, 1]], epsilon = 1e-10);
        assert_relative_eq!(precision.dot(&cov)[[0, 0]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn grouped_and_flat_builds_agree() {
        let spec = ModelSpec::new(PriorSpec::isotropic(3, 2.0))
            .with_site(SiteSpec::unit("gaussian", &[0.5, 1.0], 0))
            .with_site(SiteSpec::unit("probit", &[1.0], 1))
            .with_site(SiteSpec::unit("probit", &[-1.0], 2));
        let factory = PotentialFactory::with_defaults();
        let services = NumericalServices::default();
        let (flat, rep_a) =
            build_model(&spec, &factory, &services, RepresentationKind::Factorized).expect("flat");
        let (grouped, rep_b) =
            build_grouped_model(&spec, &factory, &services, RepresentationKind::Factorized)
                .expect("grouped");
        assert_eq!(grouped.num_parts(), 2);
        let a = EpDriver::new(&flat, rep_a, EpConfig::default())
            .expect("valid")
            .run()
            .expect("run");
        let b = EpDriver::new(&grouped, rep_b, EpConfig::default())
            .expect("valid")
            .run()
            .expect("run");
        assert!(a.marginals.max_change(&b.marginals) < 1e-14);
    }

    #[test]
    fn specs_round_trip_through_serde_values() {
        let spec = regression();
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["prior"]["kind"], "diagonal");
        let back: ModelSpec = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, spec);
    }
}
