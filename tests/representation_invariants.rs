use approx::assert_relative_eq;
use eptools::{
    CovarianceRepresentation, DefaultPotManager, EpConfig, EpDriver, EpError, EpRepresentation,
    EpResult, EvalStats, FactorizedRepresentation, GaussianPotential, Moments, ScalarPotential,
    SiteFactor, SiteLink,
};
use ndarray::array;
use proptest::prelude::*;

// ===== Strategies =====

fn arb_tau() -> impl Strategy<Value = f64> {
    prop::sample::select(vec![-2.0, -1.0, -0.5, 0.0, 0.25, 1.0, 4.0])
}

fn arb_update(num_sites: usize) -> impl Strategy<Value = (usize, f64, f64)> {
    (0..num_sites, arb_tau(), -3.0..3.0_f64)
}

fn correlated_model() -> CovarianceRepresentation {
    let prior = array![[1.0, 0.3, 0.0], [0.3, 2.0, -0.4], [0.0, -0.4, 1.5]];
    let links = vec![
        SiteLink::unit(0),
        SiteLink::new(&[(0, 1.0), (1, -1.0)]),
        SiteLink::new(&[(1, 0.5), (2, 1.0)]),
        SiteLink::unit(2),
    ];
    CovarianceRepresentation::new(array![0.0, 0.5, -0.5], prior, links).expect("valid")
}

fn independent_model() -> FactorizedRepresentation {
    let links = vec![
        SiteLink::unit(0),
        SiteLink::unit(0),
        SiteLink::unit(1),
        SiteLink::new(&[(0, 1.0), (1, 1.0)]),
    ];
    FactorizedRepresentation::new(&array![0.0, 1.0], &array![1.0, 0.5], links).expect("valid")
}

// ===== Property tests =====

proptest! {
    #[test]
    fn prop_accepted_updates_keep_the_joint_precision_positive_definite(
        updates in prop::collection::vec(arb_update(4), 1..20)
    ) {
        let mut rep = correlated_model();
        for (site, tau, nu) in updates {
            let before = rep.marginals();
            match rep.update_site(site, SiteFactor::new(tau, nu)) {
                Ok(_) => {
                    let min_eig = rep.min_precision_eigenvalue().expect("eigh");
                    prop_assert!(min_eig > 0.0, "min eigenvalue {} after site {}", min_eig, site);
                    prop_assert!(rep.marginals().variance.iter().all(|v| *v > 0.0));
                }
                Err(EpError::NonPositiveDefinite { .. }) => {
                    prop_assert_eq!(rep.marginals(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }
        prop_assert!(rep.refresh().is_ok());
    }

    #[test]
    fn prop_accepted_updates_keep_every_cavity_proper(
        updates in prop::collection::vec(arb_update(4), 1..20)
    ) {
        let mut rep = independent_model();
        for (site, tau, nu) in updates {
            let before = rep.marginals();
            match rep.update_site(site, SiteFactor::new(tau, nu)) {
                Ok(_) => {
                    prop_assert!(rep.min_cavity_precision() > 0.0);
                    for s in 0..rep.num_sites() {
                        let cavity = rep.cavity(s).expect("proper cavity");
                        prop_assert!(cavity.variance > 0.0);
                    }
                }
                Err(EpError::NonPositiveDefinite { .. } | EpError::ImproperCavity { .. }) => {
                    prop_assert_eq!(rep.marginals(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }
    }
}

// ===== Damping =====

/// Site whose projection always removes `strength` units of precision.
#[derive(Debug)]
struct Repulsive {
    strength: f64,
}

impl ScalarPotential for Repulsive {
    fn name(&self) -> &'static str {
        "repulsive"
    }

    fn moments(&self, _mean: f64, variance: f64) -> EpResult<Moments> {
        let d2 = self.strength / (1.0 - self.strength * variance);
        Moments::checked(0.0, 0.0, d2, EvalStats::default())
    }
}

/// A sharp Gaussian site followed by a repulsive one on the same variable.
fn sharp_site_then_repulsive() -> (DefaultPotManager, FactorizedRepresentation) {
    let sharp: Box<dyn ScalarPotential> =
        Box::new(GaussianPotential::new(0.0, 0.01).expect("valid"));
    let repulsive: Box<dyn ScalarPotential> = Box::new(Repulsive { strength: 5.0 });
    let rep = FactorizedRepresentation::new(
        &array![0.0],
        &array![1.0],
        vec![SiteLink::unit(0), SiteLink::unit(0)],
    )
    .expect("valid");
    (DefaultPotManager::new(vec![sharp, repulsive]), rep)
}

fn rejections_in_first_sweep(damping: f64) -> usize {
    let (manager, rep) = sharp_site_then_repulsive();
    let config = EpConfig {
        damping,
        max_retry_on_rejected_update: 6,
        ..EpConfig::default()
    };
    let mut driver = EpDriver::new(&manager, rep, config).expect("valid");
    let report = driver.sweep().expect("sweep");
    assert!(report.skipped.is_empty(), "damping {damping}: {:?}", report.skipped);
    report.rejected_updates
}

#[test]
fn smaller_damping_never_increases_rejected_updates() {
    let dampings = [1.0, 0.5, 0.25, 0.1];
    let rejected: Vec<usize> = dampings
        .iter()
        .map(|&d| rejections_in_first_sweep(d))
        .collect();
    for pair in rejected.windows(2) {
        assert!(pair[1] <= pair[0], "{rejected:?}");
    }
    // Site 0's cavity stays proper only for steps below a fifth of the full one.
    assert_eq!(rejected, vec![3, 2, 1, 0]);
}

#[test]
fn exhausted_retries_skip_the_site() {
    let (manager, rep) = sharp_site_then_repulsive();
    let config = EpConfig {
        max_retry_on_rejected_update: 1,
        ..EpConfig::default()
    };
    let mut driver = EpDriver::new(&manager, rep, config).expect("valid");
    let report = driver.sweep().expect("rejections are recoverable");
    assert_eq!(report.rejected_updates, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].site, 1);
    assert_eq!(
        driver.representation().site_factor(1).expect("site"),
        SiteFactor::default()
    );
}

// ===== Representations agree =====

#[test]
fn dense_and_factorized_forms_agree_on_unit_links() {
    let links = || (0..3).map(SiteLink::unit).collect::<Vec<_>>();
    let manager = DefaultPotManager::new(
        [(1.0, 0.5), (-2.0, 2.0), (0.3, 0.1)]
            .into_iter()
            .map(|(y, v)| {
                Box::new(GaussianPotential::new(y, v).expect("valid")) as Box<dyn ScalarPotential>
            })
            .collect(),
    );
    let mean = array![0.0, 1.0, -1.0];
    let variance = array![1.0, 4.0, 0.25];
    let dense = CovarianceRepresentation::from_diagonal(mean.clone(), &variance, links())
        .expect("valid");
    let factorized = FactorizedRepresentation::new(&mean, &variance, links()).expect("valid");

    let a = EpDriver::new(&manager, dense, EpConfig::default())
        .expect("valid")
        .run()
        .expect("run");
    let b = EpDriver::new(&manager, factorized, EpConfig::default())
        .expect("valid")
        .run()
        .expect("run");
    for j in 0..3 {
        assert_relative_eq!(a.marginals.mean[j], b.marginals.mean[j], epsilon = 1e-12);
        assert_relative_eq!(
            a.marginals.variance[j],
            b.marginals.variance[j],
            epsilon = 1e-12
        );
    }
}
