use std::sync::Arc;

use approx::assert_relative_eq;
use eptools::{
    EpError, GaussMixtureDensity, GaussianPotential, Moments, NumericalServices, PotentialFactory, ProbitDensity,
    ProbitPotential, ProximalOptions, QuadratureBackend, QuadratureOptions, QuadraturePotential,
    ScalarPotential, SpecialFunctions, StatrsSpecfun,
};

fn cavity_grid() -> Vec<(f64, f64)> {
    let mut grid = Vec::new();
    for &h in &[-3.0, -1.0, -0.25, 0.0, 0.5, 2.0, 4.0] {
        for &rho in &[0.05, 0.3, 1.0, 4.0] {
            grid.push((h, rho));
        }
    }
    grid
}

fn assert_close(a: &Moments, b: &Moments, tol: f64, context: &str) {
    assert_relative_eq!(a.log_z, b.log_z, epsilon = tol, max_relative = tol);
    assert!(
        (a.dlogz_dmean - b.dlogz_dmean).abs() <= tol * (1.0 + b.dlogz_dmean.abs()),
        "{context}: d1 {} vs {}",
        a.dlogz_dmean,
        b.dlogz_dmean
    );
    assert!(
        (a.d2logz_dmean2 - b.d2logz_dmean2).abs() <= tol * (1.0 + b.d2logz_dmean2.abs()),
        "{context}: d2 {} vs {}",
        a.d2logz_dmean2,
        b.d2logz_dmean2
    );
}

fn services(backend: QuadratureBackend) -> NumericalServices {
    NumericalServices::new(
        QuadratureOptions {
            backend,
            ..QuadratureOptions::default()
        },
        ProximalOptions::default(),
    )
}

#[test]
fn gaussian_quadrature_matches_closed_form_over_cavity_grid() {
    for backend in [
        QuadratureBackend::Standard,
        QuadratureBackend::CompatibilityMode,
    ] {
        for &(y, v) in &[(0.0, 1.0), (2.0, 0.5), (-1.5, 0.1)] {
            let exact = GaussianPotential::new(y, v).expect("valid");
            let quad = QuadraturePotential::new(exact.clone(), services(backend));
            for (h, rho) in cavity_grid() {
                let a = quad.moments(h, rho).expect("quadrature");
                let b = ScalarPotential::moments(&exact, h, rho).expect("closed form");
                assert_close(&a, &b, 1e-6, &format!("{backend:?} y={y} v={v} h={h} rho={rho}"));
            }
        }
    }
}

#[test]
fn probit_quadrature_matches_closed_form_as_noise_vanishes() {
    let sf: Arc<dyn SpecialFunctions> = Arc::new(StatrsSpecfun);
    for &noise in &[1.0, 0.1, 0.01, 0.0] {
        for &label in &[1.0, -1.0] {
            let exact = ProbitPotential::new(label, 0.3, noise, sf.clone()).expect("valid");
            let quad = QuadraturePotential::new(
                ProbitDensity::new(label, 0.3, noise, sf.clone()).expect("valid"),
                services(QuadratureBackend::Standard),
            );
            for h in [-2.0, -0.5, 0.0, 0.5, 2.0] {
                for rho in [0.3, 1.0, 4.0] {
                    let a = quad.moments(h, rho).expect("quadrature");
                    let b = exact.moments(h, rho).expect("closed form");
                    assert_close(
                        &a,
                        &b,
                        1e-6,
                        &format!("noise={noise} label={label} h={h} rho={rho}"),
                    );
                }
            }
        }
    }
}

#[test]
fn closed_form_probit_approaches_the_step() {
    let sf: Arc<dyn SpecialFunctions> = Arc::new(StatrsSpecfun);
    let step = ProbitPotential::new(1.0, 0.0, 0.0, sf.clone()).expect("valid");
    let nearly = ProbitPotential::new(1.0, 0.0, 1e-12, sf).expect("valid");
    for (h, rho) in cavity_grid() {
        let a = nearly.moments(h, rho).expect("noisy");
        let b = step.moments(h, rho).expect("step");
        assert_close(&a, &b, 1e-5, &format!("h={h} rho={rho}"));
    }
}

#[test]
fn positive_label_pushes_the_mean_up() {
    let factory = PotentialFactory::with_defaults();
    let probit = factory
        .create("probit", &[1.0], &NumericalServices::default())
        .expect("valid");
    let m = probit.moments(0.0, 1.0).expect("moments");
    assert!(m.dlogz_dmean > 0.0);
    assert!(m.d2logz_dmean2 < 0.0);
    assert_relative_eq!(m.log_z, 0.5_f64.ln(), epsilon = 1e-12);
}

#[test]
fn every_catalogue_entry_validates_its_cavity() {
    let factory = PotentialFactory::with_defaults();
    let services = NumericalServices::default();
    let cases: [(&str, &[f64]); 9] = [
        ("gaussian", &[0.0, 1.0]),
        ("probit", &[-1.0, 0.5, 0.2]),
        ("spike_slab", &[0.5, 1.0]),
        ("laplace", &[2.0, 0.0]),
        ("quantile", &[1.0, 0.25]),
        ("gauss_mixture", &[1.0, 0.0, 1.0, 2.0, 1.0, 3.0]),
        ("poisson_exp", &[2.0]),
        ("poisson_logistic", &[0.0]),
        ("poisson_exp_laplace", &[7.0]),
    ];
    for (tag, params) in cases {
        let potential = factory.create(tag, params, &services).expect("valid");
        for (h, rho) in [(0.3, 0.7), (-1.0, 2.5)] {
            let m = potential.moments(h, rho).expect("valid cavity");
            assert!(m.log_z.is_finite(), "{tag}");
            assert!(m.dlogz_dmean.is_finite(), "{tag}");
            assert!(m.d2logz_dmean2.is_finite(), "{tag}");
        }
        for bad_variance in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(potential.moments(0.0, bad_variance), Err(EpError::Domain { .. })),
                "{tag} accepted variance {bad_variance}"
            );
        }
        assert!(matches!(
            potential.moments(f64::NAN, 1.0),
            Err(EpError::Domain { .. })
        ));
    }
}

#[test]
fn laplace_approximation_tracks_quadrature_for_large_counts() {
    let factory = PotentialFactory::with_defaults();
    let services = NumericalServices::default();
    let exact = factory
        .create("poisson_exp", &[40.0], &services)
        .expect("valid");
    let approx = factory
        .create("poisson_exp_laplace", &[40.0], &services)
        .expect("valid");
    for (h, rho) in [(3.5, 0.5), (3.0, 2.0)] {
        let a = exact.moments(h, rho).expect("quadrature");
        let b = approx.moments(h, rho).expect("laplace");
        let tilted_a = a.dlogz_dmean * rho + h;
        let tilted_b = b.dlogz_dmean * rho + h;
        assert!((tilted_a - tilted_b).abs() < 5e-2, "{tilted_a} vs {tilted_b}");
    }
}

#[test]
fn spike_slab_is_the_narrow_spike_limit_of_a_gaussian_mixture() {
    let factory = PotentialFactory::with_defaults();
    let services = NumericalServices::default();
    for &(p, v) in &[(0.2, 4.0), (0.7, 0.5), (1.0, 2.0)] {
        let spike_slab = factory
            .create("spike_slab", &[p, v], &services)
            .expect("valid");
        let narrow =
            GaussMixtureDensity::new(&[1.0 - p, p], &[0.0, 0.0], &[1e-12, v]).expect("valid");
        for (h, rho) in cavity_grid() {
            let a = spike_slab.moments(h, rho).expect("closed form");
            let b = narrow.exact_moments(h, rho).expect("mixture");
            assert_close(&a, &b, 1e-9, &format!("p={p} v={v} h={h} rho={rho}"));
            assert_eq!(a.stats.quadrature_calls, 0);
        }
    }
    assert!(matches!(
        factory.create("spike_slab", &[0.0, 1.0], &services),
        Err(EpError::InvalidSpecification(_))
    ));
}

#[test]
fn laplace_poisson_needs_no_integration() {
    let factory = PotentialFactory::with_defaults();
    let services = NumericalServices::default();
    let approx = factory
        .create("poisson_exp_laplace", &[40.0], &services)
        .expect("valid");
    let m = approx.moments(0.5, 1.0).expect("laplace");
    assert_eq!(m.stats.quadrature_calls, 0);
    assert_eq!(m.stats.integrand_evaluations, 0);
    assert!(m.stats.proximal_iterations > 0);
}
