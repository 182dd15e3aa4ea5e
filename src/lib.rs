#![allow(non_snake_case)]

pub mod driver;
pub mod error;
pub mod linalg;
pub mod manager;
pub mod potentials;
pub mod quadrature;
pub mod representation;
pub mod setup;
pub mod solver;
pub mod specfun;
pub mod types;

pub use driver::{DriverState, EpDriver, EpOutcome, RunStatus, SiteFailure, SweepReport};
pub use error::{EpError, EpResult, FailureKind, NumericalFailure};
pub use manager::{ContainerPotManager, DefaultPotManager, PotManagerFactory, PotentialManager};
pub use potentials::{
    EvalStats, GaussMixtureDensity, GaussianPotential, LaplaceApproxPotential, LaplaceDensity,
    Moments, NumericalServices, PoissonExpDensity, PoissonLogisticDensity, PotentialFactory,
    ProbitDensity, ProbitPotential, QuadraturePotential, QuantileDensity, ScalarPotential,
    SiteDensity, SpikeSlabPotential, project_site,
};
pub use quadrature::{
    AdaptiveGaussKronrod, AdaptiveGaussLegendre, QuadratureServices, Tolerance, TracingQuadrature,
    quadrature_services,
};
pub use representation::{
    AnyRepresentation, CovarianceRepresentation, EpRepresentation, FactorizedRepresentation,
    RepresentationKind, SiteDelta, SiteLink,
};
pub use setup::{
    ModelSpec, PriorSpec, SiteSpec, build_grouped_model, build_model, run_model,
};
pub use specfun::{SpecialFunctions, StatrsSpecfun};
pub use types::{
    Cavity, EpConfig, Marginals, ProximalOptions, QuadratureBackend, QuadratureOptions,
    SiteFactor, SweepOrder,
};
