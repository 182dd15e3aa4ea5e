use crate::linalg::FaerLinalgError;
use thiserror::Error;

/// Why a numerical primitive could not produce a trustworthy answer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NumericalFailure {
    #[error(
        "quadrature did not converge: error estimate {error_estimate:.3e} after {subdivisions} subdivisions"
    )]
    QuadratureNotConverged {
        error_estimate: f64,
        subdivisions: usize,
    },

    #[error(
        "proximal Newton solve did not converge within {iterations} iterations (|grad| = {gradient_norm:.3e})"
    )]
    ProximalNotConverged {
        iterations: usize,
        gradient_norm: f64,
    },

    #[error("{quantity} evaluated to a non-finite value")]
    NonFinite { quantity: &'static str },

    #[error("tilted variance is not positive (1 + rho * d2logZ = {factor:.3e})")]
    InvalidProjection { factor: f64 },

    #[error("tilted distribution has zero mass (log Z = -inf)")]
    ZeroMass,
}

/// Errors surfaced by potentials, representations and the EP driver.
#[derive(Error)]
pub enum EpError {
    #[error("Domain error: {what}")]
    Domain { what: String },

    #[error("Numerical error: {0}")]
    Numerical(#[from] NumericalFailure),

    #[error(
        "Update of site {site} would make the joint precision non-positive-definite (pivot {pivot:.4e})"
    )]
    NonPositiveDefinite { site: usize, pivot: f64 },

    #[error("Cavity for site {site} is improper (precision {precision:.4e})")]
    ImproperCavity { site: usize, precision: f64 },

    #[error("Index {index} is out of range for {len} entries")]
    Index { index: usize, len: usize },

    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("No potential is registered under the tag '{0}'")]
    UnknownPotential(String),

    #[error("Site {site} failed to update on every one of {sweeps} sweeps")]
    PersistentSiteFailure { site: usize, sweeps: usize },

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] FaerLinalgError),
}

// Debug delegates to Display so test failures read like the error message.
impl core::fmt::Debug for EpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self)
    }
}

impl EpError {
    pub fn domain(what: impl Into<String>) -> Self {
        EpError::Domain { what: what.into() }
    }

    /// Errors the driver absorbs as "skip this site for this sweep".
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EpError::Domain { .. }
                | EpError::Numerical(_)
                | EpError::NonPositiveDefinite { .. }
                | EpError::ImproperCavity { .. }
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            EpError::Domain { .. } => FailureKind::Domain,
            EpError::Numerical(_) => FailureKind::Numerical,
            EpError::NonPositiveDefinite { .. } => FailureKind::NonPositiveDefinite,
            EpError::ImproperCavity { .. } => FailureKind::ImproperCavity,
            EpError::Index { .. } => FailureKind::Index,
            _ => FailureKind::Other,
        }
    }
}

/// Coarse classification used in sweep diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    Domain,
    Numerical,
    NonPositiveDefinite,
    ImproperCavity,
    Index,
    Other,
}

pub type EpResult<T> = Result<T, EpError>;

/// Rejects non-positive or non-finite cavity variances and non-finite means.
#[inline]
pub(crate) fn check_cavity(mean: f64, variance: f64) -> EpResult<()> {
    if !mean.is_finite() {
        return Err(EpError::domain(format!("cavity mean must be finite, got {mean}")));
    }
    if !(variance.is_finite() && variance > 0.0) {
        return Err(EpError::domain(format!(
            "cavity variance must be finite and > 0, got {variance}"
        )));
    }
    Ok(())
}
