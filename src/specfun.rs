//! Special-function services consumed by the site potentials.
//!
//! Potentials receive a `SpecialFunctions` handle at construction instead of
//! calling free functions, so an alternative implementation (for instance a
//! higher-precision one used as a test oracle) can be injected per model.

use statrs::function::erf;
use statrs::function::gamma::ln_gamma;
use std::f64::consts::{FRAC_1_SQRT_2, PI};

pub const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Below this argument `log Φ(x)` switches to the asymptotic tail series.
const LOG_CDF_ASYMPTOTIC_CUTOFF: f64 = -35.0;

/// Standard normal PDF φ(x).
#[inline]
pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// log(Σ exp(x_k)) without overflow. Empty input gives -inf.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// log(1 + e^x).
#[inline]
pub fn softplus(x: f64) -> f64 {
    if x > 35.0 {
        x
    } else if x < -35.0 {
        x.exp()
    } else {
        x.exp().ln_1p()
    }
}

/// Logistic sigmoid 1 / (1 + e^{-x}).
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// The math-services interface the potentials call into.
pub trait SpecialFunctions: Send + Sync {
    fn erf(&self, x: f64) -> f64;

    fn erfc(&self, x: f64) -> f64;

    fn log_gamma(&self, x: f64) -> f64;

    /// log Φ(x) for the standard normal CDF, accurate deep in the lower tail.
    fn log_normal_cdf(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        if x < LOG_CDF_ASYMPTOTIC_CUTOFF {
            return log_normal_cdf_tail(x);
        }
        if x > 5.0 {
            return (-0.5 * self.erfc(x * FRAC_1_SQRT_2)).ln_1p();
        }
        (0.5 * self.erfc(-x * FRAC_1_SQRT_2)).ln()
    }

    /// log φ(x) for the standard normal density.
    fn log_normal_pdf(&self, x: f64) -> f64 {
        -0.5 * x * x - LN_SQRT_2PI
    }

    /// log n!
    fn log_factorial(&self, n: u64) -> f64 {
        if n < 2 {
            0.0
        } else {
            self.log_gamma(n as f64 + 1.0)
        }
    }

    /// φ(x) / Φ(x), stable for very negative x where both factors underflow.
    fn inverse_mills(&self, x: f64) -> f64 {
        (self.log_normal_pdf(x) - self.log_normal_cdf(x)).exp()
    }
}

/// Asymptotic expansion of log Φ(x) for x → -∞.
fn log_normal_cdf_tail(x: f64) -> f64 {
    let z2 = 1.0 / (x * x);
    // 1 - 1/x² + 3/x⁴ - 15/x⁶ + 105/x⁸
    let series = 1.0 - z2 * (1.0 - z2 * (3.0 - z2 * (15.0 - 105.0 * z2)));
    -0.5 * x * x - (-x).ln() - LN_SQRT_2PI + series.ln()
}

/// Default services backed by `statrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatrsSpecfun;

impl SpecialFunctions for StatrsSpecfun {
    fn erf(&self, x: f64) -> f64 {
        erf::erf(x)
    }

    fn erfc(&self, x: f64) -> f64 {
        erf::erfc(x)
    }

    fn log_gamma(&self, x: f64) -> f64 {
        ln_gamma(x)
    }
}

/// log N(x; mean, variance).
#[inline]
pub fn log_gaussian_density(x: f64, mean: f64, variance: f64) -> f64 {
    let d = x - mean;
    -0.5 * (d * d / variance + (2.0 * PI * variance).ln())
}
