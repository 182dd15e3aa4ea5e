//! Proximal Newton solver for one-dimensional regularized objectives
//!
//!   F(x) = term(x) + 0.5 · precision · (x − center)²
//!
//! where `term` is a smooth negative log-likelihood. This is the mode search
//! behind quadrature centring and Laplace approximations of tilted
//! distributions.

use crate::error::{EpError, EpResult, NumericalFailure};
use crate::types::ProximalOptions;

/// Smooth scalar term with first and second derivatives.
pub trait SmoothTerm {
    /// (value, gradient, hessian) at `x`, or `None` outside the domain.
    fn evaluate(&self, x: f64) -> Option<(f64, f64, f64)>;
}

impl<F> SmoothTerm for F
where
    F: Fn(f64) -> Option<(f64, f64, f64)>,
{
    fn evaluate(&self, x: f64) -> Option<(f64, f64, f64)> {
        self(x)
    }
}

/// The full proximal objective around a Gaussian anchor.
pub struct ProximalObjective<'a, T: SmoothTerm + ?Sized> {
    pub term: &'a T,
    pub center: f64,
    pub precision: f64,
}

impl<T: SmoothTerm + ?Sized> ProximalObjective<'_, T> {
    /// (objective, gradient, curvature) at `x`.
    fn evaluate(&self, x: f64) -> Option<(f64, f64, f64)> {
        let (f, g, h) = self.term.evaluate(x)?;
        let d = x - self.center;
        let value = f + 0.5 * self.precision * d * d;
        let grad = g + self.precision * d;
        let curv = h + self.precision;
        if value.is_finite() && grad.is_finite() && curv.is_finite() {
            Some((value, grad, curv))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximalSolution {
    pub argmin: f64,
    pub iterations: usize,
    pub gradient_norm: f64,
    /// Objective curvature at the argmin (term hessian plus precision).
    pub curvature: f64,
    /// Term hessian at the argmin, without the precision.
    pub term_hessian: f64,
}

#[derive(Debug, Clone, Copy)]
struct IterationInfo {
    iteration: usize,
    objective: f64,
    gradient_norm: f64,
    step_size: f64,
    step_halving: usize,
}

/// Minimizes the objective from `initial`; `Err` when the gradient tolerance
/// is not met within `options.max_iterations` Newton steps.
pub fn proximal_newton<T: SmoothTerm + ?Sized>(
    objective: &ProximalObjective<'_, T>,
    initial: f64,
    options: &ProximalOptions,
) -> EpResult<ProximalSolution> {
    if !(objective.precision.is_finite() && objective.precision > 0.0) {
        return Err(EpError::domain(format!(
            "proximal precision must be finite and > 0, got {}",
            objective.precision
        )));
    }
    if !objective.center.is_finite() || !initial.is_finite() {
        return Err(EpError::domain("proximal anchor must be finite"));
    }

    let mut x = initial;
    let mut state = match objective.evaluate(x) {
        Some(s) => s,
        None => {
            x = objective.center;
            objective.evaluate(x).ok_or(NumericalFailure::NonFinite {
                quantity: "proximal objective",
            })?
        }
    };

    let converged_at = |x: f64, grad: f64| {
        let scale = 1.0 + (objective.precision * (x - objective.center)).abs();
        grad.abs() <= options.tolerance * scale
    };

    for iteration in 0..options.max_iterations {
        let (value, grad, curv) = state;
        if converged_at(x, grad) {
            return Ok(solution(objective, x, iteration, state));
        }
        // Curvature floor keeps the step a descent direction for non-convex terms.
        let step = -grad / curv.max(objective.precision);
        let mut t = 1.0;
        let mut accepted = None;
        let mut halving = 0usize;
        while halving <= options.max_step_halving {
            let candidate = x + t * step;
            if let Some(next) = objective.evaluate(candidate)
                && next.0 <= value + 1e-12 * value.abs().max(1.0)
            {
                accepted = Some((candidate, next));
                break;
            }
            t *= 0.5;
            halving += 1;
            if (t * step).abs() < options.min_step_size {
                break;
            }
        }
        let info = IterationInfo {
            iteration: iteration + 1,
            objective: value,
            gradient_norm: grad.abs(),
            step_size: t,
            step_halving: halving,
        };
        log::trace!(
            "[EP prox] iter {:>3} | objective {:.6e} | |grad| {:.3e} | step {:.3e} (halving {})",
            info.iteration,
            info.objective,
            info.gradient_norm,
            info.step_size,
            info.step_halving
        );
        match accepted {
            Some((next_x, next_state)) => {
                x = next_x;
                state = next_state;
            }
            None => {
                // No decrease along the Newton direction: stalled at floating-point resolution.
                if converged_at(x, grad * 1e-3) {
                    return Ok(solution(objective, x, iteration + 1, state));
                }
                log::debug!(
                    "[EP prox] line search stalled at x = {:.6e} (|grad| {:.3e})",
                    x,
                    grad.abs()
                );
                return Err(NumericalFailure::ProximalNotConverged {
                    iterations: iteration + 1,
                    gradient_norm: grad.abs(),
                }
                .into());
            }
        }
    }

    let (_, grad, _) = state;
    if converged_at(x, grad) {
        return Ok(solution(objective, x, options.max_iterations, state));
    }
    log::debug!(
        "[EP prox] no convergence after {} iterations (x = {:.6e}, |grad| {:.3e})",
        options.max_iterations,
        x,
        grad.abs()
    );
    Err(NumericalFailure::ProximalNotConverged {
        iterations: options.max_iterations,
        gradient_norm: grad.abs(),
    }
    .into())
}

fn solution<T: SmoothTerm + ?Sized>(
    objective: &ProximalObjective<'_, T>,
    x: f64,
    iterations: usize,
    state: (f64, f64, f64),
) -> ProximalSolution {
    let (_, grad, curv) = state;
    ProximalSolution {
        argmin: x,
        iterations,
        gradient_norm: grad.abs(),
        curvature: curv,
        term_hessian: curv - objective.precision,
    }
}
