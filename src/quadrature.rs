//! Adaptive quadrature services for tilted-moment integrals.
//!
//! # Backends
//!
//! - `AdaptiveGaussKronrod`: 7/15-point Gauss-Kronrod panels with the usual
//!   QUADPACK error heuristic. Panels are kept in a max-heap keyed on their
//!   error estimate and the worst panel is bisected until the summed error
//!   meets the tolerance or the subdivision budget runs out.
//! - `AdaptiveGaussLegendre`: compatibility backend. Each panel is integrated
//!   with an n-point Gauss-Legendre rule on the whole panel and on both halves;
//!   the difference is the error estimate. The rule itself is generated once
//!   by the Golub-Welsch algorithm and cached in a `QuadratureContext`.
//!
//! # Infinite bounds
//!
//! Improper integrals are mapped onto a finite interval before subdivision:
//! - (-∞, ∞): x = t / (1 - t²), t ∈ (-1, 1)
//! - [a, ∞):  x = a + t / (1 - t), t ∈ [0, 1)
//! - (-∞, b]: x = b - t / (1 - t), t ∈ [0, 1)
//!
//! Caller breakpoints (kinks of the integrand) are pushed through the same map
//! and seed the initial partition, so no panel straddles a kink.
//!
//! # Vector-valued integrands
//!
//! `integrate_moments` integrates three components over one shared partition.
//! The error criterion uses the largest component error, so every component is
//! converged on the same nodes and the derived moments stay mutually consistent.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, OnceLock};

use crate::types::{QuadratureBackend, QuadratureOptions};

/// Gauss-Legendre order used by the compatibility backend.
const LEGENDRE_POINTS: usize = 10;

/// Panels narrower than this (relative to their location) are not bisected.
const MIN_RELATIVE_WIDTH: f64 = 64.0 * f64::EPSILON;

// 15-point Kronrod abscissae (non-negative half) and weights, with the
// embedded 7-point Gauss weights for the odd-indexed abscissae.
const XGK: [f64; 8] = [
    0.991_455_371_120_812_6,
    0.949_107_912_342_758_5,
    0.864_864_423_359_769_1,
    0.741_531_185_599_394_4,
    0.586_087_235_467_691_1,
    0.405_845_151_377_397_2,
    0.207_784_955_007_898_5,
    0.0,
];
const WGK: [f64; 8] = [
    0.022_935_322_010_529_22,
    0.063_092_092_629_978_55,
    0.104_790_010_322_250_2,
    0.140_653_259_715_525_9,
    0.169_004_726_639_267_9,
    0.190_350_578_064_785_4,
    0.204_432_940_075_298_9,
    0.209_482_141_084_727_8,
];
const WG: [f64; 4] = [
    0.129_484_966_168_869_7,
    0.279_705_391_489_276_7,
    0.381_830_050_505_118_9,
    0.417_959_183_673_469_4,
];

/// Absolute and relative accuracy request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub abs: f64,
    pub rel: f64,
}

impl Tolerance {
    pub fn new(abs: f64, rel: f64) -> Self {
        Self { abs, rel }
    }

    /// Scales both components, used when retrying with a looser request.
    pub fn relaxed(self, factor: f64) -> Self {
        Self {
            abs: self.abs * factor,
            rel: self.rel * factor,
        }
    }

    fn target(&self, magnitude: f64) -> f64 {
        self.abs.max(self.rel * magnitude)
    }
}

/// Outcome of one quadrature job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadratureResult<const N: usize> {
    pub estimate: [f64; N],
    pub error_estimate: f64,
    pub converged: bool,
    pub subdivisions: usize,
    pub evaluations: usize,
}

impl QuadratureResult<1> {
    pub fn value(&self) -> f64 {
        self.estimate[0]
    }
}

/// Quadrature capability handed to potentials.
pub trait QuadratureServices: Send + Sync {
    fn name(&self) -> &'static str;

    /// ∫ f over [lower, upper]; either bound may be infinite.
    fn integrate(
        &self,
        f: &dyn Fn(f64) -> f64,
        lower: f64,
        upper: f64,
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<1>;

    /// ∫ f over [lower, upper] for a three-component integrand sharing one partition.
    fn integrate_moments(
        &self,
        f: &dyn Fn(f64) -> [f64; 3],
        lower: f64,
        upper: f64,
        breakpoints: &[f64],
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<3>;
}

/// Builds the backend selected in the options.
pub fn quadrature_services(options: &QuadratureOptions) -> Arc<dyn QuadratureServices> {
    match (options.backend, options.trace) {
        (QuadratureBackend::Standard, false) => Arc::new(AdaptiveGaussKronrod),
        (QuadratureBackend::Standard, true) => Arc::new(TracingQuadrature::new(AdaptiveGaussKronrod)),
        (QuadratureBackend::CompatibilityMode, false) => Arc::new(AdaptiveGaussLegendre::new()),
        (QuadratureBackend::CompatibilityMode, true) => {
            Arc::new(TracingQuadrature::new(AdaptiveGaussLegendre::new()))
        }
    }
}

#[derive(Default, Clone, Copy)]
struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    fn sum(self) -> f64 {
        self.sum
    }
}

/// Change of variables onto a finite interval.
#[derive(Debug, Clone, Copy)]
enum Mapping {
    Finite,
    WholeLine,
    UpperInfinite { a: f64 },
    LowerInfinite { b: f64 },
}

impl Mapping {
    fn for_bounds(lower: f64, upper: f64) -> (Self, f64, f64) {
        match (lower.is_finite(), upper.is_finite()) {
            (true, true) => (Mapping::Finite, lower, upper),
            (false, false) => (Mapping::WholeLine, -1.0, 1.0),
            (true, false) => (Mapping::UpperInfinite { a: lower }, 0.0, 1.0),
            (false, true) => (Mapping::LowerInfinite { b: upper }, 0.0, 1.0),
        }
    }

    /// x(t) and dx/dt.
    #[inline]
    fn forward(&self, t: f64) -> (f64, f64) {
        match *self {
            Mapping::Finite => (t, 1.0),
            Mapping::WholeLine => {
                let d = 1.0 - t * t;
                (t / d, (1.0 + t * t) / (d * d))
            }
            Mapping::UpperInfinite { a } => {
                let d = 1.0 - t;
                (a + t / d, 1.0 / (d * d))
            }
            Mapping::LowerInfinite { b } => {
                let d = 1.0 - t;
                (b - t / d, 1.0 / (d * d))
            }
        }
    }

    fn inverse(&self, x: f64) -> f64 {
        match *self {
            Mapping::Finite => x,
            Mapping::WholeLine => 2.0 * x / (1.0 + (1.0 + 4.0 * x * x).sqrt()),
            Mapping::UpperInfinite { a } => (x - a) / (1.0 + x - a),
            Mapping::LowerInfinite { b } => (b - x) / (1.0 + b - x),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Panel<const N: usize> {
    a: f64,
    b: f64,
    estimate: [f64; N],
    error: f64,
}

impl<const N: usize> PartialEq for Panel<N> {
    fn eq(&self, other: &Self) -> bool {
        self.error.total_cmp(&other.error) == Ordering::Equal
    }
}

impl<const N: usize> Eq for Panel<N> {}

impl<const N: usize> PartialOrd for Panel<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> Ord for Panel<N> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.error.total_cmp(&other.error)
    }
}

/// One fixed rule applied to a single panel.
trait PanelRule {
    /// Returns (estimate, error, evaluations).
    fn apply<const N: usize, F: Fn(f64) -> [f64; N]>(
        &self,
        f: &F,
        a: f64,
        b: f64,
    ) -> ([f64; N], f64, usize);
}

#[inline]
fn max_abs<const N: usize>(v: &[f64; N]) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| {
        if x.is_nan() { f64::NAN } else { acc.max(x.abs()) }
    })
}

fn adaptive<const N: usize, R: PanelRule, F: Fn(f64) -> [f64; N]>(
    rule: &R,
    f: &F,
    lower: f64,
    upper: f64,
    breakpoints: &[f64],
    tolerance: Tolerance,
    max_subdivisions: usize,
) -> QuadratureResult<N> {
    if lower.is_nan() || upper.is_nan() {
        return QuadratureResult {
            estimate: [f64::NAN; N],
            error_estimate: f64::INFINITY,
            converged: false,
            subdivisions: 0,
            evaluations: 0,
        };
    }
    if lower == upper {
        return QuadratureResult {
            estimate: [0.0; N],
            error_estimate: 0.0,
            converged: true,
            subdivisions: 0,
            evaluations: 0,
        };
    }
    if lower > upper {
        let mut flipped = adaptive(rule, f, upper, lower, breakpoints, tolerance, max_subdivisions);
        for v in flipped.estimate.iter_mut() {
            *v = -*v;
        }
        return flipped;
    }

    let (mapping, t_lo, t_hi) = Mapping::for_bounds(lower, upper);
    let g = |t: f64| -> [f64; N] {
        let (x, jac) = mapping.forward(t);
        let mut v = f(x);
        for c in v.iter_mut() {
            // Underflowed tails contribute nothing, even against a huge Jacobian.
            *c = if *c == 0.0 { 0.0 } else { *c * jac };
        }
        v
    };

    let mut cuts: Vec<f64> = breakpoints
        .iter()
        .copied()
        .filter(|&x| x.is_finite() && x > lower && x < upper)
        .map(|x| mapping.inverse(x))
        .filter(|&t| t > t_lo && t < t_hi)
        .collect();
    cuts.push(t_lo);
    cuts.push(t_hi);
    cuts.sort_by(f64::total_cmp);
    cuts.dedup();

    let mut heap = BinaryHeap::with_capacity(cuts.len() + 2 * max_subdivisions);
    let mut evaluations = 0usize;
    let mut total = [0.0_f64; N];
    let mut total_error = 0.0_f64;
    for w in cuts.windows(2) {
        let (estimate, error, evals) = rule.apply(&g, w[0], w[1]);
        evaluations += evals;
        for k in 0..N {
            total[k] += estimate[k];
        }
        total_error += error;
        heap.push(Panel {
            a: w[0],
            b: w[1],
            estimate,
            error,
        });
    }

    let mut subdivisions = 0usize;
    let mut converged = false;
    loop {
        if !total_error.is_finite() || total.iter().any(|v| !v.is_finite()) {
            break;
        }
        if total_error <= tolerance.target(max_abs(&total)) {
            converged = true;
            break;
        }
        if subdivisions >= max_subdivisions {
            break;
        }
        let Some(worst) = heap.pop() else {
            break;
        };
        let mid = 0.5 * (worst.a + worst.b);
        let scale = worst.a.abs().max(worst.b.abs()).max(1.0);
        if (worst.b - worst.a) <= MIN_RELATIVE_WIDTH * scale {
            heap.push(worst);
            break;
        }
        let (left, left_err, e1) = rule.apply(&g, worst.a, mid);
        let (right, right_err, e2) = rule.apply(&g, mid, worst.b);
        evaluations += e1 + e2;
        subdivisions += 1;
        for k in 0..N {
            total[k] += left[k] + right[k] - worst.estimate[k];
        }
        total_error += left_err + right_err - worst.error;
        heap.push(Panel {
            a: worst.a,
            b: mid,
            estimate: left,
            error: left_err,
        });
        heap.push(Panel {
            a: mid,
            b: worst.b,
            estimate: right,
            error: right_err,
        });
    }

    // Re-sum from the panels so the running updates do not accumulate drift.
    let mut sums = [KahanSum::default(); N];
    let mut err_sum = KahanSum::default();
    for panel in heap.iter() {
        for k in 0..N {
            sums[k].add(panel.estimate[k]);
        }
        err_sum.add(panel.error);
    }
    let estimate: [f64; N] = std::array::from_fn(|k| sums[k].sum());
    let error_estimate = err_sum.sum();
    let converged =
        converged && error_estimate.is_finite() && estimate.iter().all(|v| v.is_finite());

    QuadratureResult {
        estimate,
        error_estimate,
        converged,
        subdivisions,
        evaluations,
    }
}

/// Standard backend: adaptive 7/15-point Gauss-Kronrod.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveGaussKronrod;

impl PanelRule for AdaptiveGaussKronrod {
    fn apply<const N: usize, F: Fn(f64) -> [f64; N]>(
        &self,
        f: &F,
        a: f64,
        b: f64,
    ) -> ([f64; N], f64, usize) {
        let center = 0.5 * (a + b);
        let half = 0.5 * (b - a);
        let f_center = f(center);
        let mut fv1 = [[0.0_f64; N]; 7];
        let mut fv2 = [[0.0_f64; N]; 7];
        for j in 0..7 {
            let dx = half * XGK[j];
            fv1[j] = f(center - dx);
            fv2[j] = f(center + dx);
        }

        let mut worst = 0.0_f64;
        let mut estimate = [0.0_f64; N];
        for k in 0..N {
            let mut res_gauss = f_center[k] * WG[3];
            let mut res_kronrod = f_center[k] * WGK[7];
            for j in 0..3 {
                let idx = 2 * j + 1;
                let pair = fv1[idx][k] + fv2[idx][k];
                res_gauss += WG[j] * pair;
                res_kronrod += WGK[idx] * pair;
            }
            for j in 0..4 {
                let idx = 2 * j;
                res_kronrod += WGK[idx] * (fv1[idx][k] + fv2[idx][k]);
            }
            let mean = 0.5 * res_kronrod;
            let mut res_asc = WGK[7] * (f_center[k] - mean).abs();
            for j in 0..7 {
                res_asc += WGK[j] * ((fv1[j][k] - mean).abs() + (fv2[j][k] - mean).abs());
            }
            res_asc *= half.abs();

            let mut err = ((res_kronrod - res_gauss) * half).abs();
            if res_asc != 0.0 && err != 0.0 {
                err = res_asc * (200.0 * err / res_asc).powf(1.5).min(1.0);
            }
            estimate[k] = res_kronrod * half;
            worst = if err.is_nan() { f64::NAN } else { worst.max(err) };
        }
        (estimate, worst, 15)
    }
}

impl QuadratureServices for AdaptiveGaussKronrod {
    fn name(&self) -> &'static str {
        "gauss-kronrod-15"
    }

    fn integrate(
        &self,
        f: &dyn Fn(f64) -> f64,
        lower: f64,
        upper: f64,
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<1> {
        adaptive(self, &|x| [f(x)], lower, upper, &[], tolerance, max_subdivisions)
    }

    fn integrate_moments(
        &self,
        f: &dyn Fn(f64) -> [f64; 3],
        lower: f64,
        upper: f64,
        breakpoints: &[f64],
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<3> {
        adaptive(self, &f, lower, upper, breakpoints, tolerance, max_subdivisions)
    }
}

/// Gauss-Legendre rule on [-1, 1].
struct GaussLegendreRule {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

/// Caches generated rules so every job reuses the same nodes and weights.
pub struct QuadratureContext {
    legendre: OnceLock<GaussLegendreRule>,
}

impl QuadratureContext {
    pub fn new() -> Self {
        Self {
            legendre: OnceLock::new(),
        }
    }

    fn gauss_legendre(&self) -> &GaussLegendreRule {
        self.legendre
            .get_or_init(|| compute_gauss_legendre(LEGENDRE_POINTS))
    }
}

impl Default for QuadratureContext {
    fn default() -> Self {
        Self::new()
    }
}

const DEFLATION_EPS: f64 = 1e-15;
const MAX_QR_STEPS: usize = 200;

/// Golub-Welsch for Legendre polynomials.
///
/// Nodes are the eigenvalues of the Jacobi matrix and weights are μ₀ v₀², with
/// μ₀ = ∫ 1 dx = 2 and v₀ the first component of the unit eigenvector.
fn compute_gauss_legendre(n: usize) -> GaussLegendreRule {
    let mut jacobi = JacobiMatrix::legendre(n);
    jacobi.diagonalize();
    let mut pairs: Vec<(f64, f64)> = jacobi
        .diag
        .iter()
        .zip(&jacobi.first_row)
        .map(|(&node, &v0)| (node, 2.0 * v0 * v0))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    GaussLegendreRule {
        nodes: pairs.iter().map(|p| p.0).collect(),
        weights: pairs.iter().map(|p| p.1).collect(),
    }
}

/// Symmetric tridiagonal matrix diagonalized in place by implicit QR steps
/// with Wilkinson shifts.
///
/// Only the first component of every eigenvector is accumulated.
struct JacobiMatrix {
    diag: Vec<f64>,
    off_diag: Vec<f64>,
    first_row: Vec<f64>,
}

impl JacobiMatrix {
    /// Zero diagonal, off-diagonal k / sqrt(4k² - 1).
    fn legendre(n: usize) -> Self {
        let off_diag = (1..n)
            .map(|k| {
                let k = k as f64;
                k / (4.0 * k * k - 1.0).sqrt()
            })
            .collect();
        let mut first_row = vec![0.0; n];
        if let Some(v) = first_row.first_mut() {
            *v = 1.0;
        }
        Self {
            diag: vec![0.0; n],
            off_diag,
            first_row,
        }
    }

    fn diagonalize(&mut self) {
        let mut last = self.diag.len().saturating_sub(1);
        while last > 0 {
            let mut deflated = false;
            for _ in 0..MAX_QR_STEPS {
                let start = self.block_start(last);
                if start == last {
                    deflated = true;
                    break;
                }
                self.qr_step(start, last);
            }
            if !deflated {
                // Legendre Jacobi matrices are small and well conditioned.
                self.off_diag[last - 1] = 0.0;
            }
            last -= 1;
        }
    }

    /// First row of the unreduced block ending at `last`; negligible couplings
    /// on the way are set to zero.
    fn block_start(&mut self, last: usize) -> usize {
        let mut start = last;
        while start > 0 {
            let scale = self.diag[start - 1].abs() + self.diag[start].abs();
            if self.off_diag[start - 1].abs() <= DEFLATION_EPS * scale {
                self.off_diag[start - 1] = 0.0;
                break;
            }
            start -= 1;
        }
        start
    }

    /// One shifted QR sweep over rows `start..=last`, chasing the bulge down.
    fn qr_step(&mut self, start: usize, last: usize) {
        let shift = wilkinson_shift(
            self.diag[last - 1],
            self.off_diag[last - 1],
            self.diag[last],
        );
        let mut x = self.diag[start] - shift;
        let mut y = self.off_diag[start];
        for k in start..last {
            let (c, s) = givens(x, y);
            if k > start {
                self.off_diag[k - 1] = x.hypot(y);
            }
            let (d1, d2, e) = (self.diag[k], self.diag[k + 1], self.off_diag[k]);
            self.diag[k] = c * c * d1 + s * s * d2 - 2.0 * c * s * e;
            self.diag[k + 1] = s * s * d1 + c * c * d2 + 2.0 * c * s * e;
            self.off_diag[k] = c * s * (d1 - d2) + (c * c - s * s) * e;
            if k + 1 < last {
                x = self.off_diag[k];
                y = -s * self.off_diag[k + 1];
                self.off_diag[k + 1] *= c;
            }
            let (u, v) = (self.first_row[k], self.first_row[k + 1]);
            self.first_row[k] = c * u - s * v;
            self.first_row[k + 1] = s * u + c * v;
        }
    }
}

/// Rotation with c·x − s·y = r and s·x + c·y = 0.
fn givens(x: f64, y: f64) -> (f64, f64) {
    let r = x.hypot(y);
    if y.abs() <= DEFLATION_EPS || !(r > 0.0 && r.is_finite()) {
        (1.0, 0.0)
    } else {
        (x / r, -y / r)
    }
}

/// Eigenvalue of [[a, b], [b, c]] nearest to c.
fn wilkinson_shift(a: f64, b: f64, c: f64) -> f64 {
    let half_gap = 0.5 * (a - c);
    let radius = half_gap.hypot(b);
    let denom = if half_gap >= 0.0 {
        half_gap + radius
    } else {
        half_gap - radius
    };
    if denom.abs() > f64::EPSILON * radius.max(1.0) {
        c - b * b / denom
    } else {
        c - radius
    }
}

/// Compatibility backend: whole-panel vs split-panel Gauss-Legendre.
pub struct AdaptiveGaussLegendre {
    ctx: QuadratureContext,
}

impl AdaptiveGaussLegendre {
    pub fn new() -> Self {
        Self {
            ctx: QuadratureContext::new(),
        }
    }

    fn fixed<const N: usize, F: Fn(f64) -> [f64; N]>(&self, f: &F, a: f64, b: f64) -> [f64; N] {
        let rule = self.ctx.gauss_legendre();
        let center = 0.5 * (a + b);
        let half = 0.5 * (b - a);
        let mut acc = [0.0_f64; N];
        for (x, w) in rule.nodes.iter().zip(rule.weights.iter()) {
            let v = f(center + half * x);
            for k in 0..N {
                acc[k] += w * v[k];
            }
        }
        for v in acc.iter_mut() {
            *v *= half;
        }
        acc
    }
}

impl Default for AdaptiveGaussLegendre {
    fn default() -> Self {
        Self::new()
    }
}

impl PanelRule for AdaptiveGaussLegendre {
    fn apply<const N: usize, F: Fn(f64) -> [f64; N]>(
        &self,
        f: &F,
        a: f64,
        b: f64,
    ) -> ([f64; N], f64, usize) {
        let mid = 0.5 * (a + b);
        let whole = self.fixed(f, a, b);
        let left = self.fixed(f, a, mid);
        let right = self.fixed(f, mid, b);
        let mut estimate = [0.0_f64; N];
        let mut err = 0.0_f64;
        for k in 0..N {
            estimate[k] = left[k] + right[k];
            let diff = (estimate[k] - whole[k]).abs();
            err = if diff.is_nan() { f64::NAN } else { err.max(diff) };
        }
        (estimate, err, 3 * LEGENDRE_POINTS)
    }
}

impl QuadratureServices for AdaptiveGaussLegendre {
    fn name(&self) -> &'static str {
        "gauss-legendre-compat"
    }

    fn integrate(
        &self,
        f: &dyn Fn(f64) -> f64,
        lower: f64,
        upper: f64,
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<1> {
        adaptive(self, &|x| [f(x)], lower, upper, &[], tolerance, max_subdivisions)
    }

    fn integrate_moments(
        &self,
        f: &dyn Fn(f64) -> [f64; 3],
        lower: f64,
        upper: f64,
        breakpoints: &[f64],
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<3> {
        adaptive(self, &f, lower, upper, breakpoints, tolerance, max_subdivisions)
    }
}

/// Logs every job it forwards at trace level.
pub struct TracingQuadrature<Q> {
    inner: Q,
}

impl<Q: QuadratureServices> TracingQuadrature<Q> {
    pub fn new(inner: Q) -> Self {
        Self { inner }
    }
}

impl<Q: QuadratureServices> QuadratureServices for TracingQuadrature<Q> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn integrate(
        &self,
        f: &dyn Fn(f64) -> f64,
        lower: f64,
        upper: f64,
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<1> {
        let result = self.inner.integrate(f, lower, upper, tolerance, max_subdivisions);
        log::trace!(
            "[EP quad] {} [{:.3e}, {:.3e}] -> {:.6e} (err {:.2e}, {} subdiv, {} evals, converged {})",
            self.inner.name(),
            lower,
            upper,
            result.estimate[0],
            result.error_estimate,
            result.subdivisions,
            result.evaluations,
            result.converged
        );
        result
    }

    fn integrate_moments(
        &self,
        f: &dyn Fn(f64) -> [f64; 3],
        lower: f64,
        upper: f64,
        breakpoints: &[f64],
        tolerance: Tolerance,
        max_subdivisions: usize,
    ) -> QuadratureResult<3> {
        let result =
            self.inner
                .integrate_moments(f, lower, upper, breakpoints, tolerance, max_subdivisions);
        log::trace!(
            "[EP quad] {} moments {} breakpoints -> {:?} (err {:.2e}, {} subdiv, {} evals, converged {})",
            self.inner.name(),
            breakpoints.len(),
            result.estimate,
            result.error_estimate,
            result.subdivisions,
            result.evaluations,
            result.converged
        );
        result
    }
}
