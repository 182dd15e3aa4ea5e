//! Sweep scheduler for expectation propagation.
//!
//! One visit of a site walks
//! SelectingSite → ComputingCavity → MomentMatching → Projecting → Updating.
//! Recoverable failures (domain, numerical, rejected updates) skip the site
//! for the current sweep and are reported; index errors abort the run. A
//! sweep ends in CheckingConvergence, which compares the joint marginals
//! with the state at the start of the sweep.

use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::error::{EpError, EpResult, FailureKind};
use crate::manager::PotentialManager;
use crate::potentials::{EvalStats, Moments, project_site};
use crate::representation::EpRepresentation;
use crate::types::{Cavity, EpConfig, Marginals, SiteFactor, SweepOrder};

/// Where the driver currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    Idle,
    SelectingSite,
    ComputingCavity,
    MomentMatching,
    Projecting,
    Updating,
    CheckingConvergence,
    Converged,
    Exhausted,
    Cancelled,
}

/// A site that was skipped for one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteFailure {
    pub site: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Diagnostics of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// 1-based sweep number over the driver's lifetime.
    pub sweep: usize,
    /// Largest change of any marginal mean or variance over the sweep.
    pub max_change: f64,
    pub updated: usize,
    pub skipped: Vec<SiteFailure>,
    pub rejected_updates: usize,
    /// Accepted updates that took less than the full step.
    pub damped_updates: usize,
    pub stats: EvalStats,
    /// The stop callback ended the sweep early.
    pub cancelled: bool,
}

impl SweepReport {
    fn new(sweep: usize) -> Self {
        Self {
            sweep,
            max_change: 0.0,
            updated: 0,
            skipped: Vec::new(),
            rejected_updates: 0,
            damped_updates: 0,
            stats: EvalStats::default(),
            cancelled: false,
        }
    }

    /// Below tolerance with every site visited successfully.
    pub fn is_converged(&self, tolerance: f64) -> bool {
        !self.cancelled && self.skipped.is_empty() && self.max_change < tolerance
    }

    pub fn skipped_site(&self, site: usize) -> bool {
        self.skipped.iter().any(|f| f.site == site)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Converged { max_change: f64 },
    Exhausted { max_change: f64 },
    Cancelled { sweep: usize, max_change: f64 },
}

impl RunStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, RunStatus::Converged { .. })
    }

    pub fn max_change(&self) -> f64 {
        match *self {
            RunStatus::Converged { max_change }
            | RunStatus::Exhausted { max_change }
            | RunStatus::Cancelled { max_change, .. } => max_change,
        }
    }
}

/// Result of `EpDriver::run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpOutcome {
    pub status: RunStatus,
    pub marginals: Marginals,
    pub site_factors: Vec<SiteFactor>,
    pub sweeps: Vec<SweepReport>,
}

impl EpOutcome {
    pub fn rejected_updates(&self) -> usize {
        self.sweeps.iter().map(|s| s.rejected_updates).sum()
    }

    pub fn stats(&self) -> EvalStats {
        let mut total = EvalStats::default();
        for s in &self.sweeps {
            total += s.stats;
        }
        total
    }
}

/// Runs EP sweeps of a potential manager against a representation.
#[derive(Debug)]
pub struct EpDriver<'m, M: PotentialManager + ?Sized, R: EpRepresentation> {
    manager: &'m M,
    representation: R,
    config: EpConfig,
    state: DriverState,
    rng: StdRng,
    /// Magnitude of the last accepted change per site; `None` until updated.
    last_change: Vec<Option<f64>>,
    sweeps_done: usize,
}

impl<'m, M: PotentialManager + ?Sized, R: EpRepresentation> EpDriver<'m, M, R> {
    pub fn new(manager: &'m M, representation: R, config: EpConfig) -> EpResult<Self> {
        config.validate()?;
        let n = manager.num_sites();
        if representation.num_sites() != n {
            return Err(EpError::InvalidSpecification(format!(
                "manager has {n} sites but the representation has {}",
                representation.num_sites()
            )));
        }
        Ok(Self {
            manager,
            rng: StdRng::seed_from_u64(config.seed),
            representation,
            config,
            state: DriverState::Idle,
            last_change: vec![None; n],
            sweeps_done: 0,
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn config(&self) -> &EpConfig {
        &self.config
    }

    pub fn representation(&self) -> &R {
        &self.representation
    }

    pub fn into_representation(self) -> R {
        self.representation
    }

    pub fn sweeps_completed(&self) -> usize {
        self.sweeps_done
    }

    pub fn marginals(&self) -> Marginals {
        self.representation.marginals()
    }

    /// Runs until convergence or `max_sweeps`.
    ///
    /// Convergence is judged on a whole sweep, so even a model the first sweep
    /// solves exactly (Gaussian sites only) reports `Converged` after a second
    /// sweep that leaves the marginals unchanged.
    pub fn run(&mut self) -> EpResult<EpOutcome> {
        self.run_with_stop(|_, _| false)
    }

    /// As `run`; `stop(sweep, site)` is consulted before every site visit and
    /// ends the run with `Cancelled` when it returns true.
    pub fn run_with_stop<F>(&mut self, mut stop: F) -> EpResult<EpOutcome>
    where
        F: FnMut(usize, usize) -> bool,
    {
        let mut sweeps: Vec<SweepReport> = Vec::new();
        let mut status = None;
        for _ in 0..self.config.max_sweeps {
            let report = self.sweep_with_stop(&mut stop)?;
            let (max_change, cancelled, sweep) =
                (report.max_change, report.cancelled, report.sweep);
            let converged = report.is_converged(self.config.convergence_tolerance);
            sweeps.push(report);
            if cancelled {
                status = Some(RunStatus::Cancelled { sweep, max_change });
                break;
            }
            if converged {
                status = Some(RunStatus::Converged { max_change });
                break;
            }
        }
        let status = match status {
            Some(status) => status,
            None => {
                self.state = DriverState::Exhausted;
                let max_change = sweeps.last().map_or(f64::INFINITY, |s| s.max_change);
                if let Some(site) = persistent_failure(&sweeps, self.manager.num_sites()) {
                    log::warn!(
                        "[EP] site {site} failed on all {} sweeps; giving up",
                        sweeps.len()
                    );
                    return Err(EpError::PersistentSiteFailure {
                        site,
                        sweeps: sweeps.len(),
                    });
                }
                log::debug!(
                    "[EP] exhausted {} sweeps (last change {max_change:.3e})",
                    sweeps.len()
                );
                RunStatus::Exhausted { max_change }
            }
        };
        Ok(EpOutcome {
            status,
            marginals: self.representation.marginals(),
            site_factors: self.representation.site_factors(),
            sweeps,
        })
    }

    /// Runs exactly one sweep.
    pub fn sweep(&mut self) -> EpResult<SweepReport> {
        self.sweep_with_stop(&mut |_: usize, _: usize| false)
    }

    fn sweep_with_stop(
        &mut self,
        stop: &mut dyn FnMut(usize, usize) -> bool,
    ) -> EpResult<SweepReport> {
        let sweep = self.sweeps_done + 1;
        let start = self.representation.marginals();
        let mut report = SweepReport::new(sweep);
        self.state = DriverState::SelectingSite;
        let order = self.site_order();

        let outcome = if self.config.parallel {
            self.parallel_pass(&order, &mut report, stop)
        } else {
            self.sequential_pass(&order, &mut report, stop)
        };
        if let Err(err) = outcome {
            self.state = DriverState::Idle;
            return Err(err);
        }

        self.state = DriverState::CheckingConvergence;
        if self.config.refresh_each_sweep {
            if let Err(err) = self.representation.refresh() {
                self.state = DriverState::Idle;
                log::warn!("[EP] sweep {sweep}: refresh failed: {err}");
                return Err(err);
            }
        }
        report.max_change = self.representation.marginals().max_change(&start);
        self.sweeps_done = sweep;
        self.state = if report.cancelled {
            DriverState::Cancelled
        } else if report.is_converged(self.config.convergence_tolerance) {
            DriverState::Converged
        } else {
            DriverState::Idle
        };
        log::debug!(
            "[EP] sweep {sweep}: max change {:.3e}, {} updated, {} skipped, {} rejected, {} damped",
            report.max_change,
            report.updated,
            report.skipped.len(),
            report.rejected_updates,
            report.damped_updates
        );
        Ok(report)
    }

    fn sequential_pass(
        &mut self,
        order: &[usize],
        report: &mut SweepReport,
        stop: &mut dyn FnMut(usize, usize) -> bool,
    ) -> EpResult<()> {
        for &site in order {
            self.state = DriverState::SelectingSite;
            if stop(report.sweep, site) {
                report.cancelled = true;
                break;
            }
            match self.visit_site(site, report) {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => record_skip(site, &err, report),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn visit_site(&mut self, site: usize, report: &mut SweepReport) -> EpResult<()> {
        self.state = DriverState::ComputingCavity;
        let cavity = self.representation.cavity(site)?;
        self.state = DriverState::MomentMatching;
        let moments = self.manager.moments(site, cavity)?;
        self.project_and_update(site, cavity, &moments, report)
    }

    /// Cavities from the sweep-start state, moments on the rayon pool, then
    /// every update applied in sweep order.
    fn parallel_pass(
        &mut self,
        order: &[usize],
        report: &mut SweepReport,
        stop: &mut dyn FnMut(usize, usize) -> bool,
    ) -> EpResult<()> {
        self.state = DriverState::ComputingCavity;
        let mut jobs = Vec::with_capacity(order.len());
        for &site in order {
            match self.representation.cavity(site) {
                Ok(cavity) => jobs.push((site, cavity)),
                Err(err) if err.is_recoverable() => record_skip(site, &err, report),
                Err(err) => return Err(err),
            }
        }

        self.state = DriverState::MomentMatching;
        let evaluated = self.manager.par_batch_moments(&jobs);

        for ((site, cavity), moments) in jobs.into_iter().zip(evaluated) {
            if stop(report.sweep, site) {
                report.cancelled = true;
                break;
            }
            let result =
                moments.and_then(|m| self.project_and_update(site, cavity, &m, report));
            match result {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => record_skip(site, &err, report),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn project_and_update(
        &mut self,
        site: usize,
        cavity: Cavity,
        moments: &Moments,
        report: &mut SweepReport,
    ) -> EpResult<()> {
        report.stats += moments.stats;
        self.state = DriverState::Projecting;
        let target = project_site(cavity, moments)?;
        self.state = DriverState::Updating;
        self.apply_damped(site, target, report)
    }

    /// Moves the site towards `target` with the configured damping, shrinking
    /// the step after every rejected update.
    fn apply_damped(
        &mut self,
        site: usize,
        target: SiteFactor,
        report: &mut SweepReport,
    ) -> EpResult<()> {
        let current = self.representation.site_factor(site)?;
        let mut eta = self.config.damping;
        let mut retries = 0;
        loop {
            let proposal = if eta >= 1.0 {
                target
            } else {
                current.damped_towards(target, eta)
            };
            match self.representation.update_site(site, proposal) {
                Ok(delta) => {
                    report.updated += 1;
                    if eta < 1.0 {
                        report.damped_updates += 1;
                    }
                    self.last_change[site] = Some(delta.magnitude());
                    return Ok(());
                }
                Err(
                    err @ (EpError::NonPositiveDefinite { .. } | EpError::ImproperCavity { .. }),
                ) => {
                    report.rejected_updates += 1;
                    if retries >= self.config.max_retry_on_rejected_update {
                        log::warn!(
                            "[EP] site {site}: update still rejected after {retries} retries (damping {eta:.3e})"
                        );
                        return Err(err);
                    }
                    retries += 1;
                    eta *= self.config.retry_damping_shrink;
                    log::debug!("[EP] site {site}: update rejected ({err}); retrying with damping {eta:.3e}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn site_order(&mut self) -> Vec<usize> {
        let n = self.manager.num_sites();
        let mut order: Vec<usize> = (0..n).collect();
        match self.config.sweep_order {
            SweepOrder::Fixed => {}
            SweepOrder::Random => order.shuffle(&mut self.rng),
            SweepOrder::Priority => {
                let floor = self.config.min_change_for_priority;
                let key = |site: usize| match self.last_change[site] {
                    None => f64::INFINITY,
                    Some(change) if change <= floor => 0.0,
                    Some(change) => change,
                };
                // Stable: ties keep index order.
                order.sort_by(|&a, &b| key(b).total_cmp(&key(a)));
            }
        }
        order
    }
}

fn record_skip(site: usize, err: &EpError, report: &mut SweepReport) {
    log::warn!("[EP] sweep {}: skipping site {site}: {err}", report.sweep);
    report.skipped.push(SiteFailure {
        site,
        kind: err.kind(),
        message: err.to_string(),
    });
}

/// First site skipped on every one of `sweeps`.
fn persistent_failure(sweeps: &[SweepReport], num_sites: usize) -> Option<usize> {
    if sweeps.is_empty() {
        return None;
    }
    (0..num_sites).find(|&site| sweeps.iter().all(|s| s.skipped_site(site)))
}
