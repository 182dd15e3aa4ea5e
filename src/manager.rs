//! Site index → potential registries.

use std::fmt::Debug;

use rayon::prelude::*;

use crate::error::{EpError, EpResult};
use crate::potentials::{Moments, NumericalServices, PotentialFactory, ScalarPotential};
use crate::types::Cavity;

/// Indexed collection of the potentials of one model.
pub trait PotentialManager: Send + Sync + Debug {
    fn num_sites(&self) -> usize;

    fn potential_for_site(&self, index: usize) -> EpResult<&dyn ScalarPotential>;

    fn moments(&self, index: usize, cavity: Cavity) -> EpResult<Moments> {
        self.potential_for_site(index)?
            .moments(cavity.mean, cavity.variance)
    }

    /// Moments of each `(site, cavity)` job, in job order.
    fn batch_moments(&self, jobs: &[(usize, Cavity)]) -> Vec<EpResult<Moments>> {
        jobs.iter()
            .map(|&(site, cavity)| self.moments(site, cavity))
            .collect()
    }

    /// As `batch_moments`, evaluated on the rayon pool.
    fn par_batch_moments(&self, jobs: &[(usize, Cavity)]) -> Vec<EpResult<Moments>> {
        jobs.par_iter()
            .map(|&(site, cavity)| self.moments(site, cavity))
            .collect()
    }
}

/// Flat vector of owned potentials.
#[derive(Debug, Default)]
pub struct DefaultPotManager {
    potentials: Vec<Box<dyn ScalarPotential>>,
}

impl DefaultPotManager {
    pub fn new(potentials: Vec<Box<dyn ScalarPotential>>) -> Self {
        Self { potentials }
    }

    /// Builds from (site index, potential) pairs in any order. The indices
    /// must be exactly 0..n with no duplicates.
    pub fn from_indexed(entries: Vec<(usize, Box<dyn ScalarPotential>)>) -> EpResult<Self> {
        let n = entries.len();
        let mut slots: Vec<Option<Box<dyn ScalarPotential>>> = (0..n).map(|_| None).collect();
        for (index, potential) in entries {
            let slot = slots.get_mut(index).ok_or(EpError::Index { index, len: n })?;
            if slot.is_some() {
                return Err(EpError::InvalidSpecification(format!(
                    "site {index} is registered more than once"
                )));
            }
            *slot = Some(potential);
        }
        // n entries, all in range and unique: every slot is filled.
        Ok(Self {
            potentials: slots.into_iter().flatten().collect(),
        })
    }

    pub fn push(&mut self, potential: Box<dyn ScalarPotential>) -> usize {
        self.potentials.push(potential);
        self.potentials.len() - 1
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.potentials.iter().map(|p| p.name())
    }
}

impl PotentialManager for DefaultPotManager {
    fn num_sites(&self) -> usize {
        self.potentials.len()
    }

    fn potential_for_site(&self, index: usize) -> EpResult<&dyn ScalarPotential> {
        self.potentials
            .get(index)
            .map(|p| p.as_ref())
            .ok_or(EpError::Index {
                index,
                len: self.potentials.len(),
            })
    }
}

/// Managers composed over contiguous site ranges.
#[derive(Debug, Default)]
pub struct ContainerPotManager {
    parts: Vec<Box<dyn PotentialManager>>,
    /// First global site index of each part.
    offsets: Vec<usize>,
    total: usize,
}

impl ContainerPotManager {
    pub fn new(parts: Vec<Box<dyn PotentialManager>>) -> Self {
        let mut container = Self::default();
        for part in parts {
            container.push(part);
        }
        container
    }

    /// Appends a part; its sites follow all existing ones.
    pub fn push(&mut self, part: Box<dyn PotentialManager>) {
        self.offsets.push(self.total);
        self.total += part.num_sites();
        self.parts.push(part);
    }

    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    fn locate(&self, index: usize) -> EpResult<(usize, usize)> {
        if index >= self.total {
            return Err(EpError::Index {
                index,
                len: self.total,
            });
        }
        // Last part starting at or before index; empty parts share the next
        // part's offset and are never selected.
        let part = self.offsets.partition_point(|&start| start <= index) - 1;
        Ok((part, index - self.offsets[part]))
    }
}

impl PotentialManager for ContainerPotManager {
    fn num_sites(&self) -> usize {
        self.total
    }

    fn potential_for_site(&self, index: usize) -> EpResult<&dyn ScalarPotential> {
        let (part, local) = self.locate(index)?;
        self.parts[part].potential_for_site(local)
    }
}

/// Builds managers from (tag, params) site descriptions.
#[derive(Debug)]
pub struct PotManagerFactory<'a> {
    factory: &'a PotentialFactory,
    services: &'a NumericalServices,
}

impl<'a> PotManagerFactory<'a> {
    pub fn new(factory: &'a PotentialFactory, services: &'a NumericalServices) -> Self {
        Self { factory, services }
    }

    pub fn build_default<'s>(
        &self,
        sites: impl IntoIterator<Item = (&'s str, &'s [f64])>,
    ) -> EpResult<DefaultPotManager> {
        let mut manager = DefaultPotManager::default();
        for (tag, params) in sites {
            manager.push(self.factory.create(tag, params, self.services)?);
        }
        Ok(manager)
    }

    /// One `DefaultPotManager` per run of consecutive sites sharing a tag.
    pub fn build_grouped<'s>(
        &self,
        sites: impl IntoIterator<Item = (&'s str, &'s [f64])>,
    ) -> EpResult<ContainerPotManager> {
        let mut container = ContainerPotManager::default();
        let mut current: Option<(&str, DefaultPotManager)> = None;
        for (tag, params) in sites {
            let potential = self.factory.create(tag, params, self.services)?;
            match current.as_mut() {
                Some((run_tag, run)) if *run_tag == tag => {
                    run.push(potential);
                    continue;
                }
                _ => {}
            }
            if let Some((_, run)) = current.take() {
                container.push(Box::new(run));
            }
            current = Some((tag, DefaultPotManager::new(vec![potential])));
        }
        if let Some((_, run)) = current {
            container.push(Box::new(run));
        }
        Ok(container)
    }
}
