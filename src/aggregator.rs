//! The aggregator interface: one tagged variant per scheduling algorithm.
//!
//! All aggregators share the `initialize` / `execute_jumps` /
//! `generate_jumps` contract: the stepper asks for the next jump time,
//! advances the clock, applies the jump's affect, and lets the aggregator
//! repair its tables and publish the next jump.

use crate::coevolve::Coevolve;
use crate::rssacr::RssaCr;
use crate::spatial::{RssaCrDirect, SpatialJump};
use crate::stepper::SsaIntegrator;
use crate::SimError;

pub enum Aggregator {
    Coevolve(Coevolve),
    RssaCr(RssaCr),
    RssaCrDirect(RssaCrDirect),
}

impl Aggregator {
    /// Build tables and schedule the first jump; publishes
    /// `integrator.tstop`.
    pub fn initialize(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        match self {
            Aggregator::Coevolve(agg) => agg.initialize(integrator),
            Aggregator::RssaCr(agg) => agg.initialize(integrator),
            Aggregator::RssaCrDirect(agg) => agg.initialize(integrator),
        }
    }

    /// Apply the currently scheduled jump's affect and repair dependent
    /// rates.
    pub fn execute_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        match self {
            Aggregator::Coevolve(agg) => agg.execute_jumps(integrator),
            Aggregator::RssaCr(agg) => agg.execute_jumps(integrator),
            Aggregator::RssaCrDirect(agg) => agg.execute_jumps(integrator),
        }
    }

    /// Publish the next scheduled jump and its time.
    pub fn generate_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        match self {
            Aggregator::Coevolve(agg) => agg.generate_jumps(integrator),
            Aggregator::RssaCr(agg) => agg.generate_jumps(integrator),
            Aggregator::RssaCrDirect(agg) => agg.generate_jumps(integrator),
        }
    }

    /// Full resynchronisation after the state was edited outside a jump.
    pub fn reset(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        match self {
            Aggregator::Coevolve(agg) => agg.reset(integrator),
            Aggregator::RssaCr(agg) => agg.reset(integrator),
            Aggregator::RssaCrDirect(agg) => agg.reset(integrator),
        }
    }

    pub fn next_jump_time(&self) -> f64 {
        match self {
            Aggregator::Coevolve(agg) => agg.next_jump_time(),
            Aggregator::RssaCr(agg) => agg.next_jump_time(),
            Aggregator::RssaCrDirect(agg) => agg.next_jump_time(),
        }
    }

    /// Stable identity of the scheduled jump, used by the stepper's
    /// apply-once policy at floating-point time ties.
    pub fn next_jump_id(&self) -> u64 {
        match self {
            Aggregator::Coevolve(agg) => agg.next_jump as u64,
            Aggregator::RssaCr(agg) => agg.next_jump as u64,
            Aggregator::RssaCrDirect(agg) => match agg.next_jump {
                None => u64::MAX,
                Some(SpatialJump::Reaction { site, rx }) => {
                    (site as u64) << 32 | rx as u64
                }
                Some(SpatialJump::Hop { site, species, dst }) => {
                    1u64 << 63 | (site as u64) << 40 | (species as u64) << 20 | dst as u64
                }
            },
        }
    }

    pub fn end_time(&self) -> f64 {
        match self {
            Aggregator::Coevolve(agg) => agg.end_time(),
            Aggregator::RssaCr(agg) => agg.end_time(),
            Aggregator::RssaCrDirect(agg) => agg.end_time(),
        }
    }

    /// Overwrite a mass-action rate constant (intervention support).
    pub fn set_ma_rate(&mut self, k: usize, rate: f64) -> Result<(), SimError> {
        match self {
            Aggregator::Coevolve(agg) => agg.set_ma_rate(k, rate),
            Aggregator::RssaCr(agg) => agg.set_ma_rate(k, rate),
            Aggregator::RssaCrDirect(agg) => agg.set_ma_rate(k, rate),
        }
    }

    pub(crate) fn num_ma_rates(&self) -> usize {
        match self {
            Aggregator::Coevolve(agg) => agg.num_ma_rates(),
            Aggregator::RssaCr(agg) => agg.num_ma_rates(),
            Aggregator::RssaCrDirect(agg) => agg.num_ma_rates(),
        }
    }
}

impl From<Coevolve> for Aggregator {
    fn from(agg: Coevolve) -> Self {
        Aggregator::Coevolve(agg)
    }
}

impl From<RssaCr> for Aggregator {
    fn from(agg: RssaCr) -> Self {
        Aggregator::RssaCr(agg)
    }
}

impl From<RssaCrDirect> for Aggregator {
    fn from(agg: RssaCrDirect) -> Self {
        Aggregator::RssaCrDirect(agg)
    }
}
