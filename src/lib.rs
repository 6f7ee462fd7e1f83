//! Stochastic simulation of continuous-time Markov jump processes.
//!
//! A system evolves by a finite catalog of discrete jumps (reactions,
//! hops), each firing at a state-dependent rate. The crate samples exact
//! trajectories of such processes. Its centre of gravity is the family of
//! *jump aggregators* — the data structures that decide, at every step,
//! when the next jump fires and which one it is, and that incrementally
//! repair themselves after the jump mutates the state:
//!
//! - [`Coevolve`](coevolve::Coevolve): thinning against per-jump rate
//!   bounds, for time-varying rates;
//! - [`RssaCr`](rssacr::RssaCr): rejection sampling against bracketed rate
//!   envelopes with a grouped priority table;
//! - [`RssaCrDirect`](spatial::RssaCrDirect): the spatial variant, grouped
//!   priorities over lattice sites with Direct selection within a site.
//!
//! The [`SsaStepper`](stepper::SsaStepper) drives an aggregator over a time
//! span, records the trajectory, and applies timed interventions; the
//! [`ensemble`] module runs many trajectories in parallel with
//! deterministic per-worker seeding.

use rand::Rng;
use thiserror::Error;

pub mod aggregator;
pub mod brackets;
pub mod coevolve;
pub mod depgraph;
pub mod ensemble;
pub mod priority_table;
pub mod rates;
pub mod rssacr;
pub mod spatial;
pub mod stepper;
pub mod time_table;

pub use aggregator::Aggregator;
pub use brackets::{BracketData, SpeciesBrackets};
pub use coevolve::Coevolve;
pub use priority_table::PriorityTable;
pub use rates::{
    hill_rate, michaelis_menten_rate, AffectFn, ConstantRateJump, ExpressionRate, JumpSystem,
    MassActionJump, RateFn, VariableRateJump,
};
pub use rssacr::RssaCr;
pub use spatial::{CartesianGrid, RssaCrDirect, SpatialJump, SpatialSystem};
pub use stepper::{
    InterventionAction, InterventionEvent, InterventionPlan, Retcode, Solution, SsaIntegrator,
    SsaStepper,
};
pub use time_table::PriorityTimeTable;

pub(crate) const TIME_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("domain error: {0}")]
    Domain(String),
    #[error("rate bound violation: {0}")]
    RateBound(String),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// A unit-rate exponential draw.
#[inline]
pub(crate) fn randexp<R: Rng>(rng: &mut R) -> f64 {
    rng.sample::<f64, _>(rand_distr::Exp1)
}

#[cfg(test)]
mod tests;
