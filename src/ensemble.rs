//! Parallel trajectory ensembles.
//!
//! A single trajectory is strictly single-threaded; parallelism lives at
//! the ensemble level. Every worker builds its own stepper (aggregators
//! own their RNG exclusively) from a seed derived deterministically from
//! the base seed, so results are reproducible at any thread count.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::stepper::{Solution, SsaStepper};
use crate::SimError;

/// SplitMix64 mix of the base seed and the trajectory index.
pub fn derive_seed(seed: Option<u64>, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let mut z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

/// Run `n_trajectories` independent trajectories in parallel; `build`
/// receives the derived per-trajectory seed and returns a ready stepper.
pub fn run_ensemble<F>(
    n_trajectories: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
    build: F,
) -> Result<Vec<Solution>, SimError>
where
    F: Fn(u64) -> Result<SsaStepper, SimError> + Send + Sync,
{
    if n_trajectories == 0 {
        return Err(SimError::Configuration(
            "number of trajectories must be greater than zero".into(),
        ));
    }
    let simulate = || {
        (0..n_trajectories)
            .into_par_iter()
            .map(|i| build(derive_seed(seed, i as u64))?.solve())
            .collect::<Result<Vec<_>, _>>()
    };
    match n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(simulate),
        None => simulate(),
    }
}

/// Per-save-point species means across an ensemble whose trajectories
/// share a save schedule.
pub fn mean_at_saves(solutions: &[Solution]) -> Result<Vec<Vec<f64>>, SimError> {
    let Some(first) = solutions.first() else {
        return Ok(Vec::new());
    };
    let n_saves = first.len();
    let n_species = first.u.first().map(Vec::len).unwrap_or(0);
    for sol in solutions {
        if sol.len() != n_saves || sol.u.iter().any(|u| u.len() != n_species) {
            return Err(SimError::Shape(
                "trajectories do not share a save schedule".into(),
            ));
        }
    }
    let scale = 1.0 / solutions.len() as f64;
    let mut means = vec![vec![0.0f64; n_species]; n_saves];
    for sol in solutions {
        for (mean, u) in means.iter_mut().zip(sol.u.iter()) {
            for (m, &count) in mean.iter_mut().zip(u.iter()) {
                *m += count as f64 * scale;
            }
        }
    }
    Ok(means)
}
