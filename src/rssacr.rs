//! Rejection-sampling aggregator with composition-rejection selection.
//!
//! Each jump carries a bracketed rate envelope `[r_lo, r_hi]` computed
//! from the species brackets; the priority table holds the upper bounds.
//! A step samples a candidate jump proportional to `r_hi`, accepts
//! cheaply below `r_lo`, exactly below the true rate otherwise; waiting
//! time accumulates one `Exp(1)/gsum` per candidate. Because the envelope
//! is conservative, no table is touched until a fired jump pushes some
//! species outside its bracket.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::brackets::{rate_bracket, BracketData, SpeciesBrackets};
use crate::depgraph::build_var_to_jumps;
use crate::priority_table::PriorityTable;
use crate::rates::JumpSystem;
use crate::stepper::{register_next_jump_time, SsaIntegrator};
use crate::{randexp, SimError};

impl std::fmt::Debug for RssaCr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RssaCr").finish_non_exhaustive()
    }
}

pub struct RssaCr {
    sys: JumpSystem,
    bracket_data: BracketData,
    brackets: SpeciesBrackets,
    cur_rate_low: Vec<f64>,
    cur_rate_high: Vec<f64>,
    pt: PriorityTable,
    vartojumps: Vec<Vec<usize>>,
    scratch: Vec<usize>,
    pub(crate) next_jump: usize,
    pub(crate) next_jump_time: f64,
    end_time: f64,
    rng: ChaCha8Rng,
}

/// Rate envelope of jump `k` over the current species brackets.
fn envelope(
    sys: &JumpSystem,
    ulow: &[i32],
    uhigh: &[i32],
    p: &[f64],
    t: f64,
    k: usize,
) -> Result<(f64, f64), SimError> {
    let m = sys.num_mass_action();
    let (lo, hi) = if k < m {
        // mass-action propensities are monotone in every species count
        (sys.mass_action.eval_rate(ulow, k), sys.mass_action.eval_rate(uhigh, k))
    } else {
        rate_bracket(&sys.constant_jumps[k - m].rate, ulow, uhigh, p, t)
    };
    if lo.is_nan() || hi.is_nan() || lo < 0.0 {
        return Err(SimError::Domain(format!(
            "jump {} rate envelope evaluated to [{}, {}]",
            k, lo, hi
        )));
    }
    Ok((lo, hi))
}

impl RssaCr {
    pub fn new(
        sys: JumpSystem,
        u0: &[i32],
        params: &[f64],
        bracket_data: BracketData,
        end_time: f64,
        seed: u64,
    ) -> Result<Self, SimError> {
        sys.validate(u0.len())?;
        if sys.num_variable() > 0 {
            return Err(SimError::Configuration(
                "the rejection aggregator does not support variable-rate jumps".into(),
            ));
        }
        if sys.rate_reads.len() != sys.num_constant() || sys.rate_writes.len() != sys.num_constant()
        {
            return Err(SimError::Configuration(format!(
                "bracket repair needs read and write sets for all {} constant-rate jumps",
                sys.num_constant()
            )));
        }
        let n = sys.num_jumps();
        let vartojumps = build_var_to_jumps(u0.len(), &sys);
        let brackets = SpeciesBrackets::new(bracket_data, u0);
        let mut cur_rate_low = vec![0.0; n];
        let mut cur_rate_high = vec![0.0; n];
        for k in 0..n {
            let (lo, hi) = envelope(&sys, &brackets.ulow, &brackets.uhigh, params, 0.0, k)?;
            cur_rate_low[k] = lo;
            cur_rate_high[k] = hi;
        }
        let pt = build_table(&cur_rate_high)?;
        Ok(Self {
            sys,
            bracket_data,
            brackets,
            cur_rate_low,
            cur_rate_high,
            pt,
            vartojumps,
            scratch: Vec::new(),
            next_jump: 0,
            next_jump_time: f64::INFINITY,
            end_time,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn next_jump_time(&self) -> f64 {
        self.next_jump_time
    }

    pub(crate) fn num_ma_rates(&self) -> usize {
        self.sys.num_mass_action()
    }

    pub(crate) fn set_ma_rate(&mut self, k: usize, rate: f64) -> Result<(), SimError> {
        self.sys.mass_action.set_rate(k, rate)
    }

    #[cfg(test)]
    pub(crate) fn envelope_of(&self, k: usize) -> (f64, f64) {
        (self.cur_rate_low[k], self.cur_rate_high[k])
    }

    #[cfg(test)]
    pub(crate) fn brackets(&self) -> &SpeciesBrackets {
        &self.brackets
    }

    #[cfg(test)]
    pub(crate) fn exact_rate(
        &self,
        integrator: &SsaIntegrator,
        k: usize,
    ) -> Result<f64, SimError> {
        self.sys
            .eval_rate(&integrator.u, &integrator.p, integrator.t, k)
    }

    pub(crate) fn initialize(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        self.brackets = SpeciesBrackets::new(self.bracket_data, &integrator.u);
        for k in 0..self.sys.num_jumps() {
            let (lo, hi) = envelope(
                &self.sys,
                &self.brackets.ulow,
                &self.brackets.uhigh,
                &integrator.p,
                integrator.t,
                k,
            )?;
            self.cur_rate_low[k] = lo;
            self.cur_rate_high[k] = hi;
        }
        self.pt = build_table(&self.cur_rate_high)?;
        self.generate_jumps(integrator)
    }

    pub(crate) fn execute_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        let k = self.next_jump;
        self.sys.execute(integrator, k);

        let mut touched = std::mem::take(&mut self.scratch);
        self.sys.write_species_into(k, &mut touched);
        for &species in &touched {
            let n = integrator.u[species];
            if !self.brackets.is_outside(species, n) {
                continue;
            }
            trace!(species, count = n, "species left its bracket");
            self.brackets.refresh_species(species, n);
            for idx in 0..self.vartojumps[species].len() {
                let j = self.vartojumps[species][idx];
                let (lo, hi) = envelope(
                    &self.sys,
                    &self.brackets.ulow,
                    &self.brackets.uhigh,
                    &integrator.p,
                    integrator.t,
                    j,
                )?;
                let old = self.cur_rate_high[j];
                self.cur_rate_low[j] = lo;
                self.cur_rate_high[j] = hi;
                self.pt.update(j, old, hi)?;
            }
        }
        self.scratch = touched;
        Ok(())
    }

    pub(crate) fn generate_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        let t = integrator.t;
        let mut ttnj = 0.0;
        loop {
            let gsum = self.pt.gsum();
            if gsum <= 0.0 {
                self.next_jump_time = f64::INFINITY;
                break;
            }
            ttnj += randexp(&mut self.rng) / gsum;
            if t + ttnj > self.end_time {
                // no acceptance inside the horizon
                self.next_jump_time = f64::INFINITY;
                break;
            }
            let Some(k) = self.pt.sample(&mut self.rng) else {
                self.next_jump_time = f64::INFINITY;
                break;
            };
            let v = self.rng.gen::<f64>() * self.cur_rate_high[k];
            let accepted = if v <= self.cur_rate_low[k] {
                true
            } else {
                let rate = self
                    .sys
                    .eval_rate(&integrator.u, &integrator.p, t + ttnj, k)?;
                v <= rate
            };
            if accepted {
                self.next_jump = k;
                self.next_jump_time = t + ttnj;
                break;
            }
        }
        register_next_jump_time(integrator, self.next_jump_time);
        Ok(())
    }

    pub(crate) fn reset(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        self.initialize(integrator)
    }
}

/// Priority table over the upper bounds, sized from the positive range.
fn build_table(rate_high: &[f64]) -> Result<PriorityTable, SimError> {
    let mut minp = f64::INFINITY;
    let mut maxp = 0.0f64;
    for &r in rate_high {
        if r > 0.0 {
            minp = minp.min(r);
            maxp = maxp.max(r);
        }
    }
    if !minp.is_finite() {
        // all rates zero; any well-formed range works, inserts extend it
        minp = 1.0;
        maxp = 1.0;
    }
    PriorityTable::new(minp, 2.0 * maxp, rate_high)
}
