//! The SSA stepper: drives an aggregator over a time span and records the
//! trajectory.
//!
//! The stepper owns the integrator record that aggregator affects mutate;
//! it passes mutable access down only for the duration of `execute_jumps`
//! and `generate_jumps`. Between jumps the state is constant, so save
//! points are flushed lazily from the held state.

use crate::aggregator::Aggregator;
use crate::{SimError, TIME_EPSILON};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retcode {
    Default,
    Success,
    Terminated,
}

/// The mutable record shared between the stepper and the aggregator.
pub struct SsaIntegrator {
    pub t: f64,
    pub tprev: f64,
    pub u: Vec<i32>,
    pub p: Vec<f64>,
    /// The aggregator-owned next jump time.
    pub tstop: f64,
    /// Set by callbacks that edit `u` outside a jump; forces an
    /// aggregator resynchronisation.
    pub u_modified: bool,
    keep_stepping: bool,
    pub retcode: Retcode,
}

impl SsaIntegrator {
    pub fn new(u0: Vec<i32>, p: Vec<f64>, t0: f64) -> Self {
        Self {
            t: t0,
            tprev: t0,
            u: u0,
            p,
            tstop: f64::INFINITY,
            u_modified: false,
            keep_stepping: true,
            retcode: Retcode::Default,
        }
    }

    pub fn terminate(&mut self) {
        self.keep_stepping = false;
        self.retcode = Retcode::Terminated;
    }

    pub fn keep_stepping(&self) -> bool {
        self.keep_stepping
    }
}

/// Publish the aggregator's next jump time. This writes `tstop` only; it
/// must not push into the user tstop list, which would cost `O(log N)`
/// per jump.
#[inline]
pub fn register_next_jump_time(integrator: &mut SsaIntegrator, t: f64) {
    integrator.tstop = t;
}

/// A saved trajectory.
#[derive(Clone, Debug)]
pub struct Solution {
    pub t: Vec<f64>,
    pub u: Vec<Vec<i32>>,
    pub retcode: Retcode,
}

impl Solution {
    fn new() -> Self {
        Self {
            t: Vec::new(),
            u: Vec::new(),
            retcode: Retcode::Default,
        }
    }

    fn save(&mut self, t: f64, u: &[i32]) {
        self.t.push(t);
        self.u.push(u.to_vec());
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn final_state(&self) -> Option<&[i32]> {
        self.u.last().map(Vec::as_slice)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum InterventionAction {
    SpeciesDelta { species: usize, delta: i32 },
    SpeciesSet { species: usize, value: i32 },
    RateSet { reaction: usize, value: f64 },
}

#[derive(Clone, Debug)]
pub struct InterventionEvent {
    pub time: f64,
    pub actions: Vec<InterventionAction>,
}

/// Timed state edits applied by the stepper at user tstops.
#[derive(Clone, Debug, Default)]
pub struct InterventionPlan {
    pub events: Vec<InterventionEvent>,
}

impl InterventionPlan {
    pub fn validate(&self, n_species: usize, n_reactions: usize) -> Result<(), SimError> {
        let mut last_time = -f64::INFINITY;
        for event in &self.events {
            if event.time.is_nan() || event.time < 0.0 {
                return Err(SimError::Configuration(
                    "intervention times must be non-negative numbers".into(),
                ));
            }
            if event.time + TIME_EPSILON < last_time {
                return Err(SimError::Configuration(
                    "intervention times must be sorted".into(),
                ));
            }
            last_time = event.time;
            if event.actions.is_empty() {
                return Err(SimError::Configuration(
                    "each intervention must specify at least one action".into(),
                ));
            }
            for action in &event.actions {
                match *action {
                    InterventionAction::SpeciesDelta { species, .. }
                    | InterventionAction::SpeciesSet { species, .. } => {
                        if species >= n_species {
                            return Err(SimError::Configuration(format!(
                                "intervention refers to invalid species index {}",
                                species
                            )));
                        }
                    }
                    InterventionAction::RateSet { reaction, .. } => {
                        if reaction >= n_reactions {
                            return Err(SimError::Configuration(format!(
                                "intervention refers to invalid reaction index {}",
                                reaction
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

pub type StepCallback = Box<dyn FnMut(&mut SsaIntegrator) + Send>;

/// Drives an aggregator from `tspan.0` to `tspan.1`.
pub struct SsaStepper {
    pub aggregator: Aggregator,
    pub integrator: SsaIntegrator,
    t_end: f64,
    saveat: Vec<f64>,
    save_positions: (bool, bool),
    interventions: InterventionPlan,
    callback: Option<StepCallback>,
}

impl SsaStepper {
    pub fn new(
        aggregator: Aggregator,
        u0: Vec<i32>,
        p: Vec<f64>,
        tspan: (f64, f64),
    ) -> Result<Self, SimError> {
        if !tspan.0.is_finite() || !tspan.1.is_finite() || tspan.1 <= tspan.0 {
            return Err(SimError::Configuration(format!(
                "time span must be finite and increasing, got ({}, {})",
                tspan.0, tspan.1
            )));
        }
        Ok(Self {
            aggregator,
            integrator: SsaIntegrator::new(u0, p, tspan.0),
            t_end: tspan.1,
            saveat: Vec::new(),
            save_positions: (false, true),
            interventions: InterventionPlan::default(),
            callback: None,
        })
    }

    /// Record only at the given sorted times (plus the endpoint) instead
    /// of at every jump.
    pub fn saveat(mut self, times: Vec<f64>) -> Result<Self, SimError> {
        if times
            .windows(2)
            .any(|w| w[0] > w[1] + TIME_EPSILON)
        {
            return Err(SimError::Configuration(
                "saveat times must be sorted in ascending order".into(),
            ));
        }
        self.saveat = times;
        self.save_positions = (false, false);
        Ok(self)
    }

    pub fn save_positions(mut self, pre: bool, post: bool) -> Self {
        self.save_positions = (pre, post);
        self
    }

    pub fn with_interventions(mut self, plan: InterventionPlan) -> Result<Self, SimError> {
        plan.validate(self.integrator.u.len(), self.aggregator.num_ma_rates())?;
        self.interventions = plan;
        Ok(self)
    }

    pub fn with_callback(mut self, callback: StepCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn apply_intervention_actions(&mut self, idx: usize) -> Result<(), SimError> {
        for action_idx in 0..self.interventions.events[idx].actions.len() {
            match self.interventions.events[idx].actions[action_idx] {
                InterventionAction::SpeciesDelta { species, delta } => {
                    self.integrator.u[species] += delta;
                }
                InterventionAction::SpeciesSet { species, value } => {
                    self.integrator.u[species] = value;
                }
                InterventionAction::RateSet { reaction, value } => {
                    self.aggregator.set_ma_rate(reaction, value)?;
                }
            }
        }
        Ok(())
    }

    pub fn solve(mut self) -> Result<Solution, SimError> {
        let mut sol = Solution::new();
        let t0 = self.integrator.t;
        self.aggregator.initialize(&mut self.integrator)?;

        let mut save_idx = 0usize;
        while save_idx < self.saveat.len() && self.saveat[save_idx] + TIME_EPSILON < t0 {
            save_idx += 1;
        }
        let mut iv_idx = 0usize;
        while iv_idx < self.interventions.events.len()
            && self.interventions.events[iv_idx].time + TIME_EPSILON < t0
        {
            iv_idx += 1;
        }
        if self.saveat.is_empty() {
            sol.save(t0, &self.integrator.u);
        }
        // apply once per distinct scheduled jump: (tstop, jump id)
        let mut last_applied: Option<(f64, u64)> = None;

        loop {
            if !self.integrator.keep_stepping() {
                break;
            }
            let next_iv = self
                .interventions
                .events
                .get(iv_idx)
                .map(|event| event.time)
                .unwrap_or(f64::INFINITY);
            let tstop = self.integrator.tstop;
            let target = tstop.min(next_iv).min(self.t_end);

            // save points strictly below the target hold the current state
            while save_idx < self.saveat.len() && self.saveat[save_idx] < target {
                sol.save(self.saveat[save_idx], &self.integrator.u);
                save_idx += 1;
            }

            self.integrator.tprev = self.integrator.t;
            if self.t_end <= tstop && self.t_end <= next_iv {
                self.integrator.t = self.t_end;
                break;
            }

            if tstop <= next_iv {
                self.integrator.t = tstop;
                let id = self.aggregator.next_jump_id();
                if last_applied != Some((tstop, id)) {
                    if self.save_positions.0 && self.saveat.is_empty() {
                        sol.save(self.integrator.t, &self.integrator.u);
                    }
                    self.aggregator.execute_jumps(&mut self.integrator)?;
                    last_applied = Some((tstop, id));
                    if self.save_positions.1 && self.saveat.is_empty() {
                        sol.save(self.integrator.t, &self.integrator.u);
                    }
                    while save_idx < self.saveat.len()
                        && self.saveat[save_idx] <= self.integrator.t
                    {
                        sol.save(self.saveat[save_idx], &self.integrator.u);
                        save_idx += 1;
                    }
                    self.aggregator.generate_jumps(&mut self.integrator)?;
                } else {
                    self.aggregator.generate_jumps(&mut self.integrator)?;
                    if self.integrator.tstop == tstop && self.aggregator.next_jump_id() == id {
                        return Err(SimError::Configuration(
                            "aggregator republished an already-applied jump without advancing"
                                .into(),
                        ));
                    }
                }
            } else {
                self.integrator.t = next_iv;
                while iv_idx < self.interventions.events.len()
                    && self.interventions.events[iv_idx].time
                        <= self.integrator.t + TIME_EPSILON
                {
                    self.apply_intervention_actions(iv_idx)?;
                    iv_idx += 1;
                }
                self.aggregator.reset(&mut self.integrator)?;
                last_applied = None;
            }

            if let Some(callback) = &mut self.callback {
                callback(&mut self.integrator);
                if self.integrator.u_modified {
                    self.integrator.u_modified = false;
                    self.aggregator.reset(&mut self.integrator)?;
                    last_applied = None;
                }
            }
        }

        // trailing save points hold the final state
        while save_idx < self.saveat.len()
            && self.saveat[save_idx] <= self.t_end + TIME_EPSILON
        {
            sol.save(self.saveat[save_idx], &self.integrator.u);
            save_idx += 1;
        }
        if self.saveat.is_empty()
            && sol
                .t
                .last()
                .map(|&t| (t - self.integrator.t).abs() > TIME_EPSILON)
                .unwrap_or(true)
        {
            sol.save(self.integrator.t, &self.integrator.u);
        }
        sol.retcode = if self.integrator.retcode == Retcode::Default {
            Retcode::Success
        } else {
            self.integrator.retcode
        };
        Ok(sol)
    }
}
