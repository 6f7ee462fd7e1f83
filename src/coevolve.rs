//! Thinning aggregator for jumps with time-varying rates.
//!
//! Every jump keeps a candidate fire time in an indexed min-heap. For
//! variable-rate jumps the candidate is drawn from the upper-bound process
//! and accepted by thinning against the exact rate; constant-rate and
//! mass-action jumps skip thinning, since their rates hold until another
//! jump fires. After a firing only the jumps in the fired jump's
//! dependency set are rescheduled, with surviving waits rescaled under
//! their new bounds rather than redrawn.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::depgraph::build_dep_graph;
use crate::rates::JumpSystem;
use crate::stepper::{register_next_jump_time, SsaIntegrator};
use crate::{randexp, SimError};

/// Binary min-heap over jump candidate times, keyed by jump index with a
/// position arena so any entry can be re-keyed in place.
struct TimeHeap {
    heap: Vec<usize>,
    pos: Vec<usize>,
    times: Vec<f64>,
}

impl TimeHeap {
    fn new(times: Vec<f64>) -> Self {
        let n = times.len();
        let mut heap = Self {
            heap: (0..n).collect(),
            pos: (0..n).collect(),
            times,
        };
        if n > 1 {
            for i in (0..n / 2).rev() {
                heap.sift_down(i);
            }
        }
        heap
    }

    #[inline]
    fn time(&self, id: usize) -> f64 {
        self.times[id]
    }

    fn top(&self) -> Option<(usize, f64)> {
        self.heap.first().map(|&id| (id, self.times[id]))
    }

    fn update(&mut self, id: usize, t: f64) {
        let old = self.times[id];
        self.times[id] = t;
        let i = self.pos[id];
        if t < old {
            self.sift_up(i);
        } else {
            self.sift_down(i);
        }
    }

    #[inline]
    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos[self.heap[a]] = a;
        self.pos[self.heap[b]] = b;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.times[self.heap[i]] < self.times[self.heap[parent]] {
                self.swap_nodes(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < n && self.times[self.heap[right]] < self.times[self.heap[left]] {
                smallest = right;
            }
            if self.times[self.heap[smallest]] < self.times[self.heap[i]] {
                self.swap_nodes(i, smallest);
                i = smallest;
            } else {
                break;
            }
        }
    }
}

pub struct Coevolve {
    sys: JumpSystem,
    dep_graph: Vec<Vec<usize>>,
    pq: TimeHeap,
    /// Upper bound in effect for each jump's scheduled candidate time.
    cur_rates: Vec<f64>,
    prev_jump: Option<usize>,
    pub(crate) next_jump: usize,
    pub(crate) next_jump_time: f64,
    end_time: f64,
    rng: ChaCha8Rng,
}

impl Coevolve {
    pub fn new(
        sys: JumpSystem,
        n_species: usize,
        end_time: f64,
        seed: u64,
    ) -> Result<Self, SimError> {
        sys.validate(n_species)?;
        let dep_graph = build_dep_graph(n_species, &sys)?;
        let n = sys.num_jumps();
        Ok(Self {
            sys,
            dep_graph,
            pq: TimeHeap::new(vec![f64::INFINITY; n]),
            cur_rates: vec![0.0; n],
            prev_jump: None,
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

    pub(crate) fn initialize(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        self.prev_jump = None;
        self.cur_rates.fill(0.0);
        for k in 0..self.sys.num_jumps() {
            self.pq.update(k, f64::INFINITY);
        }
        for k in 0..self.sys.num_jumps() {
            let (t, urate) = self.next_time(&integrator.u, &integrator.p, integrator.t, k)?;
            self.pq.update(k, t);
            self.cur_rates[k] = urate;
        }
        self.generate_jumps(integrator)
    }

    pub(crate) fn execute_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        let k = self.next_jump;
        self.sys.execute(integrator, k);
        self.prev_jump = Some(k);
        for idx in 0..self.dep_graph[k].len() {
            let j = self.dep_graph[k][idx];
            let (t, urate) = self.next_time(&integrator.u, &integrator.p, integrator.t, j)?;
            self.pq.update(j, t);
            self.cur_rates[j] = urate;
        }
        Ok(())
    }

    pub(crate) fn generate_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        if let Some((id, t)) = self.pq.top() {
            self.next_jump = id;
            self.next_jump_time = t;
        } else {
            self.next_jump_time = f64::INFINITY;
        }
        register_next_jump_time(integrator, self.next_jump_time);
        Ok(())
    }

    pub(crate) fn reset(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        self.initialize(integrator)
    }

    /// Candidate fire time for jump `k` from time `t`, and the upper bound
    /// used to draw it.
    ///
    /// For bounded variable-rate jumps this is the thinning loop: draw
    /// against the bound, advance through rate-interval windows the draw
    /// overshoots, accept cheaply below `lrate`, exactly below `rate`,
    /// else shift and redraw. Jumps whose wait survived a dependency
    /// update are rescaled (`cur_rates[k]/urate` of the remaining wait)
    /// instead of redrawn, preserving their quantile under the new bound.
    fn next_time(
        &mut self,
        u: &[i32],
        p: &[f64],
        t: f64,
        k: usize,
    ) -> Result<(f64, f64), SimError> {
        if !self.sys.is_variable(k) {
            let rate = self.sys.eval_rate(u, p, t, k)?;
            if rate <= 0.0 {
                return Ok((f64::INFINITY, 0.0));
            }
            let scheduled = self.pq.time(k);
            // a wait that survived a dependency update is rescaled to its
            // quantile under the new rate instead of redrawn
            let s = if self.prev_jump != Some(k)
                && self.cur_rates[k] > 0.0
                && scheduled.is_finite()
                && scheduled > t
            {
                self.cur_rates[k] / rate * (scheduled - t)
            } else {
                randexp(&mut self.rng) / rate
            };
            return Ok((t + s, rate));
        }

        let vidx = self.sys.variable_index(k);
        let mut now = t;
        let vj = &self.sys.variable_jumps[vidx];
        let mut urate = (vj.urate)(u, p, now);
        check_bound(urate, k, now)?;
        let scheduled = self.pq.time(k);
        let mut s = if self.prev_jump != Some(k)
            && self.cur_rates[k] > 0.0
            && urate > 0.0
            && scheduled.is_finite()
            && scheduled > now
        {
            self.cur_rates[k] / urate * (scheduled - now)
        } else if urate > 0.0 {
            randexp(&mut self.rng) / urate
        } else {
            f64::INFINITY
        };

        loop {
            let vj = &self.sys.variable_jumps[vidx];
            // advance through validity windows the draw overshoots
            if let Some(interval) = &vj.rate_interval {
                let mut window = interval(u, p, now);
                while s > window || !s.is_finite() {
                    if window.is_nan() || window <= 0.0 {
                        return Err(SimError::Domain(format!(
                            "jump {} rate interval evaluated to {} at t = {}",
                            k, window, now
                        )));
                    }
                    if !window.is_finite() {
                        // bound valid forever and the draw is infinite
                        return Ok((f64::INFINITY, urate));
                    }
                    now += window;
                    if now >= self.end_time {
                        return Ok((f64::INFINITY, urate));
                    }
                    urate = (vj.urate)(u, p, now);
                    check_bound(urate, k, now)?;
                    s = if urate > 0.0 {
                        randexp(&mut self.rng) / urate
                    } else {
                        f64::INFINITY
                    };
                    window = interval(u, p, now);
                }
            } else if !s.is_finite() {
                // zero bound, valid forever
                return Ok((f64::INFINITY, urate));
            }

            let candidate = now + s;
            if candidate >= self.end_time {
                // past the horizon: accept without thinning, the stepper
                // never reaches it
                return Ok((candidate, urate));
            }
            let v = self.rng.gen::<f64>() * urate;
            if let Some(lrate) = &vj.lrate {
                let lower = lrate(u, p, candidate);
                if lower > urate {
                    return Err(SimError::RateBound(format!(
                        "jump {} has lrate {} > urate {} at t = {}",
                        k, lower, urate, candidate
                    )));
                }
                if v <= lower {
                    return Ok((candidate, urate));
                }
            }
            let rate = self.sys.eval_rate(u, p, candidate, k)?;
            if v <= rate {
                return Ok((candidate, urate));
            }
            now = candidate;
            let vj = &self.sys.variable_jumps[vidx];
            urate = (vj.urate)(u, p, now);
            check_bound(urate, k, now)?;
            s = if urate > 0.0 {
                randexp(&mut self.rng) / urate
            } else {
                f64::INFINITY
            };
        }
    }

    #[cfg(test)]
    pub(crate) fn scheduled_time(&self, k: usize) -> f64 {
        self.pq.time(k)
    }

    #[cfg(test)]
    pub(crate) fn current_bound(&self, k: usize) -> f64 {
        self.cur_rates[k]
    }
}

#[inline]
fn check_bound(urate: f64, k: usize, t: f64) -> Result<(), SimError> {
    if urate.is_nan() || urate < 0.0 {
        return Err(SimError::Domain(format!(
            "jump {} rate bound evaluated to {} at t = {}",
            k, urate, t
        )));
    }
    Ok(())
}
