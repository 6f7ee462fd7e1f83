//! Rate primitives and the jump catalog.
//!
//! A system's jumps are statically indexed: mass-action jumps first, then
//! constant-rate jumps (state-dependent rate, constant between firings),
//! then variable-rate jumps (time-varying rate with an upper bound).

use std::str::FromStr;

use meval::{Context, ContextProvider, Expr};

use crate::stepper::SsaIntegrator;
use crate::SimError;

/// Rate closure signature `(state, params, time) -> rate`.
pub type RateFn = Box<dyn Fn(&[i32], &[f64], f64) -> f64 + Send + Sync>;

/// Affect closure: mutates the integrator to reflect one firing.
pub type AffectFn = Box<dyn FnMut(&mut SsaIntegrator) + Send>;

#[inline]
pub(crate) fn falling_factorial(value: i32, count: i32) -> f64 {
    match count {
        0 => 1.0,
        1 => value as f64,
        2 if value >= 2 => (value * (value - 1)) as f64,
        3 if value >= 3 => (value * (value - 1) * (value - 2)) as f64,
        _ if value < count => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count {
                acc *= (value - i) as f64;
            }
            acc
        }
    }
}

/// The mass-action block of a jump catalog.
///
/// Jump `k` consumes `reactant_stoch[k]` (species, order) pairs and applies
/// `net_stoch[k]` (species, delta) pairs when it fires; its propensity is
/// `scaled_rates[k] * prod C(u[s], order)` with `C` the falling factorial.
#[derive(Clone, Debug, Default)]
pub struct MassActionJump {
    scaled_rates: Vec<f64>,
    reactant_stoch: Vec<Vec<(usize, i32)>>,
    net_stoch: Vec<Vec<(usize, i32)>>,
}

impl MassActionJump {
    pub fn new(
        rates: Vec<f64>,
        reactant_stoch: Vec<Vec<(usize, i32)>>,
        net_stoch: Vec<Vec<(usize, i32)>>,
    ) -> Result<Self, SimError> {
        if rates.len() != reactant_stoch.len() || rates.len() != net_stoch.len() {
            return Err(SimError::Shape(format!(
                "mass-action jump count mismatch: {} rates, {} reactant lists, {} net lists",
                rates.len(),
                reactant_stoch.len(),
                net_stoch.len()
            )));
        }
        for (k, stoch) in reactant_stoch.iter().enumerate() {
            if stoch.iter().any(|&(_, order)| order <= 0) {
                return Err(SimError::Shape(format!(
                    "reaction {} has a non-positive reactant order",
                    k
                )));
            }
        }
        for (k, stoch) in net_stoch.iter().enumerate() {
            if stoch.iter().any(|&(_, delta)| delta == 0) {
                return Err(SimError::Shape(format!(
                    "reaction {} has a zero net-stoichiometry entry",
                    k
                )));
            }
        }
        Ok(Self {
            scaled_rates: rates,
            reactant_stoch,
            net_stoch,
        })
    }

    /// As [`MassActionJump::new`], dividing each rate constant by the
    /// product of reactant-order factorials (the scaled convention).
    pub fn new_scaled(
        rates: Vec<f64>,
        reactant_stoch: Vec<Vec<(usize, i32)>>,
        net_stoch: Vec<Vec<(usize, i32)>>,
    ) -> Result<Self, SimError> {
        let mut ma = Self::new(rates, reactant_stoch, net_stoch)?;
        for (rate, stoch) in ma.scaled_rates.iter_mut().zip(ma.reactant_stoch.iter()) {
            for &(_, order) in stoch {
                *rate /= falling_factorial(order, order);
            }
        }
        Ok(ma)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn num_jumps(&self) -> usize {
        self.scaled_rates.len()
    }

    pub fn rate(&self, k: usize) -> f64 {
        self.scaled_rates[k]
    }

    pub fn set_rate(&mut self, k: usize, rate: f64) -> Result<(), SimError> {
        if k >= self.scaled_rates.len() {
            return Err(SimError::Configuration(format!(
                "rate index {} exceeds mass-action jump count {}",
                k,
                self.scaled_rates.len()
            )));
        }
        self.scaled_rates[k] = rate;
        Ok(())
    }

    pub fn reactants(&self, k: usize) -> &[(usize, i32)] {
        &self.reactant_stoch[k]
    }

    pub fn net_stoch(&self, k: usize) -> &[(usize, i32)] {
        &self.net_stoch[k]
    }

    /// Mass-action propensity of jump `k` in state `u`. Zero when any
    /// reactant count is short.
    #[inline]
    pub fn eval_rate(&self, u: &[i32], k: usize) -> f64 {
        let mut propensity = self.scaled_rates[k];
        for &(species, order) in &self.reactant_stoch[k] {
            let available = u[species];
            if available < order {
                return 0.0;
            }
            propensity *= falling_factorial(available, order);
        }
        propensity
    }

    /// Apply the net stoichiometry of jump `k` to `u`.
    #[inline]
    pub fn execute(&self, u: &mut [i32], k: usize) {
        for &(species, delta) in &self.net_stoch[k] {
            u[species] += delta;
        }
    }

    pub(crate) fn max_species_index(&self) -> Option<usize> {
        self.reactant_stoch
            .iter()
            .chain(self.net_stoch.iter())
            .flatten()
            .map(|&(s, _)| s)
            .max()
    }
}

/// A jump whose rate depends on the state but not explicitly on time; the
/// rate is constant between firings of the jumps it depends on.
pub struct ConstantRateJump {
    pub rate: RateFn,
    pub affect: AffectFn,
}

/// A jump with a time-varying rate, simulated by thinning.
///
/// `urate` is a mandatory upper bound on `rate` over the validity window
/// given by `rate_interval` (infinite when absent); `lrate` is an optional
/// lower bound enabling cheap acceptance.
pub struct VariableRateJump {
    pub rate: RateFn,
    pub urate: RateFn,
    pub lrate: Option<RateFn>,
    pub rate_interval: Option<RateFn>,
    pub affect: AffectFn,
}

/// The full jump catalog plus its dependency information.
///
/// Global jump indices run over the mass-action block first, then the
/// constant-rate jumps, then the variable-rate jumps; indices are immutable
/// and key every aggregator table. `rate_reads[j]` / `rate_writes[j]` give
/// the species read by / written by non-mass-action jump `j` (offset past
/// the mass-action block); mass-action read/write sets derive from the
/// stoichiometry.
pub struct JumpSystem {
    pub mass_action: MassActionJump,
    pub constant_jumps: Vec<ConstantRateJump>,
    pub variable_jumps: Vec<VariableRateJump>,
    pub rate_reads: Vec<Vec<usize>>,
    pub rate_writes: Vec<Vec<usize>>,
    /// Explicit jump-to-jump dependency graph; built from the read/write
    /// sets when absent.
    pub dep_graph: Option<Vec<Vec<usize>>>,
}

impl JumpSystem {
    pub fn pure_mass_action(mass_action: MassActionJump) -> Self {
        Self {
            mass_action,
            constant_jumps: Vec::new(),
            variable_jumps: Vec::new(),
            rate_reads: Vec::new(),
            rate_writes: Vec::new(),
            dep_graph: None,
        }
    }

    pub fn num_mass_action(&self) -> usize {
        self.mass_action.num_jumps()
    }

    pub fn num_constant(&self) -> usize {
        self.constant_jumps.len()
    }

    pub fn num_variable(&self) -> usize {
        self.variable_jumps.len()
    }

    pub fn num_jumps(&self) -> usize {
        self.num_mass_action() + self.num_constant() + self.num_variable()
    }

    pub fn is_variable(&self, k: usize) -> bool {
        k >= self.num_mass_action() + self.num_constant()
    }

    pub(crate) fn variable_index(&self, k: usize) -> usize {
        k - self.num_mass_action() - self.num_constant()
    }

    /// Exact rate of jump `k` in state `u` at time `t`.
    pub fn eval_rate(&self, u: &[i32], p: &[f64], t: f64, k: usize) -> Result<f64, SimError> {
        let m = self.num_mass_action();
        let rate = if k < m {
            self.mass_action.eval_rate(u, k)
        } else if k < m + self.constant_jumps.len() {
            (self.constant_jumps[k - m].rate)(u, p, t)
        } else {
            (self.variable_jumps[self.variable_index(k)].rate)(u, p, t)
        };
        if rate.is_nan() {
            return Err(SimError::Domain(format!(
                "jump {} rate evaluated to NaN at t = {}",
                k, t
            )));
        }
        if rate < 0.0 {
            return Err(SimError::Domain(format!(
                "jump {} rate evaluated to {} < 0 at t = {}",
                k, rate, t
            )));
        }
        Ok(rate)
    }

    /// Apply the affect of jump `k`.
    pub fn execute(&mut self, integrator: &mut SsaIntegrator, k: usize) {
        let m = self.num_mass_action();
        if k < m {
            self.mass_action.execute(&mut integrator.u, k);
        } else if k < m + self.constant_jumps.len() {
            (self.constant_jumps[k - m].affect)(integrator);
        } else {
            let idx = self.variable_index(k);
            (self.variable_jumps[idx].affect)(integrator);
        }
    }

    /// Collect the species written by jump `k` into `out`.
    pub(crate) fn write_species_into(&self, k: usize, out: &mut Vec<usize>) {
        out.clear();
        let m = self.num_mass_action();
        if k < m {
            out.extend(self.mass_action.net_stoch(k).iter().map(|&(s, _)| s));
        } else {
            out.extend_from_slice(&self.rate_writes[k - m]);
        }
    }

    /// Structural validation against a species count. Non-mass-action
    /// jumps without read/write sets cannot be scheduled correctly, so
    /// their absence is a configuration error.
    pub fn validate(&self, n_species: usize) -> Result<(), SimError> {
        if let Some(max) = self.mass_action.max_species_index() {
            if max >= n_species {
                return Err(SimError::Shape(format!(
                    "stoichiometry references species {} but the state has {} species",
                    max, n_species
                )));
            }
        }
        let n_general = self.num_constant() + self.num_variable();
        if self.dep_graph.is_none()
            && (self.rate_reads.len() != n_general || self.rate_writes.len() != n_general)
        {
            return Err(SimError::Configuration(format!(
                "no dependency information: {} non-mass-action jumps but {} read sets and {} write sets",
                n_general,
                self.rate_reads.len(),
                self.rate_writes.len()
            )));
        }
        for set in self.rate_reads.iter().chain(self.rate_writes.iter()) {
            if set.iter().any(|&s| s >= n_species) {
                return Err(SimError::Shape(format!(
                    "jump dependency set references a species >= {}",
                    n_species
                )));
            }
        }
        Ok(())
    }
}

struct SpeciesContext<'a> {
    state: &'a [i32],
}

impl<'a> ContextProvider for SpeciesContext<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        parse_species_variable(name).map(|idx| self.state[idx].max(0) as f64)
    }
}

fn parse_species_variable(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('s').or_else(|| name.strip_prefix('S'))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok()
}

fn collect_species_refs(expr_str: &str, n_species: usize) -> Result<Vec<usize>, SimError> {
    let mut refs = Vec::new();
    let bytes = expr_str.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        let ch = bytes[idx];
        if ch == b's' || ch == b'S' {
            let mut end = idx + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > idx + 1 {
                let digits = &expr_str[idx + 1..end];
                let species_idx = digits.parse::<usize>().map_err(|_| {
                    SimError::Domain(format!(
                        "rate expression contains invalid species index '{}'",
                        digits
                    ))
                })?;
                if species_idx >= n_species {
                    return Err(SimError::Shape(format!(
                        "rate expression species index {} exceeds number of species {}",
                        species_idx, n_species
                    )));
                }
                if !refs.contains(&species_idx) {
                    refs.push(species_idx);
                }
                idx = end;
                continue;
            }
        }
        idx += 1;
    }
    Ok(refs)
}

/// A rate law compiled from a textual expression over species variables
/// `s0, s1, …` (case-insensitive).
#[derive(Debug)]
pub struct ExpressionRate {
    expr: Expr,
    species_refs: Vec<usize>,
}

impl ExpressionRate {
    pub fn parse(expr_str: &str, n_species: usize) -> Result<Self, SimError> {
        let expr = Expr::from_str(expr_str)
            .map_err(|err| SimError::Domain(format!("rate expression parse error: {}", err)))?;
        let species_refs = collect_species_refs(expr_str, n_species)?;
        Ok(Self { expr, species_refs })
    }

    /// Species the expression reads; feeds the dependency graph.
    pub fn species_refs(&self) -> &[usize] {
        &self.species_refs
    }

    pub fn into_rate_fn(self) -> RateFn {
        let expr = self.expr;
        Box::new(move |u, _p, _t| {
            let ctx = (SpeciesContext { state: u }, Context::new());
            expr.eval_with_context(ctx).unwrap_or(0.0)
        })
    }
}

/// Hill kinetics `vmax * u[a]^n / (k_half^n + u[a]^n)`.
pub fn hill_rate(activator: usize, vmax: f64, hill_n: f64, k_half: f64) -> RateFn {
    let k_half_pow_n = k_half.powf(hill_n);
    Box::new(move |u, _p, _t| {
        let concentration = u[activator].max(0) as f64;
        let power = concentration.powf(hill_n);
        let denom = k_half_pow_n + power;
        if denom == 0.0 {
            0.0
        } else {
            vmax * power / denom
        }
    })
}

/// Michaelis-Menten kinetics `vmax * u[s] / (k_m + u[s])`.
pub fn michaelis_menten_rate(substrate: usize, vmax: f64, k_m: f64) -> RateFn {
    Box::new(move |u, _p, _t| {
        let count = u[substrate].max(0) as f64;
        let denom = k_m + count;
        if denom == 0.0 {
            0.0
        } else {
            vmax * count / denom
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falling_factorial_basics() {
        assert_eq!(falling_factorial(5, 0), 1.0);
        assert_eq!(falling_factorial(5, 2), 20.0);
        assert_eq!(falling_factorial(3, 4), 0.0);
    }

    #[test]
    fn mass_action_propensity_uses_falling_factorials() {
        let ma = MassActionJump::new(
            vec![2.0],
            vec![vec![(0, 2), (1, 1)]],
            vec![vec![(0, -2), (1, -1), (2, 1)]],
        )
        .unwrap();
        let u = [5, 3, 0];
        assert!((ma.eval_rate(&u, 0) - 2.0 * 20.0 * 3.0).abs() < 1e-12);
        let short = [1, 3, 0];
        assert_eq!(ma.eval_rate(&short, 0), 0.0);
    }

    #[test]
    fn mass_action_execute_applies_net_stoch() {
        let ma =
            MassActionJump::new(vec![1.0], vec![vec![(0, 1)]], vec![vec![(0, -1), (1, 1)]])
                .unwrap();
        let mut u = [4, 0];
        ma.execute(&mut u, 0);
        assert_eq!(u, [3, 1]);
    }

    #[test]
    fn scaled_rates_divide_by_order_factorials() {
        let ma = MassActionJump::new_scaled(
            vec![6.0],
            vec![vec![(0, 3)]],
            vec![vec![(0, -3)]],
        )
        .unwrap();
        assert!((ma.rate(0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn michaelis_menten_rate_behaves() {
        let rate = michaelis_menten_rate(0, 8.0, 4.0);
        let u = [6];
        assert!((rate(&u, &[], 0.0) - 8.0 * 6.0 / (4.0 + 6.0)).abs() < 1e-12);
    }

    #[test]
    fn hill_rate_behaves() {
        // vmax * [A]^n / (K^n + [A]^n) = 10 * 16 / (9 + 16) = 6.4
        let rate = hill_rate(0, 10.0, 2.0, 3.0);
        let u = [4];
        assert!((rate(&u, &[], 0.0) - 6.4).abs() < 1e-12);
    }

    #[test]
    fn expression_rate_evaluates() {
        let expr = ExpressionRate::parse("2.0 * s0 + s1", 2).unwrap();
        assert_eq!(expr.species_refs(), &[0, 1]);
        let rate = expr.into_rate_fn();
        let u = [3, 5];
        assert!((rate(&u, &[], 0.0) - 11.0).abs() < 1e-12);
    }

    #[test]
    fn expression_refs_deduplicate_and_ignore_case() {
        let expr = ExpressionRate::parse("2*s0 + 3*S0 + s2", 3).unwrap();
        assert_eq!(expr.species_refs(), &[0, 2]);
    }

    #[test]
    fn expression_rejects_out_of_range_species() {
        let err = ExpressionRate::parse("s5 + 1", 2).unwrap_err();
        assert!(matches!(err, SimError::Shape(msg) if msg.contains("exceeds")));
    }

    #[test]
    fn validate_rejects_missing_dependency_sets() {
        let sys = JumpSystem {
            mass_action: MassActionJump::empty(),
            constant_jumps: vec![ConstantRateJump {
                rate: Box::new(|_, _, _| 1.0),
                affect: Box::new(|_| {}),
            }],
            variable_jumps: Vec::new(),
            rate_reads: Vec::new(),
            rate_writes: Vec::new(),
            dep_graph: None,
        };
        assert!(matches!(
            sys.validate(1),
            Err(SimError::Configuration(_))
        ));
    }
}
