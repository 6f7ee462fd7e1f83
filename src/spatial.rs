//! Spatial jump processes on a lattice: reactions within sites, hops
//! between neighbouring sites.
//!
//! State is site-major: `u[site * num_species + species]`. The aggregator
//! samples in two levels — the site from a grouped priority table over
//! bracketed site-rate envelopes (with rejection against the exact site
//! rate), then the jump at that site by Direct sampling over the cached
//! per-site upper bounds, which is cheap because it is local.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::brackets::{BracketData, SpeciesBrackets};
use crate::priority_table::PriorityTable;
use crate::rates::MassActionJump;
use crate::stepper::{register_next_jump_time, SsaIntegrator};
use crate::{randexp, SimError};

/// D-dimensional rectangular lattice with nearest-neighbour adjacency.
#[derive(Clone, Debug)]
pub struct CartesianGrid {
    dims: Vec<usize>,
    neighbors: Vec<Vec<usize>>,
}

impl CartesianGrid {
    pub fn new(dims: &[usize]) -> Result<Self, SimError> {
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(SimError::Configuration(format!(
                "lattice dimensions must be non-empty and positive, got {:?}",
                dims
            )));
        }
        let num_sites: usize = dims.iter().product();
        let mut neighbors = vec![Vec::new(); num_sites];
        let mut strides = vec![1usize; dims.len()];
        for axis in 1..dims.len() {
            strides[axis] = strides[axis - 1] * dims[axis - 1];
        }
        for site in 0..num_sites {
            for (axis, &extent) in dims.iter().enumerate() {
                let coord = (site / strides[axis]) % extent;
                if coord > 0 {
                    neighbors[site].push(site - strides[axis]);
                }
                if coord + 1 < extent {
                    neighbors[site].push(site + strides[axis]);
                }
            }
        }
        Ok(Self {
            dims: dims.to_vec(),
            neighbors,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_sites(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self, site: usize) -> &[usize] {
        &self.neighbors[site]
    }

    pub fn degree(&self, site: usize) -> usize {
        self.neighbors[site].len()
    }
}

/// Reactions replicated at every site plus per-species hopping constants.
///
/// The hop propensity of species `s` out of site `i` is
/// `hopping[s] * u[i, s] * degree(i)`, destination uniform over the
/// neighbours of `i`.
pub struct SpatialSystem {
    pub reactions: MassActionJump,
    pub hopping: Vec<f64>,
    pub grid: CartesianGrid,
    pub num_species: usize,
}

impl SpatialSystem {
    pub fn new(
        reactions: MassActionJump,
        hopping: Vec<f64>,
        grid: CartesianGrid,
        num_species: usize,
    ) -> Result<Self, SimError> {
        if hopping.len() != num_species {
            return Err(SimError::Shape(format!(
                "{} hopping constants for {} species",
                hopping.len(),
                num_species
            )));
        }
        if hopping.iter().any(|&h| h.is_nan() || h < 0.0) {
            return Err(SimError::Domain(
                "hopping constants must be non-negative".into(),
            ));
        }
        if let Some(max) = reactions.max_species_index() {
            if max >= num_species {
                return Err(SimError::Shape(format!(
                    "reaction stoichiometry references species {} but sites carry {}",
                    max, num_species
                )));
            }
        }
        Ok(Self {
            reactions,
            hopping,
            grid,
            num_species,
        })
    }

    pub fn num_sites(&self) -> usize {
        self.grid.num_sites()
    }

    pub fn state_len(&self) -> usize {
        self.num_sites() * self.num_species
    }

    #[inline]
    fn site_range(&self, site: usize) -> std::ops::Range<usize> {
        site * self.num_species..(site + 1) * self.num_species
    }
}

/// One spatial jump: a reaction at a site, or a hop of one individual of
/// `species` from `site` to the neighbouring `dst`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpatialJump {
    Reaction { site: usize, rx: usize },
    Hop { site: usize, species: usize, dst: usize },
}

impl std::fmt::Debug for RssaCrDirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RssaCrDirect").finish_non_exhaustive()
    }
}

pub struct RssaCrDirect {
    sys: SpatialSystem,
    bracket_data: BracketData,
    brackets: SpeciesBrackets,
    rx_low: Vec<f64>,
    rx_high: Vec<f64>,
    hop_low: Vec<f64>,
    hop_high: Vec<f64>,
    site_low: Vec<f64>,
    site_high: Vec<f64>,
    pt: PriorityTable,
    /// species -> reactions whose rate reads it
    vartojumps: Vec<Vec<usize>>,
    scratch: Vec<usize>,
    pub(crate) next_jump: Option<SpatialJump>,
    pub(crate) next_jump_time: f64,
    end_time: f64,
    rng: ChaCha8Rng,
}

impl RssaCrDirect {
    pub fn new(
        sys: SpatialSystem,
        u0: &[i32],
        bracket_data: BracketData,
        end_time: f64,
        seed: u64,
    ) -> Result<Self, SimError> {
        if u0.len() != sys.state_len() {
            return Err(SimError::Shape(format!(
                "state length {} does not match {} sites x {} species",
                u0.len(),
                sys.num_sites(),
                sys.num_species
            )));
        }
        let num_sites = sys.num_sites();
        let num_rx = sys.reactions.num_jumps();
        let ns = sys.num_species;
        let mut vartojumps = vec![Vec::new(); ns];
        for k in 0..num_rx {
            for &(species, _) in sys.reactions.reactants(k) {
                if !vartojumps[species].contains(&k) {
                    vartojumps[species].push(k);
                }
            }
        }
        let mut agg = Self {
            brackets: SpeciesBrackets::new(bracket_data, u0),
            bracket_data,
            rx_low: vec![0.0; num_sites * num_rx],
            rx_high: vec![0.0; num_sites * num_rx],
            hop_low: vec![0.0; num_sites * ns],
            hop_high: vec![0.0; num_sites * ns],
            site_low: vec![0.0; num_sites],
            site_high: vec![0.0; num_sites],
            pt: PriorityTable::new(1.0, 2.0, &[])?,
            vartojumps,
            scratch: Vec::new(),
            next_jump: None,
            next_jump_time: f64::INFINITY,
            end_time,
            rng: ChaCha8Rng::seed_from_u64(seed),
            sys,
        };
        agg.rebuild_tables()?;
        Ok(agg)
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn next_jump_time(&self) -> f64 {
        self.next_jump_time
    }

    pub fn next_jump(&self) -> Option<SpatialJump> {
        self.next_jump
    }

    pub(crate) fn num_ma_rates(&self) -> usize {
        self.sys.reactions.num_jumps()
    }

    pub(crate) fn set_ma_rate(&mut self, k: usize, rate: f64) -> Result<(), SimError> {
        self.sys.reactions.set_rate(k, rate)
    }

    #[cfg(test)]
    pub(crate) fn brackets(&self) -> &SpeciesBrackets {
        &self.brackets
    }

    #[cfg(test)]
    pub(crate) fn site_envelope(&self, site: usize) -> (f64, f64) {
        (self.site_low[site], self.site_high[site])
    }

    fn rebuild_tables(&mut self) -> Result<(), SimError> {
        let num_rx = self.sys.reactions.num_jumps();
        let ns = self.sys.num_species;
        for site in 0..self.sys.num_sites() {
            let range = self.sys.site_range(site);
            let ulow = &self.brackets.ulow[range.clone()];
            let uhigh = &self.brackets.uhigh[range];
            for k in 0..num_rx {
                self.rx_low[site * num_rx + k] = self.sys.reactions.eval_rate(ulow, k);
                self.rx_high[site * num_rx + k] = self.sys.reactions.eval_rate(uhigh, k);
            }
            let degree = self.sys.grid.degree(site) as f64;
            for s in 0..ns {
                let scale = self.sys.hopping[s] * degree;
                self.hop_low[site * ns + s] = scale * ulow[s].max(0) as f64;
                self.hop_high[site * ns + s] = scale * uhigh[s] as f64;
            }
            self.refresh_site_sums(site);
        }
        self.pt = build_site_table(&self.site_high)?;
        Ok(())
    }

    fn refresh_site_sums(&mut self, site: usize) {
        let num_rx = self.sys.reactions.num_jumps();
        let ns = self.sys.num_species;
        let mut low = 0.0;
        let mut high = 0.0;
        for k in 0..num_rx {
            low += self.rx_low[site * num_rx + k];
            high += self.rx_high[site * num_rx + k];
        }
        for s in 0..ns {
            low += self.hop_low[site * ns + s];
            high += self.hop_high[site * ns + s];
        }
        self.site_low[site] = low;
        self.site_high[site] = high;
    }

    /// Exact total propensity of `site` in the true state `u`.
    fn exact_site_rate(&self, u: &[i32], site: usize) -> f64 {
        let slice = &u[self.sys.site_range(site)];
        let mut total = 0.0;
        for k in 0..self.sys.reactions.num_jumps() {
            total += self.sys.reactions.eval_rate(slice, k);
        }
        let degree = self.sys.grid.degree(site) as f64;
        for (s, &h) in self.sys.hopping.iter().enumerate() {
            total += h * degree * slice[s].max(0) as f64;
        }
        total
    }

    pub(crate) fn initialize(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        self.brackets = SpeciesBrackets::new(self.bracket_data, &integrator.u);
        self.rebuild_tables()?;
        self.generate_jumps(integrator)
    }

    pub(crate) fn execute_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        let Some(jump) = self.next_jump else {
            return Err(SimError::Configuration(
                "execute_jumps called with no scheduled spatial jump".into(),
            ));
        };
        match jump {
            SpatialJump::Reaction { site, rx } => {
                let range = self.sys.site_range(site);
                self.sys.reactions.execute(&mut integrator.u[range], rx);
                let mut touched = std::mem::take(&mut self.scratch);
                touched.clear();
                touched.extend(self.sys.reactions.net_stoch(rx).iter().map(|&(s, _)| s));
                self.repair_site(integrator, site, &touched)?;
                self.scratch = touched;
            }
            SpatialJump::Hop { site, species, dst } => {
                let ns = self.sys.num_species;
                integrator.u[site * ns + species] -= 1;
                integrator.u[dst * ns + species] += 1;
                self.repair_site(integrator, site, &[species])?;
                self.repair_site(integrator, dst, &[species])?;
            }
        }
        Ok(())
    }

    /// Re-bracket species `s` at `site` and refresh every local cache its
    /// count feeds.
    fn recompute_species_caches(&mut self, u: &[i32], site: usize, s: usize) {
        let num_rx = self.sys.reactions.num_jumps();
        let ns = self.sys.num_species;
        let q = site * ns + s;
        self.brackets.refresh_species(q, u[q]);
        let range = self.sys.site_range(site);
        for idx in 0..self.vartojumps[s].len() {
            let k = self.vartojumps[s][idx];
            let ulow = &self.brackets.ulow[range.clone()];
            let uhigh = &self.brackets.uhigh[range.clone()];
            self.rx_low[site * num_rx + k] = self.sys.reactions.eval_rate(ulow, k);
            self.rx_high[site * num_rx + k] = self.sys.reactions.eval_rate(uhigh, k);
        }
        let scale = self.sys.hopping[s] * self.sys.grid.degree(site) as f64;
        self.hop_low[site * ns + s] = scale * self.brackets.ulow[q].max(0) as f64;
        self.hop_high[site * ns + s] = scale * self.brackets.uhigh[q] as f64;
    }

    fn update_site_entry(&mut self, site: usize) -> Result<(), SimError> {
        let old = self.site_high[site];
        self.refresh_site_sums(site);
        self.pt.update(site, old, self.site_high[site])
    }

    /// Re-bracket the given species at `site` where the state escaped, and
    /// refresh the affected rate caches and the site's table entry.
    fn repair_site(
        &mut self,
        integrator: &SsaIntegrator,
        site: usize,
        species: &[usize],
    ) -> Result<(), SimError> {
        let ns = self.sys.num_species;
        let mut changed = false;
        for &s in species {
            let q = site * ns + s;
            let n = integrator.u[q];
            if !self.brackets.is_outside(q, n) {
                continue;
            }
            trace!(site, species = s, count = n, "site species left its bracket");
            self.recompute_species_caches(&integrator.u, site, s);
            changed = true;
        }
        if changed {
            self.update_site_entry(site)?;
        }
        Ok(())
    }

    pub(crate) fn generate_jumps(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        let t = integrator.t;
        let mut ttnj = 0.0;
        loop {
            let gsum = self.pt.gsum();
            if gsum <= 0.0 {
                self.next_jump = None;
                self.next_jump_time = f64::INFINITY;
                break;
            }
            ttnj += randexp(&mut self.rng) / gsum;
            if t + ttnj > self.end_time {
                self.next_jump = None;
                self.next_jump_time = f64::INFINITY;
                break;
            }
            let Some(site) = self.pt.sample(&mut self.rng) else {
                self.next_jump = None;
                self.next_jump_time = f64::INFINITY;
                break;
            };
            let v = self.rng.gen::<f64>() * self.site_high[site];
            let accepted = if v <= self.site_low[site] {
                true
            } else {
                v <= self.exact_site_rate(&integrator.u, site)
            };
            if accepted {
                match self.select_at_site(&integrator.u, site)? {
                    Some(jump) => {
                        self.next_jump = Some(jump);
                        self.next_jump_time = t + ttnj;
                        break;
                    }
                    // stale cache repaired; resample the site
                    None => continue,
                }
            }
        }
        register_next_jump_time(integrator, self.next_jump_time);
        Ok(())
    }

    /// Direct selection over the site's cached upper bounds.
    ///
    /// A candidate whose exact rate is zero means its cache went stale
    /// inside a still-valid bracket (possible because selection works on
    /// the upper bounds); the cache is recomputed and `None` asks the
    /// caller to resample.
    fn select_at_site(
        &mut self,
        u: &[i32],
        site: usize,
    ) -> Result<Option<SpatialJump>, SimError> {
        let num_rx = self.sys.reactions.num_jumps();
        let ns = self.sys.num_species;
        let w = self.rng.gen::<f64>() * self.site_high[site];
        let mut acc = 0.0;
        let mut candidate = None;
        for k in 0..num_rx {
            let r = self.rx_high[site * num_rx + k];
            if r > 0.0 {
                acc += r;
                candidate = Some(SpatialJump::Reaction { site, rx: k });
                if w < acc {
                    break;
                }
            }
        }
        if acc <= w || candidate.is_none() {
            for s in 0..ns {
                let r = self.hop_high[site * ns + s];
                if r > 0.0 {
                    acc += r;
                    let nbs = self.sys.grid.neighbors(site);
                    let dst = nbs[self.rng.gen_range(0..nbs.len())];
                    candidate = Some(SpatialJump::Hop { site, species: s, dst });
                    if w < acc {
                        break;
                    }
                }
            }
        }
        // floating-point leftovers land on the last positive candidate
        let Some(jump) = candidate else {
            return Err(SimError::Configuration(format!(
                "site {} was sampled with no positive local rate",
                site
            )));
        };
        match jump {
            SpatialJump::Reaction { rx, .. } => {
                let slice = &u[self.sys.site_range(site)];
                if self.sys.reactions.eval_rate(slice, rx) <= 0.0 {
                    trace!(site, rx, "stale reaction cache selected, recomputing");
                    let mut touched = std::mem::take(&mut self.scratch);
                    touched.clear();
                    touched.extend(self.sys.reactions.reactants(rx).iter().map(|&(s, _)| s));
                    for idx in 0..touched.len() {
                        self.recompute_species_caches(u, site, touched[idx]);
                    }
                    self.scratch = touched;
                    self.update_site_entry(site)?;
                    return Ok(None);
                }
            }
            SpatialJump::Hop { species, .. } => {
                if u[site * ns + species] <= 0 {
                    trace!(site, species, "stale hop cache selected, recomputing");
                    self.recompute_species_caches(u, site, species);
                    self.update_site_entry(site)?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(jump))
    }

    pub(crate) fn reset(&mut self, integrator: &mut SsaIntegrator) -> Result<(), SimError> {
        self.initialize(integrator)
    }
}

fn build_site_table(site_high: &[f64]) -> Result<PriorityTable, SimError> {
    let mut minp = f64::INFINITY;
    let mut maxp = 0.0f64;
    for &r in site_high {
        if r > 0.0 {
            minp = minp.min(r);
            maxp = maxp.max(r);
        }
    }
    if !minp.is_finite() {
        minp = 1.0;
        maxp = 1.0;
    }
    PriorityTable::new(minp, 2.0 * maxp, site_high)
}
