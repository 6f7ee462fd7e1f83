//! Two-level grouped priority table.
//!
//! Priorities are binned into octave groups by binary exponent, so a table
//! over `N` rates spanning a wide dynamic range has only `O(log(max/min))`
//! groups. Sampling picks a group by weight, then rejection-samples inside
//! the group against its power-of-two ceiling; since every in-group
//! priority is at least half the ceiling, the expected number of
//! rejections is `O(1)` regardless of `N`. Updates move a priority between
//! groups with a swap-remove, keeping both directions of the group/pid
//! mapping as plain indices.

use rand::Rng;
use tracing::debug;

use crate::SimError;

/// Binary exponent of a positive float (`floor(log2 x)`).
#[inline]
fn exponent(x: f64) -> i32 {
    let biased = ((x.to_bits() >> 52) & 0x7ff) as i32;
    if biased == 0 {
        // subnormal
        x.log2().floor() as i32
    } else {
        biased - 1023
    }
}

/// Grouped-log priority table.
///
/// Group 0 is reserved for zero priorities; group 1 holds everything in
/// `(0, 2^(minexp+1))` (priorities below `2^minexp` clamp into it at the
/// cost of a lower in-group acceptance rate); group `g > 1` holds the
/// octave `[2^(minexp+g-1), 2^(minexp+g))`.
#[derive(Debug)]
pub struct PriorityTable {
    minexp: i32,
    groups: Vec<Vec<usize>>,
    gsums: Vec<f64>,
    gsum: f64,
    priorities: Vec<f64>,
    pidtogroup: Vec<(usize, usize)>,
}

impl PriorityTable {
    /// Build a table sized for priorities in `[minpriority, maxpriority)`
    /// and insert `priorities` under pids `0..len`. The group range
    /// extends automatically if later inserts fall outside it.
    pub fn new(
        minpriority: f64,
        maxpriority: f64,
        priorities: &[f64],
    ) -> Result<Self, SimError> {
        if !(minpriority > 0.0) || !maxpriority.is_finite() || maxpriority <= minpriority {
            return Err(SimError::Configuration(format!(
                "priority table needs 0 < minpriority < maxpriority, got [{}, {})",
                minpriority, maxpriority
            )));
        }
        let minexp = exponent(minpriority);
        let ngroups = (exponent(maxpriority) - minexp).max(0) as usize + 1;
        let mut table = Self {
            minexp,
            groups: vec![Vec::new(); ngroups],
            gsums: vec![0.0; ngroups],
            gsum: 0.0,
            priorities: Vec::new(),
            pidtogroup: Vec::new(),
        };
        for (pid, &priority) in priorities.iter().enumerate() {
            table.insert(pid, priority)?;
        }
        debug!(
            groups = table.groups.len(),
            pids = priorities.len(),
            "built priority table"
        );
        Ok(table)
    }

    pub fn prio_to_gid(&self, priority: f64) -> Result<usize, SimError> {
        if priority.is_nan() || priority < 0.0 {
            return Err(SimError::Domain(format!(
                "priorities must be non-negative, got {}",
                priority
            )));
        }
        if priority == 0.0 {
            return Ok(0);
        }
        let e = exponent(priority);
        if e < self.minexp {
            Ok(1)
        } else {
            Ok((e - self.minexp + 1) as usize)
        }
    }

    #[inline]
    fn group_max(&self, gid: usize) -> f64 {
        (2.0f64).powi(self.minexp + gid as i32)
    }

    pub fn gsum(&self) -> f64 {
        self.gsum
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_len(&self, gid: usize) -> usize {
        self.groups[gid].len()
    }

    pub fn priority(&self, pid: usize) -> f64 {
        self.priorities[pid]
    }

    pub fn group_of(&self, pid: usize) -> usize {
        self.pidtogroup[pid].0
    }

    pub fn insert(&mut self, pid: usize, priority: f64) -> Result<(), SimError> {
        let gid = self.prio_to_gid(priority)?;
        if gid >= self.groups.len() {
            self.groups.resize_with(gid + 1, Vec::new);
            self.gsums.resize(gid + 1, 0.0);
        }
        if pid >= self.priorities.len() {
            self.priorities.resize(pid + 1, 0.0);
            self.pidtogroup.resize(pid + 1, (0, usize::MAX));
        }
        let slot = self.groups[gid].len();
        self.groups[gid].push(pid);
        self.pidtogroup[pid] = (gid, slot);
        self.priorities[pid] = priority;
        self.gsums[gid] += priority;
        self.gsum += priority;
        Ok(())
    }

    /// Re-key `pid` from `old` to `new`, moving it between groups when the
    /// binary exponent changed.
    pub fn update(&mut self, pid: usize, old: f64, new: f64) -> Result<(), SimError> {
        let oldgid = self.prio_to_gid(old)?;
        let newgid = self.prio_to_gid(new)?;
        self.priorities[pid] = new;
        if oldgid == newgid {
            self.gsums[oldgid] += new - old;
            if self.gsums[oldgid] < 0.0 {
                self.gsums[oldgid] = 0.0;
            }
        } else {
            // swap-remove from the old group, fixing the moved back-pointer
            let (gid, slot) = self.pidtogroup[pid];
            debug_assert_eq!(gid, oldgid);
            let grp = &mut self.groups[oldgid];
            let last = grp.len() - 1;
            grp.swap(slot, last);
            grp.pop();
            if slot < grp.len() {
                let moved = grp[slot];
                self.pidtogroup[moved] = (oldgid, slot);
            }
            self.gsums[oldgid] -= old;
            if self.groups[oldgid].is_empty() || self.gsums[oldgid] < 0.0 {
                self.gsums[oldgid] = 0.0;
            }
            if newgid >= self.groups.len() {
                self.groups.resize_with(newgid + 1, Vec::new);
                self.gsums.resize(newgid + 1, 0.0);
            }
            let nslot = self.groups[newgid].len();
            self.groups[newgid].push(pid);
            self.pidtogroup[pid] = (newgid, nslot);
            self.gsums[newgid] += new;
        }
        self.gsum += new - old;
        if self.gsum < 0.0 {
            self.gsum = 0.0;
        }
        Ok(())
    }

    /// Weighted sample over the current priorities; `None` when the total
    /// weight is zero.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        if self.gsum <= 0.0 {
            return None;
        }
        let mut r = rng.gen::<f64>() * self.gsum;
        let mut chosen = None;
        for (gid, &gs) in self.gsums.iter().enumerate() {
            if gs <= 0.0 || self.groups[gid].is_empty() {
                continue;
            }
            chosen = Some(gid);
            if r < gs {
                break;
            }
            r -= gs;
        }
        let gid = chosen?;
        let grp = &self.groups[gid];
        let gmax = self.group_max(gid);
        loop {
            let slot = rng.gen_range(0..grp.len());
            let pid = grp[slot];
            if rng.gen::<f64>() * gmax < self.priorities[pid] {
                return Some(pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn table_sum(pt: &PriorityTable) -> f64 {
        pt.priorities.iter().sum()
    }

    #[test]
    fn exponent_matches_log2_floor() {
        assert_eq!(exponent(1.0), 0);
        assert_eq!(exponent(1.5), 0);
        assert_eq!(exponent(2.0), 1);
        assert_eq!(exponent(0.5), -1);
        assert_eq!(exponent(1e-12), -40);
        assert_eq!(exponent(1e10), 33);
    }

    #[test]
    fn zero_goes_to_group_zero_and_is_never_sampled() {
        let pt = PriorityTable::new(1.0, 16.0, &[0.0, 4.0]).unwrap();
        assert_eq!(pt.group_of(0), 0);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(pt.sample(&mut rng), Some(1));
        }
    }

    #[test]
    fn negative_priority_is_a_domain_error() {
        let mut pt = PriorityTable::new(1.0, 16.0, &[]).unwrap();
        assert!(matches!(pt.insert(0, -1.0), Err(SimError::Domain(_))));
    }

    #[test]
    fn group_placement_spans_octaves_and_clamps_below_min() {
        let mp = (2.0f64).powi(-40); // 2^exponent(1e-12)
        let maxpriority = (2.0f64).powi(34); // one octave above 1e10
        let priorities = [1e-13, 0.99 * mp, mp, 1.01e-4, 1e-4, 5.0, 0.0, 1e10];
        let mut pt = PriorityTable::new(mp, maxpriority, &priorities).unwrap();

        // sub-minimum priorities clamp into the first positive group
        assert_eq!(pt.group_of(0), 1);
        assert_eq!(pt.group_of(1), 1);
        assert_eq!(pt.group_of(2), 1);
        assert_eq!(pt.group_of(6), 0);
        let last = pt.num_groups() - 1;
        assert_eq!(pt.group_of(7), last);

        // 0.99*maxpriority lands in the last existing group
        pt.insert(8, 0.99 * maxpriority).unwrap();
        assert_eq!(pt.group_of(8), last);
        pt.insert(9, 0.99999 * maxpriority).unwrap();
        assert_eq!(pt.group_len(last), 3);

        // 0.6*minpriority clamps into group 1 alongside the others
        pt.insert(10, 0.6 * mp).unwrap();
        assert_eq!(pt.group_of(10), 1);

        // maxpriority itself extends the table by one group
        let before = pt.num_groups();
        pt.insert(11, maxpriority).unwrap();
        assert_eq!(pt.num_groups(), before + 1);
        assert_eq!(pt.group_of(11), before);

        let expected = table_sum(&pt);
        assert!((pt.gsum() - expected).abs() <= 1e-9 * expected);
    }

    #[test]
    fn update_moves_between_groups_and_keeps_sums() {
        let mut pt = PriorityTable::new(1.0, 64.0, &[1.5, 3.0, 20.0, 0.0]).unwrap();
        let g_before = pt.group_of(1);
        pt.update(1, 3.0, 40.0).unwrap();
        assert_ne!(pt.group_of(1), g_before);
        pt.update(3, 0.0, 2.5).unwrap();
        assert_ne!(pt.group_of(3), 0);
        pt.update(0, 1.5, 0.0).unwrap();
        assert_eq!(pt.group_of(0), 0);
        let expected = table_sum(&pt);
        assert!((pt.gsum() - expected).abs() <= 1e-12 * expected.max(1.0));
    }

    #[test]
    fn sampling_frequencies_match_priorities() {
        let priorities = [1.0, 2.0, 4.0, 0.0, 9.0, 0.5];
        let pt = PriorityTable::new(0.25, 16.0, &priorities).unwrap();
        let total: f64 = priorities.iter().sum();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 200_000usize;
        let mut counts = [0usize; 6];
        for _ in 0..n {
            let pid = pt.sample(&mut rng).unwrap();
            counts[pid] += 1;
        }
        assert_eq!(counts[3], 0);
        for (pid, &c) in counts.iter().enumerate() {
            let expected = priorities[pid] / total;
            if expected > 0.0 {
                let observed = c as f64 / n as f64;
                assert!(
                    (observed - expected).abs() < 0.05 * expected + 0.002,
                    "pid {}: observed {} expected {}",
                    pid,
                    observed,
                    expected
                );
            }
        }
    }

    #[test]
    fn sampling_tracks_updates() {
        let mut pt = PriorityTable::new(1.0, 16.0, &[2.0, 2.0]).unwrap();
        pt.update(0, 2.0, 0.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(pt.sample(&mut rng), Some(1));
        }
        pt.update(0, 0.0, 6.0).unwrap();
        pt.update(1, 2.0, 0.0).unwrap();
        for _ in 0..100 {
            assert_eq!(pt.sample(&mut rng), Some(0));
        }
    }
}
