//! Windowed time-priority table for next-reaction scheduling.
//!
//! Scheduled fire times inside the sliding window `[mintime, mintime +
//! ngroups*timestep)` live in equal-width slots; later times are parked
//! outside the table until a `rebuild` slides the window forward. Lookup
//! of the earliest scheduled jump scans slots in order and only searches
//! the first non-empty one.

use tracing::debug;

use crate::SimError;

#[derive(Clone, Debug)]
pub struct PriorityTimeTable {
    mintime: f64,
    timestep: f64,
    groups: Vec<Vec<usize>>,
    /// `None` parks a pid outside the window.
    pidtogroup: Vec<Option<(usize, usize)>>,
    times: Vec<f64>,
}

impl PriorityTimeTable {
    pub fn new(
        ngroups: usize,
        mintime: f64,
        timestep: f64,
        times: &[f64],
    ) -> Result<Self, SimError> {
        if ngroups == 0 || !(timestep > 0.0) {
            return Err(SimError::Configuration(format!(
                "time table needs ngroups > 0 and timestep > 0, got {} and {}",
                ngroups, timestep
            )));
        }
        let mut table = Self {
            mintime,
            timestep,
            groups: vec![Vec::new(); ngroups],
            pidtogroup: Vec::new(),
            times: Vec::new(),
        };
        for (pid, &t) in times.iter().enumerate() {
            table.insert(pid, t);
        }
        Ok(table)
    }

    pub fn mintime(&self) -> f64 {
        self.mintime
    }

    pub fn maxtime(&self) -> f64 {
        self.mintime + self.groups.len() as f64 * self.timestep
    }

    pub fn time_of(&self, pid: usize) -> f64 {
        self.times[pid]
    }

    fn slot_of(&self, t: f64) -> Option<usize> {
        if t >= self.maxtime() {
            return None;
        }
        let g = ((t - self.mintime) / self.timestep).ceil() as i64;
        let g = g.clamp(1, self.groups.len() as i64);
        Some((g - 1) as usize)
    }

    pub fn insert(&mut self, pid: usize, t: f64) {
        if pid >= self.times.len() {
            self.times.resize(pid + 1, f64::INFINITY);
            self.pidtogroup.resize(pid + 1, None);
        }
        self.times[pid] = t;
        match self.slot_of(t) {
            Some(gid) => {
                let slot = self.groups[gid].len();
                self.groups[gid].push(pid);
                self.pidtogroup[pid] = Some((gid, slot));
            }
            None => {
                self.pidtogroup[pid] = None;
            }
        }
    }

    fn remove_from_slot(&mut self, pid: usize) {
        if let Some((gid, slot)) = self.pidtogroup[pid] {
            let grp = &mut self.groups[gid];
            let last = grp.len() - 1;
            grp.swap(slot, last);
            grp.pop();
            if slot < grp.len() {
                let moved = grp[slot];
                self.pidtogroup[moved] = Some((gid, slot));
            }
            self.pidtogroup[pid] = None;
        }
    }

    /// Reschedule `pid` from `t_old` to `t_new`, moving it in or out of
    /// the window as needed.
    pub fn update(&mut self, pid: usize, t_old: f64, t_new: f64) {
        debug_assert_eq!(self.times[pid], t_old);
        let _ = t_old;
        self.remove_from_slot(pid);
        self.insert(pid, t_new);
    }

    /// Earliest scheduled `(pid, time)` inside the window.
    pub fn get_first(&self) -> Option<(usize, f64)> {
        for grp in &self.groups {
            if grp.is_empty() {
                continue;
            }
            let mut best = grp[0];
            for &pid in &grp[1..] {
                if self.times[pid] < self.times[best] {
                    best = pid;
                }
            }
            return Some((best, self.times[best]));
        }
        None
    }

    /// Slide the window: re-slot every pid by its stored time against the
    /// new origin and slot width. O(N).
    pub fn rebuild(&mut self, mintime: f64, timestep: f64) -> Result<(), SimError> {
        if !(timestep > 0.0) {
            return Err(SimError::Configuration(format!(
                "time table rebuild needs timestep > 0, got {}",
                timestep
            )));
        }
        debug!(mintime, timestep, "rebuilding time table window");
        self.mintime = mintime;
        self.timestep = timestep;
        for grp in &mut self.groups {
            grp.clear();
        }
        for pid in 0..self.times.len() {
            let t = self.times[pid];
            match self.slot_of(t) {
                Some(gid) => {
                    let slot = self.groups[gid].len();
                    self.groups[gid].push(pid);
                    self.pidtogroup[pid] = Some((gid, slot));
                }
                None => {
                    self.pidtogroup[pid] = None;
                }
            }
        }
        Ok(())
    }
}
