//! Per-core sampling state and load accounting.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::platform::IdleSample;

/// Load measured over one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSample {
    /// Busy time weighted by running frequency, scaled to percent:
    /// the frequency at which the window would have been 100% busy, times 100.
    pub loadadjfreq: u64,
    /// Load relative to the core's committed target frequency.
    pub load_pct: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoreState {
    pub enabled: bool,
    /// Inside an idle period, between the idle enter and exit hooks.
    pub idle: bool,

    pub time_in_idle: u64,
    pub time_in_idle_timestamp: u64,
    pub cputime_speedadj: u64,
    pub cputime_speedadj_timestamp: u64,

    pub target_freq: u32,
    pub floor_freq: u32,
    /// Policy ceiling seen at the last limits change.
    pub max_freq: u32,

    pub floor_validate_time: u64,
    pub hispeed_validate_time: u64,
    pub local_hispeed_validate_time: u64,
    pub max_freq_idle_start_time: u64,

    /// Deadline of the armed sampling timer, `None` while unarmed.
    pub next_sample_at: Option<u64>,
}

impl CoreState {
    /// Fresh state for a core the governor starts managing.
    pub fn started(cur_freq: u32, max_freq: u32, now: u64) -> Self {
        Self {
            enabled: true,
            target_freq: cur_freq,
            floor_freq: cur_freq,
            max_freq,
            floor_validate_time: now,
            hispeed_validate_time: now,
            ..Self::default()
        }
    }

    /// Adds the busy time since the previous reading, weighted by the
    /// frequency the core ran at, and returns the reading's timestamp.
    pub fn update_load(&mut self, reading: IdleSample, cur_freq: u32) -> u64 {
        let delta_idle = reading.idle_us.saturating_sub(self.time_in_idle);
        let delta_time = reading.wall_us.saturating_sub(self.time_in_idle_timestamp);
        let active_time = delta_time.saturating_sub(delta_idle);

        self.cputime_speedadj = self
            .cputime_speedadj
            .saturating_add(active_time.saturating_mul(u64::from(cur_freq)));
        self.time_in_idle = reading.idle_us;
        self.time_in_idle_timestamp = reading.wall_us;
        reading.wall_us
    }

    /// Starts a new accounting window at `reading`.
    pub fn restart_window(&mut self, reading: IdleSample) {
        self.time_in_idle = reading.idle_us;
        self.time_in_idle_timestamp = reading.wall_us;
        self.cputime_speedadj = 0;
        self.cputime_speedadj_timestamp = reading.wall_us;
    }

    /// Load of the current window, `None` if no time has passed since it began.
    pub fn load(&self, now: u64) -> Option<LoadSample> {
        let delta_time = now.saturating_sub(self.cputime_speedadj_timestamp);
        if delta_time == 0 {
            return None;
        }
        let loadadjfreq = self.cputime_speedadj.saturating_mul(100) / delta_time;
        let load_pct = loadadjfreq
            .checked_div(u64::from(self.target_freq))
            .unwrap_or(0);
        Some(LoadSample {
            loadadjfreq,
            load_pct: u32::try_from(load_pct).unwrap_or(u32::MAX),
        })
    }
}

/// A core's state plus the gate serializing it against start/stop.
///
/// Hot paths enter through [`CoreSlot::try_active`] and skip the core when a
/// lifecycle transition holds the gate, they never wait on it.
#[derive(Debug, Default)]
pub struct CoreSlot {
    gate: RwLock<()>,
    state: Mutex<CoreState>,
}

impl CoreSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state of an enabled core, `None` if the core is disabled or
    /// in the middle of being started or stopped.
    pub fn try_active(&self) -> Option<ActiveCore<'_>> {
        let gate = self.gate.try_read().ok()?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.enabled {
            return None;
        }
        Some(ActiveCore { _gate: gate, state })
    }

    /// Exclusive access for start/stop; waits for in-flight samples to finish.
    pub fn transition(&self) -> Transition<'_> {
        let gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Transition { _gate: gate, state }
    }

    /// Copy of the state, for reporting.
    pub fn snapshot(&self) -> CoreState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ActiveCore<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    state: MutexGuard<'a, CoreState>,
}

impl Deref for ActiveCore<'_> {
    type Target = CoreState;

    fn deref(&self) -> &CoreState {
        &self.state
    }
}

impl DerefMut for ActiveCore<'_> {
    fn deref_mut(&mut self) -> &mut CoreState {
        &mut self.state
    }
}

pub struct Transition<'a> {
    _gate: RwLockWriteGuard<'a, ()>,
    state: MutexGuard<'a, CoreState>,
}

impl Deref for Transition<'_> {
    type Target = CoreState;

    fn deref(&self) -> &CoreState {
        &self.state
    }
}

impl DerefMut for Transition<'_> {
    fn deref_mut(&mut self) -> &mut CoreState {
        &mut self.state
    }
}
