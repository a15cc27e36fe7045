//! A deterministic in-memory platform with a manual clock, for tests and
//! dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::PlatformError;
use crate::freq_table::Relation;
use crate::platform::{CoreId, DomainId, DomainInfo, IdleSample, Platform};

/// One call the governor made to `set_frequency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedChange {
    pub domain: DomainId,
    pub freq: u32,
    pub relation: Relation,
}

#[derive(Debug, Default)]
struct SimState {
    now_us: u64,
    domains: Vec<DomainInfo>,
    // percent busy
    load: HashMap<CoreId, u64>,
    idle_us: HashMap<CoreId, u64>,
    failing: HashSet<DomainId>,
    applied: Vec<AppliedChange>,
    rejected: Vec<AppliedChange>,
}

/// Cores accrue idle time at `100 - load` percent of every `advance`.
/// Unset loads are 0, i.e. fully idle.
#[derive(Debug, Default)]
pub struct SimPlatform {
    state: Mutex<SimState>,
    applied_cv: Condvar,
    idle_transitions: bool,
}

impl SimPlatform {
    pub fn new(domains: Vec<DomainInfo>) -> Self {
        Self {
            state: Mutex::new(SimState {
                domains,
                ..SimState::default()
            }),
            ..Self::default()
        }
    }

    pub fn with_idle_transitions(mut self, enabled: bool) -> Self {
        self.idle_transitions = enabled;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, us: u64) {
        let mut state = self.state();
        state.now_us += us;
        let cores: Vec<CoreId> = state
            .domains
            .iter()
            .flat_map(|d| d.cores.iter().copied())
            .collect();
        for core in cores {
            let load = state.load.get(&core).copied().unwrap_or(0);
            *state.idle_us.entry(core).or_default() += us * (100 - load.min(100)) / 100;
        }
    }

    pub fn set_load(&self, core: CoreId, percent: u64) {
        self.state().load.insert(core, percent);
    }

    /// Makes `set_frequency` fail for `domain` until cleared.
    pub fn fail_domain(&self, domain: DomainId, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(domain);
        } else {
            state.failing.remove(&domain);
        }
    }

    pub fn applied(&self) -> Vec<AppliedChange> {
        self.state().applied.clone()
    }

    /// Calls refused because the domain was failing.
    pub fn rejected(&self) -> Vec<AppliedChange> {
        self.state().rejected.clone()
    }

    /// Blocks until at least `count` changes were applied. Returns whether
    /// that happened before `timeout`.
    pub fn wait_for_applied(&self, count: usize, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .applied_cv
            .wait_timeout_while(state, timeout, |s| s.applied.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        state.applied.len() >= count
    }
}

impl Platform for SimPlatform {
    fn now_us(&self) -> u64 {
        self.state().now_us
    }

    fn idle_time(&self, core: CoreId, _io_is_busy: bool) -> IdleSample {
        let state = self.state();
        IdleSample {
            idle_us: state.idle_us.get(&core).copied().unwrap_or(0),
            wall_us: state.now_us,
        }
    }

    fn domains(&self) -> Result<Vec<DomainInfo>, PlatformError> {
        Ok(self.state().domains.clone())
    }

    fn set_frequency(
        &self,
        domain: DomainId,
        freq: u32,
        relation: Relation,
    ) -> Result<(), PlatformError> {
        let mut state = self.state();
        if state.failing.contains(&domain) {
            state.rejected.push(AppliedChange {
                domain,
                freq,
                relation,
            });
            return Err(PlatformError::Rejected(format!(
                "domain {domain} refuses changes"
            )));
        }
        let info = state
            .domains
            .iter_mut()
            .find(|d| d.id == domain)
            .ok_or(PlatformError::UnknownDomain(domain))?;
        info.cur = freq;
        state.applied.push(AppliedChange {
            domain,
            freq,
            relation,
        });
        drop(state);
        self.applied_cv.notify_all();
        Ok(())
    }

    fn reports_idle_transitions(&self) -> bool {
        self.idle_transitions
    }
}
