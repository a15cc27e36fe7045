use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::sampler::CoreState;

/// Externally driven overrides that force the frequency up.
#[derive(Debug, Default)]
pub struct BoostState {
    indefinite: AtomicBool,
    // us
    pulse_end_us: AtomicU64,
    coboost: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BoostSnapshot {
    pub indefinite: bool,
    pub pulse_end_us: u64,
    pub coboost: bool,
}

impl BoostSnapshot {
    pub fn is_active(&self, now: u64) -> bool {
        self.indefinite || now < self.pulse_end_us || self.coboost
    }
}

impl BoostState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BoostSnapshot {
        BoostSnapshot {
            indefinite: self.indefinite.load(Ordering::Acquire),
            pulse_end_us: self.pulse_end_us.load(Ordering::Acquire),
            coboost: self.coboost.load(Ordering::Acquire),
        }
    }

    /// Clearing the flag also ends any running pulse at `now`.
    pub fn set_indefinite(&self, enabled: bool, now: u64) {
        self.indefinite.store(enabled, Ordering::Release);
        if !enabled {
            self.pulse_end_us.store(now, Ordering::Release);
        }
    }

    pub fn start_pulse(&self, end_us: u64) {
        self.pulse_end_us.store(end_us, Ordering::Release);
    }

    pub fn pulse_end(&self) -> u64 {
        self.pulse_end_us.load(Ordering::Acquire)
    }

    pub fn set_coboost(&self, enabled: bool) {
        self.coboost.store(enabled, Ordering::Release);
    }
}

/// Raises `core` to at least `hispeed` and pins its floor there.
///
/// Returns whether the target moved, i.e. the core needs a speed change.
pub fn raise_to_hispeed(core: &mut CoreState, hispeed: u32, now: u64) -> bool {
    let raised = core.target_freq < hispeed;
    if raised {
        core.target_freq = hispeed;
        core.hispeed_validate_time = now;
    }
    core.floor_freq = hispeed;
    core.floor_validate_time = now;
    raised
}
