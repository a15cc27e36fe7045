use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::freq_table::{FreqLimits, FrequencyTable};
use crate::gate::DomainView;
use crate::platform::{CoreId, DomainId, DomainInfo};
use crate::sampler::CoreSlot;

/// The frequency to apply to a domain and the hi-speed validation time every
/// member adopts with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    pub freq: u32,
    pub validate_time: u64,
}

/// Runtime state of one clock domain.
#[derive(Debug)]
pub struct ClusterState {
    pub id: DomainId,
    pub cores: Vec<CoreId>,
    pub table: FrequencyTable,
    min: AtomicU32,
    max: AtomicU32,
    cur: AtomicU32,
    /// Members with a pending speed change, one bit per core id.
    dirty: AtomicU64,
}

impl ClusterState {
    pub fn new(info: DomainInfo) -> Self {
        Self {
            id: info.id,
            cores: info.cores,
            table: info.table,
            min: AtomicU32::new(info.limits.min),
            max: AtomicU32::new(info.limits.max),
            cur: AtomicU32::new(info.cur),
            dirty: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> FreqLimits {
        FreqLimits {
            min: self.min.load(Ordering::Acquire),
            max: self.max.load(Ordering::Acquire),
        }
    }

    pub fn set_limits(&self, limits: FreqLimits) {
        self.min.store(limits.min, Ordering::Release);
        self.max.store(limits.max, Ordering::Release);
    }

    pub fn cur(&self) -> u32 {
        self.cur.load(Ordering::Acquire)
    }

    pub fn set_cur(&self, freq: u32) {
        self.cur.store(freq, Ordering::Release);
    }

    pub fn view(&self) -> DomainView<'_> {
        DomainView {
            table: &self.table,
            limits: self.limits(),
            cur: self.cur(),
        }
    }

    pub fn mark_dirty(&self, core: CoreId) {
        self.dirty.fetch_or(1 << core, Ordering::AcqRel);
    }

    /// Drains the pending set in one exchange.
    pub fn take_dirty(&self) -> u64 {
        self.dirty.swap(0, Ordering::AcqRel)
    }

    pub fn discard_dirty(&self, core: CoreId) {
        self.dirty.fetch_and(!(1 << core), Ordering::AcqRel);
    }

    pub fn has_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) != 0
    }

    /// Max-aggregates the targets of the enabled members and broadcasts the
    /// resulting validation time back to them. `None` if no member is enabled.
    pub fn aggregate(&self, slots: &[CoreSlot]) -> Option<Aggregate> {
        let targets = self.cores.iter().filter_map(|&id| {
            let core = slots.get(id)?.try_active()?;
            Some((core.target_freq, core.local_hispeed_validate_time))
        });
        let aggregate = max_target(targets)?;

        for &id in &self.cores {
            if let Some(mut core) = slots.get(id).and_then(CoreSlot::try_active) {
                core.hispeed_validate_time = aggregate.validate_time;
            }
        }
        Some(aggregate)
    }
}

/// Highest target; the validation time comes from its holder, or the earliest
/// among several holders so a core that just boosted doesn't restart the
/// dwell of one that has been there longer.
pub fn max_target(targets: impl IntoIterator<Item = (u32, u64)>) -> Option<Aggregate> {
    let mut best: Option<Aggregate> = None;
    for (freq, validate_time) in targets {
        best = Some(match best {
            Some(b) if freq < b.freq => b,
            Some(b) if freq == b.freq => Aggregate {
                freq,
                validate_time: b.validate_time.min(validate_time),
            },
            _ => Aggregate {
                freq,
                validate_time,
            },
        });
    }
    best
}
