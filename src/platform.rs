use serde::Serialize;

use crate::error::PlatformError;
use crate::freq_table::{FreqLimits, FrequencyTable, Relation};

pub type CoreId = usize;
pub type DomainId = usize;

/// Cumulative idle time of a core and the wall time it was read at, both in
/// microseconds of the platform clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdleSample {
    pub idle_us: u64,
    pub wall_us: u64,
}

/// A set of cores sharing one adjustable clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainInfo {
    pub id: DomainId,
    pub cores: Vec<CoreId>,
    pub table: FrequencyTable,
    pub limits: FreqLimits,
    /// Frequency the domain runs at right now.
    pub cur: u32,
}

/// Everything the governor needs from the system it runs on.
pub trait Platform: Send + Sync + 'static {
    /// Monotonic clock in microseconds.
    fn now_us(&self) -> u64;

    /// Idle time of `core`; I/O wait counts as busy when `io_is_busy` is set.
    fn idle_time(&self, core: CoreId, io_is_busy: bool) -> IdleSample;

    fn domains(&self) -> Result<Vec<DomainInfo>, PlatformError>;

    /// Moves `domain` to `freq`. Only ever called from the speed-change worker.
    fn set_frequency(
        &self,
        domain: DomainId,
        freq: u32,
        relation: Relation,
    ) -> Result<(), PlatformError>;

    /// Whether the platform calls the idle enter/exit hooks. When it doesn't,
    /// cores are treated as never idle.
    fn reports_idle_transitions(&self) -> bool {
        false
    }
}
