//! The impulse CPU frequency governor: per-core load sampling, hysteresis
//! driven frequency selection and a dedicated speed-change thread.

pub mod boost;
pub mod cluster;
pub mod config;
pub mod control;
pub mod error;
pub mod freq_table;
pub mod gate;
pub mod governor;
pub mod platform;
pub mod sampler;
pub mod selector;
pub mod sim;
pub mod status;
pub mod sysfs;
pub mod timer;
pub mod tunables;
pub mod worker;

pub use error::{GovernorError, PlatformError, SelectError};
pub use freq_table::{FreqLimits, FrequencyTable, Relation};
pub use governor::Governor;
pub use platform::{CoreId, DomainId, DomainInfo, IdleSample, Platform};
pub use tunables::{ThresholdTable, TunableConfig};

/// Defaults and limits shared across modules.
pub mod constants {
    /// Cores are tracked in 64-bit dirty masks.
    pub const MAX_CORES: usize = 64;

    // percent
    pub const DEFAULT_TARGET_LOAD: u32 = 90;
    pub const DEFAULT_GO_HISPEED_LOAD: u32 = 99;
    pub const DEFAULT_GO_LOWSPEED_LOAD: u32 = 10;
    /// Loads above this come from a frequency drop mid-window, not real demand.
    pub const MAX_LOCAL_LOAD: u32 = 100;

    // us
    pub const DEFAULT_TIMER_RATE_US: u64 = 20_000;
    pub const DEFAULT_MIN_SAMPLE_TIME_US: u64 = 80_000;
    pub const DEFAULT_ABOVE_HISPEED_DELAY_US: u32 = 20_000;
    pub const DEFAULT_TIMER_SLACK_US: u64 = 4 * DEFAULT_TIMER_RATE_US;

    // seconds
    pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 60;
}
