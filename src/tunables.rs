use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::GovernorError;

/// Ordered `(frequency threshold, value)` pairs.
///
/// The first threshold is always 0 and thresholds strictly increase, so every
/// frequency falls into exactly one bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(u32, u32)>", into = "Vec<(u32, u32)>")]
pub struct ThresholdTable(Vec<(u32, u32)>);

impl ThresholdTable {
    pub fn new(pairs: Vec<(u32, u32)>) -> Result<Self, GovernorError> {
        let Some(&(first, _)) = pairs.first() else {
            return Err(GovernorError::InvalidTable("must not be empty".into()));
        };
        if first != 0 {
            return Err(GovernorError::InvalidTable(format!(
                "first threshold must be 0, got {first}"
            )));
        }
        if let Some(w) = pairs.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(GovernorError::InvalidTable(format!(
                "thresholds must strictly increase ({} then {})",
                w[0].0, w[1].0
            )));
        }
        Ok(Self(pairs))
    }

    /// A table with one bracket covering every frequency.
    pub fn single(value: u32) -> Self {
        Self(vec![(0, value)])
    }

    pub fn pairs(&self) -> &[(u32, u32)] {
        &self.0
    }

    /// Value of the bracket with the highest threshold at or below `freq`.
    pub fn lookup(&self, freq: u32) -> u32 {
        let mut value = self.0[0].1;
        for &(threshold, v) in &self.0[1..] {
            if freq < threshold {
                break;
            }
            value = v;
        }
        value
    }
}

impl TryFrom<Vec<(u32, u32)>> for ThresholdTable {
    type Error = GovernorError;

    fn try_from(pairs: Vec<(u32, u32)>) -> Result<Self, Self::Error> {
        Self::new(pairs)
    }
}

impl From<ThresholdTable> for Vec<(u32, u32)> {
    fn from(table: ThresholdTable) -> Self {
        table.0
    }
}

/// Text form: alternating threshold/value tokens separated by whitespace or
/// `:`, e.g. `0:90 1200000:95`. An odd token count is rejected.
impl FromStr for ThresholdTable {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = s
            .split(|c: char| c.is_whitespace() || c == ':')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<u32>()
                    .map_err(|_| GovernorError::InvalidTable(format!("`{t}` is not a number")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if tokens.len() % 2 != 0 {
            return Err(GovernorError::InvalidTable(format!(
                "expected threshold/value pairs, got {} tokens",
                tokens.len()
            )));
        }
        Self::new(tokens.chunks_exact(2).map(|p| (p[0], p[1])).collect())
    }
}

impl fmt::Display for ThresholdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (threshold, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{threshold}:{value}")?;
        }
        Ok(())
    }
}

/// Snapshot of every governor parameter.
///
/// Published as a whole behind an `Arc`; a value is never mutated after the
/// governor has handed it to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableConfig {
    /// Target load percent per frequency bracket.
    pub target_loads: ThresholdTable,
    /// Minimum dwell (us) at the current frequency before climbing above hispeed.
    pub above_hispeed_delay: ThresholdTable,
    /// kHz, 0 = use the policy maximum of each domain.
    pub hispeed_freq: u32,
    // percent
    pub go_hispeed_load: u32,
    // percent
    pub go_lowspeed_load: u32,
    // us
    pub min_sample_time_us: u64,
    // us
    pub timer_rate_us: u64,
    /// us, `None` disables the slack wakeup of idle cores.
    pub timer_slack_us: Option<u64>,
    // us
    pub max_freq_hysteresis_us: u64,
    // us
    pub boostpulse_duration_us: u64,
    pub align_windows: bool,
    pub io_is_busy: bool,
    pub powersave_bias: bool,
}

impl Default for TunableConfig {
    fn default() -> Self {
        Self {
            target_loads: ThresholdTable::single(DEFAULT_TARGET_LOAD),
            above_hispeed_delay: ThresholdTable::single(DEFAULT_ABOVE_HISPEED_DELAY_US),
            hispeed_freq: 0,
            go_hispeed_load: DEFAULT_GO_HISPEED_LOAD,
            go_lowspeed_load: DEFAULT_GO_LOWSPEED_LOAD,
            min_sample_time_us: DEFAULT_MIN_SAMPLE_TIME_US,
            timer_rate_us: DEFAULT_TIMER_RATE_US,
            timer_slack_us: Some(DEFAULT_TIMER_SLACK_US),
            max_freq_hysteresis_us: 0,
            boostpulse_duration_us: DEFAULT_MIN_SAMPLE_TIME_US,
            align_windows: false,
            io_is_busy: false,
            powersave_bias: false,
        }
    }
}

impl TunableConfig {
    pub fn validate(&self) -> Result<(), GovernorError> {
        if let Some(&(threshold, load)) = self
            .target_loads
            .pairs()
            .iter()
            .find(|(_, load)| *load == 0 || *load > 100)
        {
            return Err(GovernorError::InvalidTunable {
                name: "target_loads",
                reason: format!("load {load} for {threshold} kHz must be in 1..=100"),
            });
        }
        if self.go_hispeed_load == 0 || self.go_hispeed_load > 100 {
            return Err(GovernorError::InvalidTunable {
                name: "go_hispeed_load",
                reason: format!("{} must be in 1..=100", self.go_hispeed_load),
            });
        }
        if self.go_lowspeed_load > 100 {
            return Err(GovernorError::InvalidTunable {
                name: "go_lowspeed_load",
                reason: format!("{} must be at most 100", self.go_lowspeed_load),
            });
        }
        if self.timer_rate_us == 0 {
            return Err(GovernorError::InvalidTunable {
                name: "timer_rate",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn target_load(&self, freq: u32) -> u32 {
        self.target_loads.lookup(freq)
    }

    pub fn above_hispeed_delay_us(&self, freq: u32) -> u64 {
        u64::from(self.above_hispeed_delay.lookup(freq))
    }

    /// Hispeed of a domain whose policy maximum is `policy_max`.
    pub fn hispeed_for(&self, policy_max: u32) -> u32 {
        if self.hispeed_freq == 0 {
            policy_max
        } else {
            self.hispeed_freq
        }
    }
}
