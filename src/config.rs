//! Daemon configuration file.
//!
//! Scalars that are missing or out of range fall back to their defaults with
//! a warning. Threshold tables are all-or-nothing: a malformed one is an
//! error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use toml::Table;

use crate::constants::*;
use crate::error::GovernorError;
use crate::status::default_status_path;
use crate::tunables::{ThresholdTable, TunableConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub tunables: TunableConfig,
    // seconds
    pub log_interval_secs: u64,
    pub status_file: PathBuf,
}

/// `<config dir>/impulse-governor/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut path| {
        path.push("impulse-governor");
        path.push("config.toml");
        path
    })
}

/// Loads `path`, or the default location if it exists, or built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, GovernorError> {
    let text = match path {
        Some(path) => std::fs::read_to_string(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                info!("using config {}", path.display());
                std::fs::read_to_string(path)?
            }
            None => {
                info!("no config file, using defaults");
                String::new()
            }
        },
    };
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<DaemonConfig, GovernorError> {
    let config = text.parse::<Table>()?;
    let defaults = TunableConfig::default();

    let timing = config.get("timing").and_then(|t| t.as_table());
    // us
    let timer_rate_us = timing
        .and_then(|t| t.get("timer-rate"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| v.is_positive().then_some(v).ok_or("must be positive"))
        .and_then(|v| u64::try_from(v).map_err(|_| "is out of range"))
        .unwrap_or_else(|s| {
            warn!(
                "timing.timer-rate {s}, replaced with the default of {DEFAULT_TIMER_RATE_US} us"
            );
            DEFAULT_TIMER_RATE_US
        });
    // us, -1 disables
    let timer_slack_us = match timing
        .and_then(|t| t.get("timer-slack"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
    {
        Ok(-1) => None,
        Ok(v @ 0..) => Some(v.unsigned_abs()),
        Ok(_) => {
            warn!("timing.timer-slack must be -1 or non-negative, replaced with the default of 4 * timing.timer-rate");
            Some(4 * timer_rate_us)
        }
        Err(s) => {
            warn!("timing.timer-slack {s}, replaced with the default of 4 * timing.timer-rate");
            Some(4 * timer_rate_us)
        }
    };
    // us
    let min_sample_time_us = timing
        .and_then(|t| t.get("min-sample-time"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative"))
        .unwrap_or_else(|s| {
            warn!(
                "timing.min-sample-time {s}, replaced with the default of \
                {DEFAULT_MIN_SAMPLE_TIME_US} us"
            );
            DEFAULT_MIN_SAMPLE_TIME_US
        });
    // us
    let max_freq_hysteresis_us = timing
        .and_then(|t| t.get("max-freq-hysteresis"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative"))
        .unwrap_or_else(|s| {
            warn!("timing.max-freq-hysteresis {s}, replaced with the default of 0 (disabled)");
            0
        });
    // us
    let boostpulse_duration_us = timing
        .and_then(|t| t.get("boostpulse-duration"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative"))
        .unwrap_or_else(|s| {
            warn!(
                "timing.boostpulse-duration {s}, replaced with the default of \
                {} us",
                defaults.boostpulse_duration_us
            );
            defaults.boostpulse_duration_us
        });
    let align_windows = timing
        .and_then(|t| t.get("align-windows"))
        .ok_or("is missing")
        .and_then(|v| v.as_bool().ok_or("must be a boolean"))
        .unwrap_or_else(|s| {
            warn!("timing.align-windows {s}, replaced with the default of false");
            false
        });

    let load = config.get("load").and_then(|t| t.as_table());
    // percent
    let go_hispeed_load = load
        .and_then(|t| t.get("go-hispeed"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| {
            (1..=100)
                .contains(&v)
                .then_some(v)
                .ok_or("must be between 1 and 100")
        })
        .and_then(|v| u32::try_from(v).map_err(|_| "is out of range"))
        .unwrap_or_else(|s| {
            warn!(
                "load.go-hispeed {s}, replaced with the default of {DEFAULT_GO_HISPEED_LOAD}%"
            );
            DEFAULT_GO_HISPEED_LOAD
        });
    // percent
    let go_lowspeed_load = load
        .and_then(|t| t.get("go-lowspeed"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| {
            (0..=100)
                .contains(&v)
                .then_some(v)
                .ok_or("must be between 0 and 100")
        })
        .and_then(|v| u32::try_from(v).map_err(|_| "is out of range"))
        .unwrap_or_else(|s| {
            warn!(
                "load.go-lowspeed {s}, replaced with the default of {DEFAULT_GO_LOWSPEED_LOAD}%"
            );
            DEFAULT_GO_LOWSPEED_LOAD
        });

    // kHz
    let hispeed_freq = config
        .get("frequency")
        .and_then(|t| t.as_table())
        .and_then(|t| t.get("hispeed"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| {
            u32::try_from(v).map_err(|_| &*format!("must be between 0 and {}", u32::MAX).leak())
        })
        .unwrap_or_else(|s| {
            warn!("frequency.hispeed {s}, replaced with the policy maximum");
            0
        });

    let flags = config.get("flags").and_then(|t| t.as_table());
    let io_is_busy = flags
        .and_then(|t| t.get("io-is-busy"))
        .ok_or("is missing")
        .and_then(|v| v.as_bool().ok_or("must be a boolean"))
        .unwrap_or_else(|s| {
            warn!("flags.io-is-busy {s}, replaced with the default of false");
            false
        });
    let powersave_bias = flags
        .and_then(|t| t.get("powersave-bias"))
        .ok_or("is missing")
        .and_then(|v| v.as_bool().ok_or("must be a boolean"))
        .unwrap_or_else(|s| {
            warn!("flags.powersave-bias {s}, replaced with the default of false");
            false
        });

    let daemon = config.get("daemon").and_then(|t| t.as_table());
    // seconds
    let log_interval_secs = daemon
        .and_then(|t| t.get("log-interval"))
        .ok_or("is missing")
        .and_then(|v| v.as_integer().ok_or("must be an integer"))
        .and_then(|v| u64::try_from(v).map_err(|_| "must not be negative"))
        .unwrap_or_else(|s| {
            warn!(
                "daemon.log-interval {s}, replaced with the default of \
                {DEFAULT_LOG_INTERVAL_SECS} seconds"
            );
            DEFAULT_LOG_INTERVAL_SECS
        });
    let status_file = daemon
        .and_then(|t| t.get("status-file"))
        .ok_or("is missing")
        .and_then(|v| v.as_str().ok_or("must be a string"))
        .map(PathBuf::from)
        .unwrap_or_else(|s| {
            let path = default_status_path();
            info!("daemon.status-file {s}, using {}", path.display());
            path
        });

    let target_loads = threshold_table(&config, "target-loads", "load")?.unwrap_or_else(|| {
        info!("target-loads undefined, using {DEFAULT_TARGET_LOAD}% at every frequency");
        defaults.target_loads.clone()
    });
    let above_hispeed_delay = threshold_table(&config, "above-hispeed-delays", "delay")?
        .unwrap_or_else(|| defaults.above_hispeed_delay.clone());

    let tunables = TunableConfig {
        target_loads,
        above_hispeed_delay,
        hispeed_freq,
        go_hispeed_load,
        go_lowspeed_load,
        min_sample_time_us,
        timer_rate_us,
        timer_slack_us,
        max_freq_hysteresis_us,
        boostpulse_duration_us,
        align_windows,
        io_is_busy,
        powersave_bias,
    };
    tunables.validate()?;

    Ok(DaemonConfig {
        tunables,
        log_interval_secs,
        status_file,
    })
}

/// An array of `{ frequency = kHz, <value_key> = n }` tables.
fn threshold_table(
    config: &Table,
    key: &str,
    value_key: &str,
) -> Result<Option<ThresholdTable>, GovernorError> {
    let Some(array) = config.get(key) else {
        return Ok(None);
    };
    let array = array
        .as_array()
        .ok_or_else(|| GovernorError::Config(format!("{key} must be an array")))?;
    if array.is_empty() {
        return Err(GovernorError::Config(format!("{key} must not be empty")));
    }

    let mut entries = BTreeMap::new();
    for (i, t) in array.iter().enumerate() {
        let t = t
            .as_table()
            .ok_or_else(|| GovernorError::Config(format!("{key}[{i}] must be a table")))?;
        let field = |name: &str| -> Result<u32, GovernorError> {
            let v = t
                .get(name)
                .ok_or_else(|| GovernorError::Config(format!("{key}[{i}].{name} must exist")))?
                .as_integer()
                .ok_or_else(|| {
                    GovernorError::Config(format!("{key}[{i}].{name} must be an integer"))
                })?;
            u32::try_from(v).map_err(|_| {
                GovernorError::Config(format!(
                    "{key}[{i}].{name} must be between 0 and {} inclusive",
                    u32::MAX
                ))
            })
        };
        // kHz
        let frequency = field("frequency")?;
        let value = field(value_key)?;
        if entries.insert(frequency, value).is_some() {
            return Err(GovernorError::Config(format!(
                "{key} has multiple entries for {frequency} kHz"
            )));
        }
    }

    ThresholdTable::new(entries.into_iter().collect())
        .map(Some)
        .map_err(|e| GovernorError::Config(format!("{key}: {e}")))
}
