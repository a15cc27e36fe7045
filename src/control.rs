//! Text attribute surface: every tunable and boost control by name, with the
//! value as a string.

use std::str::FromStr;

use crate::error::GovernorError;
use crate::governor::Governor;
use crate::platform::Platform;
use crate::tunables::ThresholdTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    TargetLoads,
    AboveHispeedDelay,
    HispeedFreq,
    GoHispeedLoad,
    GoLowspeedLoad,
    MinSampleTime,
    TimerRate,
    TimerSlack,
    MaxFreqHysteresis,
    AlignWindows,
    IoIsBusy,
    PowersaveBias,
    Boost,
    Boostpulse,
    BoostpulseDuration,
}

impl Attribute {
    pub const ALL: [Attribute; 15] = [
        Attribute::TargetLoads,
        Attribute::AboveHispeedDelay,
        Attribute::HispeedFreq,
        Attribute::GoHispeedLoad,
        Attribute::GoLowspeedLoad,
        Attribute::MinSampleTime,
        Attribute::TimerRate,
        Attribute::TimerSlack,
        Attribute::MaxFreqHysteresis,
        Attribute::AlignWindows,
        Attribute::IoIsBusy,
        Attribute::PowersaveBias,
        Attribute::Boost,
        Attribute::Boostpulse,
        Attribute::BoostpulseDuration,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Attribute::TargetLoads => "target_loads",
            Attribute::AboveHispeedDelay => "above_hispeed_delay",
            Attribute::HispeedFreq => "hispeed_freq",
            Attribute::GoHispeedLoad => "go_hispeed_load",
            Attribute::GoLowspeedLoad => "go_lowspeed_load",
            Attribute::MinSampleTime => "min_sample_time",
            Attribute::TimerRate => "timer_rate",
            Attribute::TimerSlack => "timer_slack",
            Attribute::MaxFreqHysteresis => "max_freq_hysteresis",
            Attribute::AlignWindows => "align_windows",
            Attribute::IoIsBusy => "io_is_busy",
            Attribute::PowersaveBias => "powersave_bias",
            Attribute::Boost => "boost",
            Attribute::Boostpulse => "boostpulse",
            Attribute::BoostpulseDuration => "boostpulse_duration",
        }
    }
}

impl FromStr for Attribute {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| GovernorError::UnknownAttribute(s.to_string()))
    }
}

fn parse_num<T: FromStr>(attr: Attribute, value: &str) -> Result<T, GovernorError> {
    let value = value.trim();
    value.parse().map_err(|_| GovernorError::InvalidTunable {
        name: attr.name(),
        reason: format!("`{value}` is not a number"),
    })
}

/// Any non-zero number is true.
fn parse_flag(attr: Attribute, value: &str) -> Result<bool, GovernorError> {
    parse_num::<u64>(attr, value).map(|v| v != 0)
}

fn show_flag(flag: bool) -> String {
    u8::from(flag).to_string()
}

impl<P: Platform> Governor<P> {
    /// Writes one attribute. Tunable writes are validated as a whole and
    /// leave the previous value in place on error.
    pub fn store_attr(&self, name: &str, value: &str) -> Result<(), GovernorError> {
        let attr: Attribute = name.parse()?;
        match attr {
            Attribute::TargetLoads => {
                let table: ThresholdTable = value.parse()?;
                self.update_tunables(|t| t.target_loads = table)
            }
            Attribute::AboveHispeedDelay => {
                let table: ThresholdTable = value.parse()?;
                self.update_tunables(|t| t.above_hispeed_delay = table)
            }
            Attribute::HispeedFreq => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.hispeed_freq = v)
            }
            Attribute::GoHispeedLoad => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.go_hispeed_load = v)
            }
            Attribute::GoLowspeedLoad => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.go_lowspeed_load = v)
            }
            Attribute::MinSampleTime => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.min_sample_time_us = v)
            }
            Attribute::TimerRate => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.timer_rate_us = v)
            }
            Attribute::TimerSlack => {
                let v: i64 = parse_num(attr, value)?;
                let slack = match v {
                    -1 => None,
                    _ => Some(u64::try_from(v).map_err(|_| GovernorError::InvalidTunable {
                        name: attr.name(),
                        reason: format!("{v} must be -1 or non-negative"),
                    })?),
                };
                self.update_tunables(|t| t.timer_slack_us = slack)
            }
            Attribute::MaxFreqHysteresis => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.max_freq_hysteresis_us = v)
            }
            Attribute::AlignWindows => {
                let v = parse_flag(attr, value)?;
                self.update_tunables(|t| t.align_windows = v)
            }
            Attribute::IoIsBusy => {
                let v = parse_flag(attr, value)?;
                self.update_tunables(|t| t.io_is_busy = v)
            }
            Attribute::PowersaveBias => {
                let v = parse_flag(attr, value)?;
                self.update_tunables(|t| t.powersave_bias = v)
            }
            Attribute::Boost => {
                self.set_boost(parse_flag(attr, value)?);
                Ok(())
            }
            Attribute::Boostpulse => {
                parse_num::<u64>(attr, value)?;
                self.boost_pulse(None);
                Ok(())
            }
            Attribute::BoostpulseDuration => {
                let v = parse_num(attr, value)?;
                self.update_tunables(|t| t.boostpulse_duration_us = v)
            }
        }
    }

    /// Reads one attribute in the same text form `store_attr` accepts.
    pub fn show_attr(&self, name: &str) -> Result<String, GovernorError> {
        let attr: Attribute = name.parse()?;
        let t = self.tunables();
        Ok(match attr {
            Attribute::TargetLoads => t.target_loads.to_string(),
            Attribute::AboveHispeedDelay => t.above_hispeed_delay.to_string(),
            Attribute::HispeedFreq => t.hispeed_freq.to_string(),
            Attribute::GoHispeedLoad => t.go_hispeed_load.to_string(),
            Attribute::GoLowspeedLoad => t.go_lowspeed_load.to_string(),
            Attribute::MinSampleTime => t.min_sample_time_us.to_string(),
            Attribute::TimerRate => t.timer_rate_us.to_string(),
            Attribute::TimerSlack => match t.timer_slack_us {
                Some(slack) => slack.to_string(),
                None => "-1".into(),
            },
            Attribute::MaxFreqHysteresis => t.max_freq_hysteresis_us.to_string(),
            Attribute::AlignWindows => show_flag(t.align_windows),
            Attribute::IoIsBusy => show_flag(t.io_is_busy),
            Attribute::PowersaveBias => show_flag(t.powersave_bias),
            Attribute::Boost => show_flag(self.boost().indefinite),
            Attribute::Boostpulse => self.boost().pulse_end_us.to_string(),
            Attribute::BoostpulseDuration => t.boostpulse_duration_us.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq_table::{FreqLimits, FrequencyTable};
    use crate::platform::DomainInfo;
    use crate::sim::SimPlatform;
    use crate::tunables::TunableConfig;

    fn governor() -> Governor<SimPlatform> {
        let platform = SimPlatform::new(vec![DomainInfo {
            id: 0,
            cores: vec![0],
            table: FrequencyTable::new([300, 600, 900]),
            limits: FreqLimits::new(300, 900),
            cur: 300,
        }]);
        Governor::new(platform, TunableConfig::default()).unwrap()
    }

    #[test]
    fn test_every_attribute_round_trips_its_name() {
        for attr in Attribute::ALL {
            assert_eq!(attr.name().parse::<Attribute>().unwrap(), attr);
        }
        assert!(matches!(
            "sampling_rate".parse::<Attribute>(),
            Err(GovernorError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_every_attribute_is_readable() {
        let gov = governor();
        for attr in Attribute::ALL {
            gov.show_attr(attr.name()).unwrap();
        }
    }

    #[test]
    fn test_store_table_attribute() {
        let gov = governor();
        gov.store_attr("target_loads", "0 85 600:95").unwrap();
        assert_eq!(gov.show_attr("target_loads").unwrap(), "0:85 600:95");
        assert_eq!(gov.tunables().target_load(700), 95);
    }

    #[test]
    fn test_rejected_store_keeps_previous_value() {
        let gov = governor();
        assert!(gov.store_attr("target_loads", "0:85 600").is_err());
        assert!(gov.store_attr("go_hispeed_load", "0").is_err());
        assert!(gov.store_attr("timer_rate", "fast").is_err());
        assert_eq!(*gov.tunables(), TunableConfig::default());
    }

    #[test]
    fn test_timer_slack_minus_one_disables() {
        let gov = governor();
        gov.store_attr("timer_slack", "-1").unwrap();
        assert_eq!(gov.tunables().timer_slack_us, None);
        assert_eq!(gov.show_attr("timer_slack").unwrap(), "-1");
        gov.store_attr("timer_slack", "40000").unwrap();
        assert_eq!(gov.tunables().timer_slack_us, Some(40_000));
        assert!(gov.store_attr("timer_slack", "-5").is_err());
    }

    #[test]
    fn test_flags_accept_any_nonzero() {
        let gov = governor();
        gov.store_attr("io_is_busy", "2").unwrap();
        assert_eq!(gov.show_attr("io_is_busy").unwrap(), "1");
        gov.store_attr("io_is_busy", " 0\n").unwrap();
        assert_eq!(gov.show_attr("io_is_busy").unwrap(), "0");
    }

    #[test]
    fn test_boostpulse_reports_pulse_end() {
        let gov = governor();
        gov.platform().advance(1_000);
        gov.store_attr("boostpulse_duration", "5000").unwrap();
        gov.store_attr("boostpulse", "1").unwrap();
        assert_eq!(gov.show_attr("boostpulse").unwrap(), "6000");

        gov.store_attr("boost", "1").unwrap();
        assert_eq!(gov.show_attr("boost").unwrap(), "1");
        gov.store_attr("boost", "0").unwrap();
        assert_eq!(gov.show_attr("boostpulse").unwrap(), "1000");
    }
}
