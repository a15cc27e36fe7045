//! Turns one sampling window into a committed target frequency.
//!
//! The rules below run in a fixed order and the first one that holds the
//! current target wins. The order matters: the floor is not refreshed while a
//! boost alone keeps the core at hispeed, so the core can drop as soon as the
//! boost ends, and the above-hispeed delay is measured from a cluster-wide
//! validation time that the speed-change worker maintains.

use crate::boost::BoostSnapshot;
use crate::constants::MAX_LOCAL_LOAD;
use crate::freq_table::{FreqLimits, FrequencyTable, Relation};
use crate::sampler::CoreState;
use crate::selector::choose_freq;
use crate::tunables::TunableConfig;

/// Frequency-domain facts a decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct DomainView<'a> {
    pub table: &'a FrequencyTable,
    pub limits: FreqLimits,
    /// Frequency the domain runs at.
    pub cur: u32,
}

/// Why a sample left the target alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    NoElapsedTime,
    NoSuitableFrequency,
    AboveHispeedDelay,
    MaxFreqHysteresis,
    FloorHysteresis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Target kept by a rule; the timer is re-armed.
    Hold(HoldReason),
    /// Target already right. `rearm` is false once the core sits at the
    /// policy maximum: the next idle exit re-evaluates it.
    Unchanged { rearm: bool },
    /// New target committed; the core must be marked dirty.
    Commit { freq: u32, rearm: bool },
}

impl Decision {
    pub fn rearm(&self) -> bool {
        match *self {
            Decision::Hold(_) => true,
            Decision::Unchanged { rearm } | Decision::Commit { rearm, .. } => rearm,
        }
    }
}

/// Evaluates the window that ends at `now` and updates the hysteresis state
/// of `core`.
pub fn evaluate(
    core: &mut CoreState,
    tunables: &TunableConfig,
    domain: &DomainView<'_>,
    boost: &BoostSnapshot,
    now: u64,
) -> Decision {
    let Some(load) = core.load(now) else {
        return Decision::Hold(HoldReason::NoElapsedTime);
    };

    let hispeed = tunables.hispeed_for(domain.limits.max);
    let mut boosted = boost.is_active(now) || load.load_pct >= tunables.go_hispeed_load;
    let mut new_freq;
    if load.load_pct <= tunables.go_lowspeed_load && !boost.indefinite {
        boosted = false;
        new_freq = domain.limits.min;
    } else {
        new_freq = match choose_freq(
            load.loadadjfreq,
            domain.cur,
            domain.table,
            domain.limits,
            &tunables.target_loads,
        ) {
            Ok(freq) => freq,
            Err(_) => return Decision::Hold(HoldReason::NoSuitableFrequency),
        };
        if boosted {
            new_freq = new_freq.max(hispeed.max(domain.limits.min));
        }
    }

    if load.load_pct <= MAX_LOCAL_LOAD
        && domain.cur >= hispeed
        && new_freq > domain.cur
        && now.saturating_sub(core.hispeed_validate_time)
            < tunables.above_hispeed_delay_us(domain.cur)
    {
        return Decision::Hold(HoldReason::AboveHispeedDelay);
    }

    core.local_hispeed_validate_time = now;

    let Some(new_freq) = domain
        .table
        .resolve(u64::from(new_freq), Relation::Low, domain.limits)
    else {
        return Decision::Hold(HoldReason::NoSuitableFrequency);
    };

    if core.target_freq >= domain.limits.max
        && new_freq < core.target_freq
        && now.saturating_sub(core.max_freq_idle_start_time) < tunables.max_freq_hysteresis_us
    {
        return Decision::Hold(HoldReason::MaxFreqHysteresis);
    }

    // Don't drop below the floor until it has been valid for min_sample_time.
    if new_freq < core.floor_freq
        && now.saturating_sub(core.floor_validate_time) < tunables.min_sample_time_us
    {
        return Decision::Hold(HoldReason::FloorHysteresis);
    }

    // A boost alone must not refresh the floor, or the core could not drop
    // when the boost ends.
    if !boosted || new_freq > hispeed {
        core.floor_freq = new_freq;
        core.floor_validate_time = now;
    }

    if new_freq >= domain.limits.max {
        core.max_freq_idle_start_time = now;
    }

    let rearm = new_freq != domain.limits.max;
    if core.target_freq == new_freq && core.target_freq <= domain.cur {
        return Decision::Unchanged { rearm };
    }

    core.target_freq = new_freq;
    Decision::Commit {
        freq: new_freq,
        rearm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::IdleSample;
    use crate::tunables::ThresholdTable;

    const RATE: u64 = 20_000;

    fn table() -> FrequencyTable {
        FrequencyTable::new([200, 400, 800, 1200, 1600])
    }

    fn tunables() -> TunableConfig {
        TunableConfig {
            target_loads: ThresholdTable::single(90),
            above_hispeed_delay: ThresholdTable::single(0),
            hispeed_freq: 1200,
            go_hispeed_load: 99,
            go_lowspeed_load: 5,
            min_sample_time_us: 80_000,
            max_freq_hysteresis_us: 0,
            ..TunableConfig::default()
        }
    }

    /// A core that has been running `target` with floor validated at 0 and a
    /// window of `RATE` us that was `load` percent busy at `cur`.
    fn core_with_load(target: u32, cur: u32, start: u64, load: u64) -> CoreState {
        let mut core = CoreState::started(target, 1600, 0);
        core.restart_window(IdleSample { idle_us: 0, wall_us: start });
        core.update_load(
            IdleSample {
                idle_us: RATE * (100 - load) / 100,
                wall_us: start + RATE,
            },
            cur,
        );
        core
    }

    fn evaluate_at(
        core: &mut CoreState,
        t: &TunableConfig,
        cur: u32,
        boost: BoostSnapshot,
        now: u64,
    ) -> Decision {
        let table = table();
        let domain = DomainView {
            table: &table,
            limits: FreqLimits::new(200, 1600),
            cur,
        };
        evaluate(core, t, &domain, &boost, now)
    }

    #[test]
    fn test_zero_window_holds() {
        let mut core = CoreState::started(400, 1600, 0);
        core.restart_window(IdleSample { idle_us: 0, wall_us: 100 });
        let d = evaluate_at(&mut core, &tunables(), 400, BoostSnapshot::default(), 100);
        assert_eq!(d, Decision::Hold(HoldReason::NoElapsedTime));
        assert!(d.rearm());
    }

    #[test]
    fn test_climbs_on_95_percent_at_400() {
        let mut core = core_with_load(400, 400, 0, 95);
        let d = evaluate_at(&mut core, &tunables(), 400, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Commit { freq: 800, rearm: true });
        assert_eq!(core.target_freq, 800);
        assert_eq!(core.floor_freq, 800);
        assert_eq!(core.local_hispeed_validate_time, RATE);
    }

    #[test]
    fn test_low_load_goes_to_minimum_and_clears_boost() {
        // floor validated long ago so the drop is allowed
        let start = 200_000;
        let mut core = core_with_load(800, 800, start, 3);
        // a pulse is running, but low load wins and does not refresh as boosted
        let boost = BoostSnapshot {
            pulse_end_us: start + 10 * RATE,
            ..BoostSnapshot::default()
        };
        let d = evaluate_at(&mut core, &tunables(), 800, boost, start + RATE);
        assert_eq!(d, Decision::Commit { freq: 200, rearm: true });
        assert_eq!(core.floor_freq, 200);
    }

    #[test]
    fn test_indefinite_boost_skips_low_load_path() {
        let start = 200_000;
        let mut core = core_with_load(800, 800, start, 3);
        let boost = BoostSnapshot {
            indefinite: true,
            ..BoostSnapshot::default()
        };
        let d = evaluate_at(&mut core, &tunables(), 800, boost, start + RATE);
        assert_eq!(d, Decision::Commit { freq: 1200, rearm: true });
        // boosted to exactly hispeed: floor left alone
        assert_eq!(core.floor_freq, 800);
    }

    #[test]
    fn test_go_hispeed_load_jumps_to_hispeed() {
        let mut core = core_with_load(200, 200, 0, 100);
        let d = evaluate_at(&mut core, &tunables(), 200, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Commit { freq: 1200, rearm: true });
    }

    #[test]
    fn test_above_hispeed_delay_blocks_climb() {
        let mut t = tunables();
        t.above_hispeed_delay = ThresholdTable::single(50_000);
        let mut core = core_with_load(1200, 1200, 0, 100);
        core.hispeed_validate_time = 0;
        let d = evaluate_at(&mut core, &t, 1200, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Hold(HoldReason::AboveHispeedDelay));
        assert_eq!(core.target_freq, 1200);

        let mut core = core_with_load(1200, 1200, 40_000, 100);
        let d = evaluate_at(&mut core, &t, 1200, BoostSnapshot::default(), 40_000 + RATE);
        assert_eq!(d, Decision::Commit { freq: 1600, rearm: false });
    }

    #[test]
    fn test_above_hispeed_delay_ignored_below_hispeed() {
        let mut t = tunables();
        t.above_hispeed_delay = ThresholdTable::single(1_000_000);
        let mut core = core_with_load(400, 400, 0, 95);
        let d = evaluate_at(&mut core, &t, 400, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Commit { freq: 800, rearm: true });
    }

    #[test]
    fn test_floor_hysteresis_blocks_early_drop() {
        let mut core = core_with_load(1200, 1200, 0, 20);
        core.floor_validate_time = 0;
        let d = evaluate_at(&mut core, &tunables(), 1200, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Hold(HoldReason::FloorHysteresis));
        assert_eq!(core.target_freq, 1200);

        let mut core = core_with_load(1200, 1200, 80_000, 20);
        let d = evaluate_at(&mut core, &tunables(), 1200, BoostSnapshot::default(), 80_000 + RATE);
        assert_eq!(d, Decision::Commit { freq: 400, rearm: true });
    }

    #[test]
    fn test_max_freq_hysteresis_holds_top_speed() {
        let mut t = tunables();
        t.max_freq_hysteresis_us = 500_000;
        t.min_sample_time_us = 0;
        let mut core = core_with_load(1600, 1600, 100_000, 20);
        core.max_freq_idle_start_time = 100_000;
        let d = evaluate_at(&mut core, &t, 1600, BoostSnapshot::default(), 100_000 + RATE);
        assert_eq!(d, Decision::Hold(HoldReason::MaxFreqHysteresis));

        let mut core = core_with_load(1600, 1600, 700_000, 20);
        core.max_freq_idle_start_time = 100_000;
        let d = evaluate_at(&mut core, &t, 1600, BoostSnapshot::default(), 700_000 + RATE);
        assert!(matches!(d, Decision::Commit { freq, .. } if freq < 1600));
    }

    #[test]
    fn test_unchanged_target_at_max_stops_timer() {
        let mut core = core_with_load(1600, 1600, 0, 100);
        let d = evaluate_at(&mut core, &tunables(), 1600, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Unchanged { rearm: false });
        assert!(!d.rearm());
        assert_eq!(core.max_freq_idle_start_time, RATE);
    }

    #[test]
    fn test_same_load_twice_is_stable() {
        let t = tunables();
        let mut core = core_with_load(400, 400, 0, 70);
        let first = evaluate_at(&mut core, &t, 400, BoostSnapshot::default(), RATE);
        assert_eq!(first, Decision::Unchanged { rearm: true });
        let target = core.target_freq;

        core.restart_window(IdleSample { idle_us: 0, wall_us: RATE });
        core.update_load(
            IdleSample {
                idle_us: RATE * 30 / 100,
                wall_us: 2 * RATE,
            },
            400,
        );
        let second = evaluate_at(&mut core, &t, 400, BoostSnapshot::default(), 2 * RATE);
        assert_eq!(second, first);
        assert_eq!(core.target_freq, target);
    }

    #[test]
    fn test_pending_raise_is_recommitted() {
        // target already 800 but the domain still runs 400: dirty again
        let mut core = core_with_load(800, 400, 0, 95);
        core.target_freq = 800;
        let d = evaluate_at(&mut core, &tunables(), 400, BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Commit { freq: 800, rearm: true });
    }

    #[test]
    fn test_no_entry_inside_limits_holds() {
        let table = table();
        let domain = DomainView {
            table: &table,
            limits: FreqLimits::new(500, 700),
            cur: 400,
        };
        let mut core = core_with_load(400, 400, 0, 50);
        let d = evaluate(&mut core, &tunables(), &domain, &BoostSnapshot::default(), RATE);
        assert_eq!(d, Decision::Hold(HoldReason::NoSuitableFrequency));
        assert_eq!(core.target_freq, 400);
    }
}
