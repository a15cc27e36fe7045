//! Target-load driven frequency selection.
//!
//! The target load depends on the frequency bracket, so the lowest frequency
//! that satisfies the load is found by a fixed-point search rather than a
//! single division: every step narrows `[freq_min, freq_max]` until the
//! candidate maps onto itself.

use crate::error::SelectError;
use crate::freq_table::{FreqLimits, FrequencyTable, Relation};
use crate::tunables::ThresholdTable;

/// Picks the lowest table frequency whose own target load is satisfied by
/// `load_adjusted_freq` (`load percent * running frequency`).
pub fn choose_freq(
    load_adjusted_freq: u64,
    current_freq: u32,
    table: &FrequencyTable,
    limits: FreqLimits,
    target_loads: &ThresholdTable,
) -> Result<u32, SelectError> {
    search(load_adjusted_freq, current_freq, table, limits, target_loads).map(|(freq, _)| freq)
}

/// Returns the chosen frequency and the number of iterations it took.
fn search(
    load_adjusted_freq: u64,
    current_freq: u32,
    table: &FrequencyTable,
    limits: FreqLimits,
    target_loads: &ThresholdTable,
) -> Result<(u32, u32), SelectError> {
    let mut freq = u64::from(current_freq);
    let mut freq_min: u64 = 0;
    let mut freq_max: u64 = u64::from(u32::MAX);
    let mut iterations = 0;

    loop {
        iterations += 1;
        let prev = freq;
        let target_load = u64::from(target_loads.lookup(prev as u32).max(1));

        freq = table
            .try_resolve(load_adjusted_freq / target_load, Relation::Low, limits)?
            .into();

        if freq > prev {
            // prev is too slow
            freq_min = prev;
            if freq >= freq_max {
                freq = table
                    .try_resolve(freq_max - 1, Relation::High, limits)?
                    .into();
                if freq == freq_min {
                    // freq_max is the slowest speed known to be fast enough
                    freq = freq_max;
                    break;
                }
            }
        } else if freq < prev {
            // prev is fast enough
            freq_max = prev;
            if freq <= freq_min {
                freq = table
                    .try_resolve(freq_min + 1, Relation::Low, limits)?
                    .into();
                if freq == freq_max {
                    break;
                }
            }
        }

        if freq == prev {
            break;
        }
    }

    Ok((freq as u32, iterations))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDE: FreqLimits = FreqLimits { min: 0, max: u32::MAX };

    fn table() -> FrequencyTable {
        FrequencyTable::new([200, 400, 800, 1200, 1600])
    }

    #[test]
    fn test_climbs_from_400_at_95_percent() {
        let tl = ThresholdTable::single(90);
        assert_eq!(choose_freq(400 * 95, 400, &table(), WIDE, &tl), Ok(800));
    }

    #[test]
    fn test_single_bracket_is_lowest_sufficient_entry() {
        let tl = ThresholdTable::single(90);
        let t = table();
        for load in 0..=100u64 {
            for cur in t.as_slice() {
                let lafreq = load * u64::from(*cur);
                let expected = t.resolve(lafreq / 90, Relation::Low, WIDE).unwrap();
                assert_eq!(
                    choose_freq(lafreq, *cur, &t, WIDE, &tl),
                    Ok(expected),
                    "load {load} at {cur}"
                );
            }
        }
    }

    #[test]
    fn test_drops_when_load_is_low() {
        let tl = ThresholdTable::single(90);
        assert_eq!(choose_freq(1600 * 10, 1600, &table(), WIDE, &tl), Ok(200));
    }

    #[test]
    fn test_saturates_at_highest_entry() {
        let tl = ThresholdTable::single(50);
        assert_eq!(choose_freq(1600 * 100, 1600, &table(), WIDE, &tl), Ok(1600));
    }

    #[test]
    fn test_bracket_dependent_target_load() {
        // 60% at 1200 would need 900 under the 80% bracket, 727 under the 99% one
        let tl = ThresholdTable::new(vec![(0, 80), (800, 99)]).unwrap();
        assert_eq!(choose_freq(1200 * 60, 1200, &table(), WIDE, &tl), Ok(800));
    }

    #[test]
    fn test_oscillating_brackets_settle_on_upper_bound() {
        // 400 asks for 800 under its 50% target, and 800 satisfies its own 99%
        let tl = ThresholdTable::new(vec![(0, 50), (800, 99)]).unwrap();
        assert_eq!(choose_freq(400 * 100, 400, &table(), WIDE, &tl), Ok(800));
    }

    #[test]
    fn test_respects_policy_limits() {
        let tl = ThresholdTable::single(90);
        let limits = FreqLimits::new(400, 1200);
        assert_eq!(choose_freq(1600 * 100, 1600, &table(), limits, &tl), Ok(1200));
        assert_eq!(choose_freq(0, 400, &table(), limits, &tl), Ok(400));
    }

    #[test]
    fn test_no_entry_inside_limits() {
        let tl = ThresholdTable::single(90);
        let limits = FreqLimits::new(500, 700);
        assert_eq!(
            choose_freq(400 * 50, 400, &table(), limits, &tl),
            Err(SelectError::NoSuitableFrequency)
        );
    }

    #[test]
    fn test_terminates_with_table_member() {
        let tables = [
            FrequencyTable::new([300]),
            FrequencyTable::new([300, 600]),
            FrequencyTable::new((1..=24).map(|i| i * 100)),
        ];
        let target_loads = [
            ThresholdTable::single(90),
            ThresholdTable::new(vec![(0, 30), (500, 95), (1500, 60)]).unwrap(),
            ThresholdTable::new(vec![(0, 99), (200, 10), (900, 70), (2000, 100)]).unwrap(),
        ];
        for t in &tables {
            for tl in &target_loads {
                for cur in t.as_slice() {
                    for load in (0..=100u64).step_by(7) {
                        let lafreq = load * u64::from(*cur);
                        let (freq, iterations) = search(lafreq, *cur, t, WIDE, tl).unwrap();
                        assert!(t.contains(freq), "{freq} not in table");
                        assert!(
                            iterations as usize <= t.len() + 1,
                            "{iterations} iterations for {} entries",
                            t.len()
                        );
                    }
                }
            }
        }
    }
}
