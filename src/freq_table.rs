use serde::{Deserialize, Serialize};

use crate::error::SelectError;

/// Direction used when snapping a requested frequency onto the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// Lowest entry at or above the target.
    Low,
    /// Highest entry at or below the target.
    High,
    /// Closest entry, ties resolved downward so the target is not overshot.
    Ceiling,
}

/// Policy bounds of a frequency domain, in table units (kHz).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreqLimits {
    pub min: u32,
    pub max: u32,
}

impl FreqLimits {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, freq: u32) -> bool {
        (self.min..=self.max).contains(&freq)
    }
}

/// Discrete frequencies supported by one clock domain, ascending and unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyTable(Vec<u32>);

impl FrequencyTable {
    pub fn new(freqs: impl IntoIterator<Item = u32>) -> Self {
        let mut freqs: Vec<u32> = freqs.into_iter().collect();
        freqs.sort_unstable();
        freqs.dedup();
        Self(freqs)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn lowest(&self) -> Option<u32> {
        self.0.first().copied()
    }

    pub fn highest(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn contains(&self, freq: u32) -> bool {
        self.0.binary_search(&freq).is_ok()
    }

    /// Snaps `target` onto the table, only considering entries inside `limits`.
    ///
    /// `Low` falls back to the highest entry below the target when nothing is
    /// at or above it, `High` falls back to the lowest entry above it. The
    /// lookup only fails when no entry lies inside the limits at all.
    pub fn resolve(&self, target: u64, relation: Relation, limits: FreqLimits) -> Option<u32> {
        let mut in_range = self.0.iter().copied().filter(|f| limits.contains(*f));
        match relation {
            Relation::Low => {
                let mut below = None;
                for freq in in_range {
                    if u64::from(freq) >= target {
                        return Some(freq);
                    }
                    below = Some(freq);
                }
                below
            }
            Relation::High => {
                let mut above = None;
                while let Some(freq) = in_range.next_back() {
                    if u64::from(freq) <= target {
                        return Some(freq);
                    }
                    above = Some(freq);
                }
                above
            }
            Relation::Ceiling => in_range.min_by_key(|f| (u64::from(*f).abs_diff(target), *f)),
        }
    }

    pub fn try_resolve(
        &self,
        target: u64,
        relation: Relation,
        limits: FreqLimits,
    ) -> Result<u32, SelectError> {
        self.resolve(target, relation, limits)
            .ok_or(SelectError::NoSuitableFrequency)
    }
}
