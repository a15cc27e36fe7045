//! Linux backend: idle time from `/proc/stat`, frequency domains from the
//! cpufreq policies in sysfs. Frequencies are applied through the `userspace`
//! scaling governor's `scaling_setspeed`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::{debug, warn};

use crate::error::PlatformError;
use crate::freq_table::{FreqLimits, FrequencyTable, Relation};
use crate::platform::{CoreId, DomainId, DomainInfo, IdleSample, Platform};

const CPUFREQ_ROOT: &str = "/sys/devices/system/cpu/cpufreq";
const PROC_STAT: &str = "/proc/stat";
// /proc/stat ticks are in USER_HZ
const USEC_PER_TICK: u64 = 1_000_000 / 100;
// us
const STAT_TTL_US: u64 = 1_000;

/// Idle and iowait ticks of every core, from one read of `/proc/stat`.
#[derive(Debug, Clone, Default)]
struct StatSnapshot {
    read_at_us: u64,
    ticks: HashMap<CoreId, (u64, u64)>,
}

impl StatSnapshot {
    fn idle(&self, core: CoreId, io_is_busy: bool) -> Option<IdleSample> {
        let &(idle, iowait) = self.ticks.get(&core)?;
        let ticks = if io_is_busy { idle } else { idle + iowait };
        Some(IdleSample {
            idle_us: ticks * USEC_PER_TICK,
            wall_us: self.read_at_us,
        })
    }
}

pub struct SysfsPlatform {
    cpufreq_root: PathBuf,
    stat_path: PathBuf,
    epoch: Instant,
    /// Snapshots younger than this are reused instead of re-reading the file.
    stat_ttl_us: u64,
    /// Last good snapshot, also reused when `/proc/stat` can't be read.
    stat: Mutex<Option<StatSnapshot>>,
    /// Tables found by `domains`; only the limits are re-read per change.
    tables: Mutex<HashMap<DomainId, FrequencyTable>>,
}

impl SysfsPlatform {
    pub fn new() -> Self {
        Self::with_roots(CPUFREQ_ROOT, PROC_STAT)
    }

    pub fn with_roots(cpufreq_root: impl Into<PathBuf>, stat_path: impl Into<PathBuf>) -> Self {
        Self {
            cpufreq_root: cpufreq_root.into(),
            stat_path: stat_path.into(),
            epoch: Instant::now(),
            stat_ttl_us: STAT_TTL_US,
            stat: Mutex::new(None),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Switches every policy to the `userspace` scaling governor so writes to
    /// `scaling_setspeed` take effect.
    pub fn take_control(&self) -> Result<(), PlatformError> {
        for (id, dir) in self.policy_dirs()? {
            std::fs::write(dir.join("scaling_governor"), "userspace")?;
            debug!("policy{id}: scaling governor set to userspace");
        }
        Ok(())
    }

    fn policy_dirs(&self) -> Result<Vec<(DomainId, PathBuf)>, PlatformError> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.cpufreq_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("policy"))
                .and_then(|n| n.parse::<DomainId>().ok())
            else {
                continue;
            };
            dirs.push((id, entry.path()));
        }
        dirs.sort_unstable_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    fn policy(&self, id: DomainId, dir: &Path) -> Result<DomainInfo, PlatformError> {
        Ok(DomainInfo {
            id,
            cores: parse_cpu_list(&dir.join("related_cpus"))?,
            table: read_table(dir)?,
            limits: read_limits(dir)?,
            cur: read_number(&dir.join("scaling_cur_freq"))?,
        })
    }

    /// Parses the `cpuN` lines of one `/proc/stat` read.
    fn read_stat(&self, now: u64) -> Result<StatSnapshot, PlatformError> {
        let stat = std::fs::read_to_string(&self.stat_path)?;
        let mut ticks = HashMap::new();
        for line in stat.lines() {
            let mut fields = line.split_whitespace();
            // skips the aggregate `cpu` line too
            let Some(core) = fields
                .next()
                .and_then(|label| label.strip_prefix("cpu"))
                .and_then(|n| n.parse::<CoreId>().ok())
            else {
                continue;
            };

            // cpuN user nice system idle iowait irq softirq ...
            let values: Vec<u64> = fields
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|_| malformed(&self.stat_path, format!("non-numeric cpu{core} line")))?;
            if values.len() < 5 {
                return Err(malformed(&self.stat_path, format!("short cpu{core} line")));
            }
            ticks.insert(core, (values[3], values[4]));
        }
        if ticks.is_empty() {
            return Err(malformed(&self.stat_path, "no cpuN lines".into()));
        }
        Ok(StatSnapshot {
            read_at_us: now,
            ticks,
        })
    }
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SysfsPlatform {
    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn idle_time(&self, core: CoreId, io_is_busy: bool) -> IdleSample {
        let now = self.now_us();
        let mut stat = self.stat.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = stat
            .as_ref()
            .is_some_and(|s| now.saturating_sub(s.read_at_us) < self.stat_ttl_us);
        if !fresh {
            match self.read_stat(now) {
                Ok(snapshot) => *stat = Some(snapshot),
                Err(e) => warn!("reading idle time failed: {e}"),
            }
        }
        stat.as_ref()
            .and_then(|s| s.idle(core, io_is_busy))
            .unwrap_or_else(|| {
                warn!("cpu{core}: no idle time in {}", self.stat_path.display());
                IdleSample {
                    idle_us: 0,
                    wall_us: now,
                }
            })
    }

    fn domains(&self) -> Result<Vec<DomainInfo>, PlatformError> {
        let domains = self
            .policy_dirs()?
            .into_iter()
            .map(|(id, dir)| self.policy(id, &dir))
            .collect::<Result<Vec<_>, _>>()?;
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        for domain in &domains {
            tables.insert(domain.id, domain.table.clone());
        }
        Ok(domains)
    }

    fn set_frequency(
        &self,
        domain: DomainId,
        freq: u32,
        relation: Relation,
    ) -> Result<(), PlatformError> {
        let dir = self.cpufreq_root.join(format!("policy{domain}"));
        if !dir.exists() {
            return Err(PlatformError::UnknownDomain(domain));
        }
        let limits = read_limits(&dir)?;
        let resolved = {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let table = match tables.entry(domain) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(read_table(&dir)?),
            };
            table.resolve(u64::from(freq), relation, limits)
        };
        let freq = resolved.ok_or_else(|| {
            PlatformError::Rejected(format!("no entry for {freq} kHz in policy{domain}"))
        })?;
        std::fs::write(dir.join("scaling_setspeed"), freq.to_string())?;
        Ok(())
    }
}

fn malformed(path: &Path, reason: String) -> PlatformError {
    PlatformError::Malformed {
        path: path.display().to_string(),
        reason,
    }
}

fn read_number(path: &Path) -> Result<u32, PlatformError> {
    let text = std::fs::read_to_string(path)?;
    text.trim()
        .parse()
        .map_err(|_| malformed(path, format!("`{}` is not a number", text.trim())))
}

fn read_table(dir: &Path) -> Result<FrequencyTable, PlatformError> {
    let available = dir.join("scaling_available_frequencies");
    if available.exists() {
        return Ok(FrequencyTable::new(read_numbers(&available)?));
    }
    Ok(FrequencyTable::new([
        read_number(&dir.join("cpuinfo_min_freq"))?,
        read_number(&dir.join("cpuinfo_max_freq"))?,
    ]))
}

fn read_limits(dir: &Path) -> Result<FreqLimits, PlatformError> {
    Ok(FreqLimits::new(
        read_number(&dir.join("scaling_min_freq"))?,
        read_number(&dir.join("scaling_max_freq"))?,
    ))
}

fn read_numbers(path: &Path) -> Result<Vec<u32>, PlatformError> {
    let text = std::fs::read_to_string(path)?;
    text.split_whitespace()
        .map(|t| {
            t.parse()
                .map_err(|_| malformed(path, format!("`{t}` is not a number")))
        })
        .collect()
}

/// Accepts both `0 1 2 3` and `0-3,6`.
fn parse_cpu_list(path: &Path) -> Result<Vec<CoreId>, PlatformError> {
    let text = std::fs::read_to_string(path)?;
    let mut cpus = Vec::new();
    for token in text.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        let bad = || malformed(path, format!("bad cpu list entry `{token}`"));
        match token.split_once('-') {
            Some((lo, hi)) => {
                let lo: CoreId = lo.parse().map_err(|_| bad())?;
                let hi: CoreId = hi.parse().map_err(|_| bad())?;
                cpus.extend(lo..=hi);
            }
            None => cpus.push(token.parse().map_err(|_| bad())?),
        }
    }
    Ok(cpus)
}
