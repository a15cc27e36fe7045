//! Serializable snapshot of the whole governor, for the daemon's status file.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::boost::BoostSnapshot;
use crate::freq_table::FreqLimits;
use crate::governor::Governor;
use crate::platform::{CoreId, DomainId, Platform};
use crate::sampler::CoreState;
use crate::tunables::TunableConfig;

#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub tunables: TunableConfig,
    pub boost: BoostSnapshot,
    pub domains: Vec<DomainStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub id: DomainId,
    pub limits: FreqLimits,
    pub cur: u32,
    pub available: Vec<u32>,
    pub cores: Vec<CoreStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub id: CoreId,
    #[serde(flatten)]
    pub state: CoreState,
}

impl DomainStatus {
    /// Highest target among the enabled members.
    pub fn max_target(&self) -> Option<u32> {
        self.cores
            .iter()
            .filter(|c| c.state.enabled)
            .map(|c| c.state.target_freq)
            .max()
    }
}

impl<P: Platform> Governor<P> {
    pub fn status(&self) -> GovernorStatus {
        let shared = self.shared();
        let domains = shared
            .clusters
            .iter()
            .map(|cluster| DomainStatus {
                id: cluster.id,
                limits: cluster.limits(),
                cur: cluster.cur(),
                available: cluster.table.as_slice().to_vec(),
                cores: cluster
                    .cores
                    .iter()
                    .map(|&id| CoreStatus {
                        id,
                        state: shared.slots[id].snapshot(),
                    })
                    .collect(),
            })
            .collect();
        GovernorStatus {
            tunables: TunableConfig::clone(&self.tunables()),
            boost: self.boost(),
            domains,
        }
    }
}

/// `<runtime dir or cache dir>/impulse-governor/status.json`.
pub fn default_status_path() -> PathBuf {
    let mut path = dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    path.push("impulse-governor");
    path.push("status.json");
    path
}

pub fn write_status(path: &Path, status: &GovernorStatus) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(status)?;
    std::fs::write(path, json)
}
