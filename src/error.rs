use std::io::Error as IoError;

use crate::platform::{CoreId, DomainId};

/// Errors surfaced to callers of the governor API.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error("invalid table: {0}")]
    InvalidTable(String),
    #[error("invalid value for {name}: {reason}")]
    InvalidTunable { name: &'static str, reason: String },
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
    #[error("core {0} is not part of any frequency domain")]
    UnknownCore(CoreId),
    #[error("core {core} exceeds the supported maximum of {max} cores")]
    CoreOutOfRange { core: CoreId, max: usize },
    #[error("failed to spawn the speed-change worker: {0}")]
    WorkerSpawn(#[source] IoError),
    #[error("config: {0}")]
    Config(String),
    #[error("platform: {0}")]
    Platform(#[from] PlatformError),
    #[error("I/O: {0}")]
    Io(#[from] IoError),
    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors reported by a [`Platform`](crate::platform::Platform) backend.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("I/O: {0}")]
    Io(#[from] IoError),
    #[error("malformed {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("unknown frequency domain {0}")]
    UnknownDomain(DomainId),
    #[error("frequency change rejected: {0}")]
    Rejected(String),
}

/// Frequency table lookups that found no entry inside the policy limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no suitable frequency within the policy limits")]
    NoSuitableFrequency,
}
