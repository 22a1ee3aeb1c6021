//! Error taxonomy shared by every tier and by the orchestration layers.

use thiserror::Error;

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Operation-level errors. Tier errors propagate unchanged through
/// [`crate::union::UnionView`]; only `ConfigError` is fatal to the process.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("insufficient space: writing {needed} bytes would leave {free} free, floor is {floor}")]
    InsufficientSpace { needed: u64, free: u64, floor: u64 },

    #[error("cross-tier rename unsupported: {from} -> {to}")]
    CrossTierRenameUnsupported { from: String, to: String },

    #[error("tier not ready: {0}")]
    NotReady(String),

    #[error("remote tier is read-only through the union view: {0}")]
    RemoteReadOnly(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Transient failures worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FsError::RemoteUnavailable(_) | FsError::QuotaExceeded(_)
        )
    }
}

/// Startup configuration failures. These abort the process before the serve
/// loop is entered.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("cannot read remote config {path}: {source}")]
    RemoteConfig {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed remote config {path}: {source}")]
    RemoteConfigFormat {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
