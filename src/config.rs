use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::client::cache::DEFAULT_MIN_STATS_INTERVAL_MS;
use crate::server::activity::{DEFAULT_ACTIVITY_INTERVAL, DEFAULT_SUCCESS_RATE};
use crate::server::trust::DEFAULT_TRUST_TTL_MS;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/telemd.sock";
pub const DEFAULT_CAPABILITY: &str = "telemd.permission.ACCESS_ANALYTICS";
pub const SOCKET_ENV: &str = "TELEMD_SOCKET";

/// Daemon-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    /// Name of the grant every caller must hold.
    pub capability: String,
    /// Uids holding `capability`.
    pub granted_uids: Vec<u32>,
    /// Treat every local uid as holding the capability. The identity check still applies.
    pub grant_all_local: bool,
    pub trust_ttl_ms: u64,
    pub metrics_interval_ms: u64,
    pub activity_interval_ms: u64,
    /// Probability that a simulated transaction succeeds.
    pub success_rate: f64,
    /// Permission bits applied to the socket file.
    pub socket_mode: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            capability: DEFAULT_CAPABILITY.to_string(),
            granted_uids: Vec::new(),
            grant_all_local: false,
            trust_ttl_ms: DEFAULT_TRUST_TTL_MS,
            metrics_interval_ms: 5_000,
            activity_interval_ms: DEFAULT_ACTIVITY_INTERVAL.as_millis() as u64,
            success_rate: DEFAULT_SUCCESS_RATE,
            socket_mode: 0o600,
        }
    }
}

/// Client-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Minimum spacing between real `get_current_stats` round trips.
    pub min_stats_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout_ms: 2_000,
            call_timeout_ms: 5_000,
            min_stats_interval_ms: DEFAULT_MIN_STATS_INTERVAL_MS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("success_rate must be within [0, 1], got {0}")]
    SuccessRate(f64),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(path: Option<&Path>) -> Result<T, ConfigError> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn socket_override() -> Option<PathBuf> {
    std::env::var_os(SOCKET_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

impl ServiceConfig {
    /// Defaults, then the optional JSON file, then `TELEMD_SOCKET`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = read_json(path)?;
        if let Some(socket) = socket_override() {
            config.socket_path = socket;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(ConfigError::SuccessRate(self.success_rate));
        }
        if self.activity_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("activity_interval_ms"));
        }
        if self.metrics_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("metrics_interval_ms"));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = read_json(path)?;
        if let Some(socket) = socket_override() {
            config.socket_path = socket;
        }
        Ok(config)
    }
}
