//! Configuration management
//!
//! Handles TOML configuration parsing and validation. Every field has a
//! default so an empty or partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_AUDIT_PIPE, POLLING_INTERVAL_MAX, POLLING_INTERVAL_MIN, RECEIVE_TIMEOUT_MAX_MS,
    RECEIVE_TIMEOUT_MIN_MS, SIGNING_TIMEOUT_MAX,
};
use crate::models::EnrichmentMode;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Note: bounds must match POLLING_INTERVAL_MIN/MAX in constants.rs
    #[error("Invalid polling interval: {0}. Must be between 0.1 and 300.0 seconds")]
    InvalidInterval(f64),

    #[error("Invalid receive timeout: {0}ms. Must be between 10 and 5000 milliseconds")]
    InvalidReceiveTimeout(u64),

    #[error("Invalid signing timeout: {0}. Must be greater than 0 and at most 300 seconds")]
    InvalidSigningTimeout(f64),

    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main procinfo configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcInfoConfig {
    pub monitor: MonitorSettings,
    pub signing: SigningSettings,
    pub binary: BinarySettings,
}

/// Which kernel feed drives monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Diff process-table snapshots
    #[default]
    Polling,
    /// BSM records from the audit pipe (root only)
    AuditPipe,
    /// Events injected by the embedding application
    Channel,
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(SourceKind::Polling),
            "audit-pipe" => Ok(SourceKind::AuditPipe),
            "channel" => Ok(SourceKind::Channel),
            other => Err(format!("unknown event source '{}'", other)),
        }
    }
}

/// Event stream settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Enrichment mode used when none is given explicitly
    pub mode: EnrichmentMode,
    pub source: SourceKind,
    /// Polling interval in seconds (0.1-300.0)
    pub polling_interval: f64,
    /// Upper bound on a single blocking receive, so stop() stays responsive
    pub receive_timeout_ms: u64,
    pub audit_pipe_path: PathBuf,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            mode: EnrichmentMode::default(),
            source: SourceKind::default(),
            polling_interval: 1.0,
            receive_timeout_ms: 200,
            audit_pipe_path: PathBuf::from(DEFAULT_AUDIT_PIPE),
        }
    }
}

/// Code-signing evaluation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    pub timeout_secs: f64,
    /// 0 disables the signature cache
    pub cache_ttl_secs: u64,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            cache_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarySettings {
    /// Attach Spotlight attributes in full mode
    pub spotlight_metadata: bool,
}

impl ProcInfoConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ProcInfoConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::load_from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.monitor.polling_interval;
        if !(POLLING_INTERVAL_MIN..=POLLING_INTERVAL_MAX).contains(&interval) {
            return Err(ConfigError::InvalidInterval(interval));
        }

        let receive = self.monitor.receive_timeout_ms;
        if !(RECEIVE_TIMEOUT_MIN_MS..=RECEIVE_TIMEOUT_MAX_MS).contains(&receive) {
            return Err(ConfigError::InvalidReceiveTimeout(receive));
        }

        let signing = self.signing.timeout_secs;
        if !(signing > 0.0 && signing <= SIGNING_TIMEOUT_MAX) {
            return Err(ConfigError::InvalidSigningTimeout(signing));
        }

        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor.polling_interval)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.receive_timeout_ms)
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.signing.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.signing.cache_ttl_secs)
    }
}

/// `<config_dir>/procinfo/config.toml`, when the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("procinfo").join("config.toml"))
}
