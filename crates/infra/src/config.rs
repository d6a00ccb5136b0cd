//! Configuration loading and representation.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `SIMBRIDGE_*` environment variables. The merged result is validated once.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use simbridge_audit::store::RetentionMode;

use crate::jobs::scheduler::SchedulerConfig;
use crate::jobs::types::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub backoff: BackoffSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            default_timeout_seconds: 3600,
            default_max_retries: 2,
            backoff: BackoffSettings::default(),
        }
    }
}

impl SchedulerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            default_timeout_seconds: self.default_timeout_seconds,
            default_max_retries: self.default_max_retries,
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(self.backoff.base_delay_ms),
                max_delay: Duration::from_millis(self.backoff.max_delay_ms),
                strategy: self.backoff.strategy,
                jitter: self.backoff.jitter,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub backend: RegistryBackend,
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Sqlite,
            path: PathBuf::from("data/jobs.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    /// Daily NDJSON files
    #[default]
    Local,
    /// One immutable object per event
    Object,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub backend: AuditBackend,
    /// Directory for local files, or object store root
    pub path: PathBuf,
    pub object_prefix: String,
    /// Object retention lock; unset means no lock
    pub retention_mode: Option<RetentionMode>,
    pub retention_days: u32,
    pub verify_lookback_days: u32,
    pub verify_interval_seconds: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Local,
            path: PathBuf::from("data/audit"),
            object_prefix: "audit".to_string(),
            retention_mode: None,
            retention_days: 0,
            verify_lookback_days: 7,
            verify_interval_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    pub path: PathBuf,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/artifacts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            retention_seconds: 7 * 24 * 3600,
            sweep_interval_seconds: 300,
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub scheduler: SchedulerSettings,
    pub registry: RegistrySettings,
    pub audit: AuditSettings,
    pub artifacts: ArtifactSettings,
    pub retention: RetentionSettings,
}

impl BridgeConfig {
    /// Load from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |var| std::env::var(var).ok())
    }

    /// Like [`BridgeConfig::load`] with an explicit variable lookup.
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `SIMBRIDGE_*` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            lookup(var)
                .map(|value| {
                    value
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv { var, value })
                })
                .transpose()
        }

        if let Some(v) = parsed(&lookup, "SIMBRIDGE_WORKERS")? {
            self.scheduler.workers = v;
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_DEFAULT_TIMEOUT_SECONDS")? {
            self.scheduler.default_timeout_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_DEFAULT_MAX_RETRIES")? {
            self.scheduler.default_max_retries = v;
        }
        if let Some(value) = lookup("SIMBRIDGE_REGISTRY_BACKEND") {
            self.registry.backend = match value.trim().to_ascii_lowercase().as_str() {
                "sqlite" => RegistryBackend::Sqlite,
                "memory" => RegistryBackend::Memory,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "SIMBRIDGE_REGISTRY_BACKEND",
                        value,
                    });
                }
            };
        }
        if let Some(v) = lookup("SIMBRIDGE_REGISTRY_PATH") {
            self.registry.path = PathBuf::from(v);
        }
        if let Some(value) = lookup("SIMBRIDGE_AUDIT_BACKEND") {
            self.audit.backend = match value.trim().to_ascii_lowercase().as_str() {
                "local" => AuditBackend::Local,
                "object" => AuditBackend::Object,
                "memory" => AuditBackend::Memory,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "SIMBRIDGE_AUDIT_BACKEND",
                        value,
                    });
                }
            };
        }
        if let Some(v) = lookup("SIMBRIDGE_AUDIT_PATH") {
            self.audit.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIMBRIDGE_AUDIT_OBJECT_PREFIX") {
            self.audit.object_prefix = v;
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_AUDIT_RETENTION_MODE")? {
            self.audit.retention_mode = Some(v);
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_AUDIT_RETENTION_DAYS")? {
            self.audit.retention_days = v;
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_VERIFY_LOOKBACK_DAYS")? {
            self.audit.verify_lookback_days = v;
        }
        if let Some(v) = lookup("SIMBRIDGE_ARTIFACT_PATH") {
            self.artifacts.path = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_RETENTION_SECONDS")? {
            self.retention.retention_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "SIMBRIDGE_SWEEP_INTERVAL_SECONDS")? {
            self.retention.sweep_interval_seconds = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.scheduler.workers == 0 {
            return invalid("scheduler.workers must be at least 1");
        }
        if self.scheduler.default_timeout_seconds == 0 {
            return invalid("scheduler.default_timeout_seconds must be positive");
        }
        if !(0.0..=1.0).contains(&self.scheduler.backoff.jitter) {
            return invalid("scheduler.backoff.jitter must be within 0.0..=1.0");
        }
        if self.scheduler.backoff.max_delay_ms < self.scheduler.backoff.base_delay_ms {
            return invalid("scheduler.backoff.max_delay_ms must not be below base_delay_ms");
        }
        if self.audit.retention_mode.is_some() && self.audit.retention_days == 0 {
            return invalid("audit.retention_days must be positive when a retention mode is set");
        }
        if self.audit.retention_mode.is_some() && self.audit.backend != AuditBackend::Object {
            return invalid("audit.retention_mode only applies to the object backend");
        }
        if self.audit.object_prefix.trim_matches('/').is_empty() {
            return invalid("audit.object_prefix must not be empty");
        }
        if self.audit.verify_interval_seconds == 0 {
            return invalid("audit.verify_interval_seconds must be positive");
        }
        if self.retention.sweep_interval_seconds == 0 {
            return invalid("retention.sweep_interval_seconds must be positive");
        }
        Ok(())
    }
}
