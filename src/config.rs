use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from clearx.toml.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppInfoConfig,
    pub instance: InstanceConfig,
    pub control: ControlConfig,
    pub log: LogConfig,
    pub database: DatabaseConfig,
}

/// Identity strings shown in the banner and used to name the instance lock.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppInfoConfig {
    pub name: String,
    pub version: String,
    pub developer: String,
    pub company: String,
    pub copyright: String,
    pub homepage: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Directory holding `<name>.lock`.
    pub lock_dir: PathBuf,
    /// How long a duplicate instance waits before leaving, so its warning flushes.
    pub duplicate_exit_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter; `RUST_LOG`, `--verbose` and `--quiet` take precedence.
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections_per_host: usize,
    /// Logical host name to SQLite database path.
    pub hosts: BTreeMap<String, PathBuf>,
}

// --- Default implementations ---

impl Default for AppInfoConfig {
    fn default() -> Self {
        Self {
            name: "ClearX".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            developer: "Developed by the X-Lab.".to_string(),
            company: "X-Lab (Shanghai) Co., Ltd.".to_string(),
            copyright: "Copyright 2018-2018 X-Lab All Rights Reserved.".to_string(),
            homepage: "http://www.xlab.com".to_string(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            lock_dir: std::env::temp_dir(),
            duplicate_exit_delay_ms: 1000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 4,
            hosts: BTreeMap::new(),
        }
    }
}

impl InstanceConfig {
    pub fn duplicate_exit_delay(&self) -> Duration {
        Duration::from_millis(self.duplicate_exit_delay_ms)
    }
}

impl ControlConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl AppConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config = Self::from_toml_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Check values that would make the control shell misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.app.name;
        if name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "app.name",
                reason: "must not be empty".to_string(),
            });
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ConfigError::Invalid {
                field: "app.name",
                reason: format!("{name:?} cannot be used as a lock name"),
            });
        }
        if self.control.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "control.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.database.max_connections_per_host == 0 && !self.database.hosts.is_empty() {
            return Err(ConfigError::Invalid {
                field: "database.max_connections_per_host",
                reason: "must be greater than zero when hosts are configured".to_string(),
            });
        }
        Ok(())
    }
}
