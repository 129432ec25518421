//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema (TOML file / env overrides).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NvheapConfigSpec {
    /// Root directory holding all backing files.
    pub root_dir: Option<PathBuf>,
    /// Log severity ("error", "warn", "info", "debug", "trace", "off").
    pub log: Option<String>,
    /// Epoch manager configuration.
    pub epoch: Option<EpochConfigSpec>,
}

/// Epoch manager configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpochConfigSpec {
    /// Interval between background epoch-advance ticks, in milliseconds.
    pub advance_interval_ms: Option<u64>,
}

impl NvheapConfigSpec {
    /// Load the schema from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load from the `NVHEAP_CONFIG` env var (if set), then apply
    /// `NVHEAP__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("NVHEAP_CONFIG").ok();
        let mut spec = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        spec.apply_env_overrides()?;
        Ok(spec)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("NVHEAP__") {
                continue;
            }
            let path = key["NVHEAP__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["root_dir"] => {
                    self.root_dir = Some(PathBuf::from(value));
                }
                ["log"] => {
                    self.log = Some(value);
                }
                ["epoch", "advance_interval_ms"] => {
                    self.epoch_mut().advance_interval_ms = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Resolve to a concrete configuration, filling in defaults.
    pub fn resolve(&self) -> NvheapConfig {
        let mut config = NvheapConfig::default();
        if let Some(root_dir) = &self.root_dir {
            config.root_dir = root_dir.clone();
        }
        if let Some(log) = &self.log {
            config.log = Some(log.clone());
        }
        if let Some(epoch) = &self.epoch {
            if let Some(ms) = epoch.advance_interval_ms {
                config.epoch_advance_interval = Duration::from_millis(ms.max(1));
            }
        }
        config
    }

    fn epoch_mut(&mut self) -> &mut EpochConfigSpec {
        if self.epoch.is_none() {
            self.epoch = Some(EpochConfigSpec::default());
        }
        self.epoch.as_mut().expect("epoch config")
    }
}

/// Resolved configuration used by heaps and the epoch manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvheapConfig {
    /// Root directory holding every backing file of this store.
    pub root_dir: PathBuf,
    /// Log severity, if configured.
    pub log: Option<String>,
    /// Interval between background epoch-advance ticks.
    pub epoch_advance_interval: Duration,
}

impl Default for NvheapConfig {
    fn default() -> Self {
        Self {
            root_dir: env::temp_dir().join("nvheap"),
            log: None,
            epoch_advance_interval: Duration::from_secs(1),
        }
    }
}

impl NvheapConfig {
    /// Load the configuration from `NVHEAP_CONFIG` and env overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        Ok(NvheapConfigSpec::load_from_env()?.resolve())
    }

    /// Construct a configuration rooted at `root_dir` with defaults.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }
}

/// Install a global `tracing` subscriber honoring the configured severity.
///
/// A no-op if a subscriber is already installed. Severity strings follow
/// `tracing` conventions; unparseable strings fall back to "error".
pub fn init_log(severity: &str) {
    use tracing_subscriber::filter::LevelFilter;

    let level: LevelFilter = severity.parse().unwrap_or(LevelFilter::ERROR);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
