//! Bridge configuration.
//!
//! Loaded from YAML. Every field has a default, so an absent file and an
//! empty file both yield [`BridgeConfig::default`].
//!
//! ```yaml
//! link: /run/nmea-bridge
//! group: dialout
//! modem: 0
//! consumer:
//!   service: gpsd.service
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::SourceId;

/// Config file consulted when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nmea-bridge.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Fixed path the consumer opens; a symlink to the PTY slave.
    pub link: PathBuf,
    /// Group that gets read-write access to the PTY slave.
    pub group: String,
    /// Owner of the PTY slave.
    pub owner_uid: u32,
    /// Pin the bridge to one modem index instead of discovering.
    pub modem: Option<u32>,
    pub poll_interval_ms: u64,
    pub bind_attempts: u32,
    pub bind_retry_secs: u64,
    /// Delay between an add-notification and the first setup call.
    pub bind_head_start_secs: u64,
    /// Re-enumeration period while nothing is bound. `0` disables it.
    pub rescan_interval_secs: u64,
    /// Forward `Location` property changes as they arrive, on top of polling.
    pub property_signals: bool,
    pub consumer: ConsumerConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            link: PathBuf::from("/run/nmea-bridge"),
            group: "dialout".to_string(),
            owner_uid: 0,
            modem: None,
            poll_interval_ms: 1000,
            bind_attempts: 10,
            bind_retry_secs: 2,
            bind_head_start_secs: 3,
            rescan_interval_secs: 15,
            property_signals: true,
            consumer: ConsumerConfig::default(),
        }
    }
}

/// How the bridge hands its device to gpsd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    pub enabled: bool,
    pub service: String,
    pub systemctl: PathBuf,
    pub gpsdctl: PathBuf,
    pub attempts: u32,
    pub retry_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service: "gpsd.service".to_string(),
            systemctl: PathBuf::from("systemctl"),
            gpsdctl: PathBuf::from("gpsdctl"),
            attempts: 10,
            retry_secs: 1,
        }
    }
}

impl BridgeConfig {
    /// Loads `explicit` if given (it must exist), otherwise
    /// [`DEFAULT_CONFIG_PATH`] if it exists, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => Self::load_or_default_at(Path::new(DEFAULT_CONFIG_PATH)),
        }
    }

    /// Loads and validates the file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &raw)
    }

    /// Like [`BridgeConfig::load_from`], but a missing file yields defaults.
    pub fn load_or_default_at(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::parse(path, &raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        // serde_yaml rejects an empty document for a struct; treat it as `{}`.
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.link.is_absolute() {
            return Err(invalid("link", format!("{} is not absolute", self.link.display())));
        }
        if self.group.trim().is_empty() {
            return Err(invalid("group", "must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be greater than zero"));
        }
        if self.bind_attempts == 0 {
            return Err(invalid("bind_attempts", "must be greater than zero"));
        }
        if self.consumer.attempts == 0 {
            return Err(invalid("consumer.attempts", "must be greater than zero"));
        }
        Ok(())
    }

    /// Identity to bind without discovery, if pinned.
    pub fn pinned_source(&self) -> Option<SourceId> {
        self.modem.map(SourceId::from_modem_index)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_secs(self.bind_retry_secs)
    }

    pub fn bind_head_start(&self) -> Duration {
        Duration::from_secs(self.bind_head_start_secs)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }
}

impl ConsumerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
