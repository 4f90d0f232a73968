//! Device configuration
//!
//! Loaded from a JSON file at startup. Every field has a default so a
//! partial file (or no file at all) is valid.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::transport::DEFAULT_ATT_MTU;
use crate::sensor::{FallbackRange, DEFAULT_THERMAL_ZONE};

/// GAP appearance 0x0540: generic sensor.
pub const APPEARANCE_GENERIC_SENSOR: u16 = 0x0540;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// GAP device name, also used as the advertised local name.
    pub device_name: String,
    /// GAP appearance code.
    pub appearance: u16,
    /// Cadence of temperature notifications.
    pub notify_interval_ms: u64,
    /// Millidegree Celsius file backing the temperature sensor.
    pub sensor_path: PathBuf,
    /// Range for readings substituted when the sensor is unavailable.
    pub fallback_range: FallbackRange,
    pub att_mtu: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "Thermometer".to_string(),
            appearance: APPEARANCE_GENERIC_SENSOR,
            notify_interval_ms: 2000,
            sensor_path: PathBuf::from(DEFAULT_THERMAL_ZONE),
            fallback_range: FallbackRange::DEFAULT,
            att_mtu: DEFAULT_ATT_MTU,
        }
    }
}

impl DeviceConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Invalid("device_name must not be empty".into()));
        }
        if self.notify_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "notify_interval_ms must be greater than zero".into(),
            ));
        }
        if !self.fallback_range.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "fallback_range must be finite with low < high, got {:?}",
                self.fallback_range
            )));
        }
        if self.att_mtu < DEFAULT_ATT_MTU {
            return Err(ConfigError::Invalid(format!(
                "att_mtu must be at least {}, got {}",
                DEFAULT_ATT_MTU, self.att_mtu
            )));
        }
        Ok(())
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }
}
