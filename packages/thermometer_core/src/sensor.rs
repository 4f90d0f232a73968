//! Temperature sources
//!
//! The physical sensor is an opaque collaborator returning degrees Celsius.
//! `FallbackSensor` turns an unavailable reading into a random value from a
//! configured range so the GATT runtime always has something to encode.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::gatt::GattError;

/// Linux exposes the SoC temperature in millidegrees Celsius here.
pub const DEFAULT_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Something that can report a temperature in degrees Celsius.
pub trait TemperatureSource: Send + Sync {
    fn read_celsius(&self) -> Result<f64, GattError>;
}

/// Half-open `[low, high)` range for fallback readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackRange {
    pub low: f64,
    pub high: f64,
}

impl FallbackRange {
    pub const DEFAULT: FallbackRange = FallbackRange {
        low: 32.0,
        high: 52.0,
    };

    pub fn is_valid(&self) -> bool {
        self.low.is_finite() && self.high.is_finite() && self.low < self.high
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value < self.high
    }
}

impl Default for FallbackRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Reads a sysfs thermal zone file holding millidegrees as an integer.
#[derive(Debug, Clone)]
pub struct ThermalZoneSensor {
    path: PathBuf,
}

impl ThermalZoneSensor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for ThermalZoneSensor {
    fn default() -> Self {
        Self::new(DEFAULT_THERMAL_ZONE)
    }
}

impl TemperatureSource for ThermalZoneSensor {
    fn read_celsius(&self) -> Result<f64, GattError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            GattError::SensorUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let millidegrees: i64 = raw.trim().parse().map_err(|e| {
            GattError::SensorUnavailable(format!(
                "{} does not contain an integer: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(millidegrees as f64 / 1000.0)
    }
}

/// Never-failing wrapper: falls back to a uniform random value in `range`
/// when the inner source is unavailable.
pub struct FallbackSensor<S> {
    inner: S,
    range: FallbackRange,
}

impl<S: TemperatureSource> FallbackSensor<S> {
    /// Fails with `InvalidDefinition` unless `range` is finite and non-empty.
    pub fn new(inner: S, range: FallbackRange) -> Result<Self, GattError> {
        if !range.is_valid() {
            return Err(GattError::InvalidDefinition(format!(
                "fallback range must be finite with low < high, got {:?}",
                range
            )));
        }
        Ok(Self { inner, range })
    }

    pub fn celsius(&self) -> f64 {
        match self.inner.read_celsius() {
            Ok(value) => value,
            Err(e) => {
                let value = rand::thread_rng().gen_range(self.range.low..self.range.high);
                log::warn!("{}; using fallback reading {:.2}", e, value);
                value
            }
        }
    }
}

impl<S: TemperatureSource> TemperatureSource for FallbackSensor<S> {
    fn read_celsius(&self) -> Result<f64, GattError> {
        Ok(self.celsius())
    }
}

impl<S: fmt::Debug> fmt::Debug for FallbackSensor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackSensor")
            .field("inner", &self.inner)
            .field("range", &self.range)
            .finish()
    }
}

/// A settable reading, for tests and demos. `None` reads as unavailable.
#[derive(Debug, Default)]
pub struct FixedSensor {
    value: Mutex<Option<f64>>,
}

impl FixedSensor {
    pub fn new(celsius: f64) -> Self {
        Self {
            value: Mutex::new(Some(celsius)),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set(&self, celsius: Option<f64>) {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *value = celsius;
    }
}

impl TemperatureSource for FixedSensor {
    fn read_celsius(&self) -> Result<f64, GattError> {
        let value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        value.ok_or_else(|| GattError::SensorUnavailable("no reading set".to_string()))
    }
}

impl<T: TemperatureSource + ?Sized> TemperatureSource for std::sync::Arc<T> {
    fn read_celsius(&self) -> Result<f64, GattError> {
        (**self).read_celsius()
    }
}
