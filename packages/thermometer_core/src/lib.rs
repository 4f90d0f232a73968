// Thermometer - BLE GATT temperature peripheral

pub mod ble;
pub mod config;
pub mod device;
pub mod gatt;
pub mod sensor;
pub mod services;
pub mod state;

pub use config::{ConfigError, DeviceConfig};
pub use device::{DeviceError, ThermometerDevice};
pub use gatt::GattError;
pub use sensor::{FallbackRange, FixedSensor, TemperatureSource, ThermalZoneSensor};
pub use state::{DeviceState, UnitPreference};
