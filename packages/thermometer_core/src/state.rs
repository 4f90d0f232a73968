//! Shared device state
//!
//! The unit preference is the only mutable state of the peripheral. It is
//! read by every read response and notification tick and written only by
//! the unit characteristic's write handler.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::gatt::notify::WakeSignal;

/// Temperature unit selected by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UnitPreference {
    #[default]
    Celsius,
    Fahrenheit,
}

impl UnitPreference {
    /// ASCII tag carried on the wire: `b'C'` or `b'F'`.
    pub const fn ascii(self) -> u8 {
        match self {
            UnitPreference::Celsius => b'C',
            UnitPreference::Fahrenheit => b'F',
        }
    }

    /// Convert a Celsius value into this unit.
    pub fn convert_celsius(self, celsius: f64) -> f64 {
        match self {
            UnitPreference::Celsius => celsius,
            UnitPreference::Fahrenheit => celsius * 1.8 + 32.0,
        }
    }
}

impl fmt::Display for UnitPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitPreference::Celsius => f.write_str("C"),
            UnitPreference::Fahrenheit => f.write_str("F"),
        }
    }
}

/// Owner of the unit preference cell.
///
/// The cell is a single atomic byte so a concurrent reader sees either the
/// old or the new unit. Every committed change raises `unit_changed`, which
/// wakes all notification schedulers waiting on it.
#[derive(Debug)]
pub struct DeviceState {
    unit: AtomicU8,
    unit_changed: WakeSignal,
}

impl DeviceState {
    /// Fresh state; the unit always starts as Celsius.
    pub fn new() -> Self {
        Self {
            unit: AtomicU8::new(UnitPreference::Celsius.ascii()),
            unit_changed: WakeSignal::new(),
        }
    }

    pub fn unit(&self) -> UnitPreference {
        match self.unit.load(Ordering::SeqCst) {
            b'F' => UnitPreference::Fahrenheit,
            _ => UnitPreference::Celsius,
        }
    }

    /// Store `unit`. Returns `true` and wakes waiters only when the stored
    /// value actually changed.
    pub fn set_unit(&self, unit: UnitPreference) -> bool {
        let previous = self.unit.swap(unit.ascii(), Ordering::SeqCst);
        if previous == unit.ascii() {
            return false;
        }
        log::info!("Unit changed to {}", unit);
        self.unit_changed.raise();
        true
    }

    /// Signal raised after every committed unit change.
    pub fn unit_changed(&self) -> &WakeSignal {
        &self.unit_changed
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}
