//! GATT service runtime
//!
//! Service and characteristic definitions, the read/write/notify dispatch
//! contract, the per-subscription notification scheduler and the wire codec
//! for temperature readings.

pub mod characteristic;
pub mod codec;
pub mod notify;
pub mod server;
pub mod service;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::ble::transport::AttError;
use crate::ble::BleError;

pub use characteristic::{
    Characteristic, Descriptor, NotifyHandler, PresentationFormat, Properties, WriteStatus,
};
pub use notify::{SchedulerReport, SchedulerState, StopReason, SubscriptionHandle, WakeSignal};
pub use server::{GattServer, SubscriptionOutcome};
pub use service::{define_service, Service, ServiceRegistry};

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;
const UUID16_MASK: u128 = 0xFFFF_FFFF_0000_0000_0000_0000_0000_0000;

/// Expand a 16-bit SIG-assigned identifier onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// The 16-bit form of `uuid`, if it lies on the Bluetooth base UUID.
pub fn as_uuid16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !UUID16_MASK != BLUETOOTH_BASE_UUID || value >> 112 != 0 {
        return None;
    }
    Some((value >> 96) as u16)
}

/// The kind of request a characteristic is asked to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Notify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => f.write_str("read"),
            Operation::Write => f.write_str("write"),
            Operation::Notify => f.write_str("notify"),
        }
    }
}

/// Errors raised by the GATT runtime.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GattError {
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Reading {value} does not fit a signed 16-bit value once scaled by 100")]
    EncodingOverflow { value: f64 },

    #[error("Sink write failed: {0}")]
    SinkWriteFailed(#[from] BleError),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),

    #[error("Unknown descriptor {descriptor} on characteristic {characteristic}")]
    UnknownDescriptor { characteristic: Uuid, descriptor: Uuid },

    #[error("Characteristic {characteristic} does not permit {operation}")]
    NotPermitted {
        operation: Operation,
        characteristic: Uuid,
    },

    #[error("Notification scheduler aborted: {0}")]
    SchedulerAborted(String),
}

impl GattError {
    /// The ATT status reported to the peer for a failed request.
    pub fn att_error(&self) -> AttError {
        match self {
            GattError::UnknownCharacteristic(_) | GattError::UnknownDescriptor { .. } => {
                AttError::ATTRIBUTE_NOT_FOUND
            }
            GattError::NotPermitted {
                operation: Operation::Read,
                ..
            } => AttError::READ_NOT_PERMITTED,
            GattError::NotPermitted {
                operation: Operation::Write,
                ..
            } => AttError::WRITE_NOT_PERMITTED,
            _ => AttError::UNLIKELY_ERROR,
        }
    }
}
