//! BLE transport layer for the thermometer peripheral
//!
//! Provides the transport traits the GATT runtime is driven through, an
//! in-process simulated transport for testing, and legacy advertising
//! payload construction.

pub mod advertising;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Advertising payload too large ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Payload exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Peer is not subscribed")]
    NotSubscribed,

    #[error("Request rejected with {0}")]
    Rejected(transport::AttError),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
