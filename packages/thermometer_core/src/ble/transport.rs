//! BLE transport trait definitions and core types
//!
//! Defines the abstract peripheral interface that both the simulated
//! transport and a real HCI-backed stack conform to. The transport owns
//! radio control, connections and subscription bookkeeping; the GATT
//! runtime only sees the events and sinks defined here.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::BleError;

/// Default ATT MTU before any exchange-MTU procedure.
pub const DEFAULT_ATT_MTU: usize = 23;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(bytes) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[5], bytes[4], bytes[3], bytes[2], bytes[1], bytes[0]
            ),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// ATT protocol error code returned to the peer in place of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttError(pub u8);

impl AttError {
    pub const READ_NOT_PERMITTED: AttError = AttError(0x02);
    pub const WRITE_NOT_PERMITTED: AttError = AttError(0x03);
    pub const ATTRIBUTE_NOT_FOUND: AttError = AttError(0x0A);
    pub const UNLIKELY_ERROR: AttError = AttError(0x0E);
}

impl fmt::Display for AttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ATT error 0x{:02X}", self.0)
    }
}

/// Destination for the bytes of a single read response.
///
/// Read handlers run synchronously on the transport's dispatch context and
/// must never block on network I/O, so the sink is a plain buffer-like write.
pub trait ResponseSink {
    fn write(&mut self, data: &[u8]) -> Result<(), BleError>;
}

impl ResponseSink for Vec<u8> {
    fn write(&mut self, data: &[u8]) -> Result<(), BleError> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// A read response buffer bounded by the connection's ATT MTU.
#[derive(Debug, Clone)]
pub struct ReadResponse {
    buf: Vec<u8>,
    limit: usize,
}

impl ReadResponse {
    /// A read response carries at most `mtu - 1` value bytes.
    pub fn for_mtu(mtu: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit: mtu.saturating_sub(1),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl ResponseSink for ReadResponse {
    fn write(&mut self, data: &[u8]) -> Result<(), BleError> {
        let size = self.buf.len() + data.len();
        if size > self.limit {
            return Err(BleError::MtuExceeded {
                size,
                mtu: self.limit,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }
}

/// Push channel to one subscribed peer for one characteristic.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a notification carrying `data` to the peer.
    async fn notify(&self, data: &[u8]) -> Result<(), BleError>;

    /// Whether the peer is still connected and subscribed.
    fn is_subscribed(&self) -> bool;

    /// Get the peer's BLE address.
    fn peer_address(&self) -> &BleAddress;
}

/// Reply channel for a characteristic or descriptor read.
pub type ReadResponder = oneshot::Sender<Result<Vec<u8>, AttError>>;

/// Reply channel for a characteristic or descriptor write.
pub type WriteResponder = oneshot::Sender<Result<(), AttError>>;

/// Events delivered by the transport to the GATT runtime.
pub enum PeripheralEvent {
    /// The radio changed power state.
    PowerStateChanged { powered_on: bool },
    /// A central connected.
    Connected { peer: BleAddress },
    /// A central disconnected; all its subscriptions are gone.
    Disconnected { peer: BleAddress },
    /// Read request for a characteristic value.
    ReadRequest {
        peer: BleAddress,
        characteristic: Uuid,
        responder: ReadResponder,
    },
    /// Read request for a descriptor value.
    ReadDescriptorRequest {
        peer: BleAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        responder: ReadResponder,
    },
    /// Write request for a characteristic value.
    WriteRequest {
        peer: BleAddress,
        characteristic: Uuid,
        value: Vec<u8>,
        responder: WriteResponder,
    },
    /// Write request for a descriptor value.
    WriteDescriptorRequest {
        peer: BleAddress,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
        responder: WriteResponder,
    },
    /// The peer enabled notifications.
    Subscribe {
        characteristic: Uuid,
        notifier: Arc<dyn Notifier>,
    },
    /// The peer disabled notifications.
    Unsubscribe {
        peer: BleAddress,
        characteristic: Uuid,
    },
}

impl fmt::Debug for PeripheralEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralEvent::PowerStateChanged { powered_on } => f
                .debug_struct("PowerStateChanged")
                .field("powered_on", powered_on)
                .finish(),
            PeripheralEvent::Connected { peer } => {
                f.debug_struct("Connected").field("peer", peer).finish()
            }
            PeripheralEvent::Disconnected { peer } => {
                f.debug_struct("Disconnected").field("peer", peer).finish()
            }
            PeripheralEvent::ReadRequest {
                peer,
                characteristic,
                ..
            } => f
                .debug_struct("ReadRequest")
                .field("peer", peer)
                .field("characteristic", characteristic)
                .finish(),
            PeripheralEvent::ReadDescriptorRequest {
                peer,
                characteristic,
                descriptor,
                ..
            } => f
                .debug_struct("ReadDescriptorRequest")
                .field("peer", peer)
                .field("characteristic", characteristic)
                .field("descriptor", descriptor)
                .finish(),
            PeripheralEvent::WriteRequest {
                peer,
                characteristic,
                value,
                ..
            } => f
                .debug_struct("WriteRequest")
                .field("peer", peer)
                .field("characteristic", characteristic)
                .field("value", &hex::encode(value))
                .finish(),
            PeripheralEvent::WriteDescriptorRequest {
                peer,
                characteristic,
                descriptor,
                value,
                ..
            } => f
                .debug_struct("WriteDescriptorRequest")
                .field("peer", peer)
                .field("characteristic", characteristic)
                .field("descriptor", descriptor)
                .field("value", &hex::encode(value))
                .finish(),
            PeripheralEvent::Subscribe {
                characteristic,
                notifier,
            } => f
                .debug_struct("Subscribe")
                .field("peer", notifier.peer_address())
                .field("characteristic", characteristic)
                .finish(),
            PeripheralEvent::Unsubscribe {
                peer,
                characteristic,
            } => f
                .debug_struct("Unsubscribe")
                .field("peer", peer)
                .field("characteristic", characteristic)
                .finish(),
        }
    }
}

/// BLE peripheral role: advertising and delivering GATT requests.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Start advertising with the given legacy advertising data.
    async fn start_advertising(&self, data: Vec<u8>) -> Result<(), BleError>;

    /// Stop advertising.
    async fn stop_advertising(&self) -> Result<(), BleError>;

    /// Wait for the next event from the stack. `None` once the transport
    /// has shut down.
    async fn next_event(&self) -> Option<PeripheralEvent>;
}
