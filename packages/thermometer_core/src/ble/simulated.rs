//! In-process BLE simulator
//!
//! Provides a simulated BLE network where a peripheral can advertise and
//! centrals can connect, read, write and subscribe entirely in-process.
//! Used for integration testing without requiring real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use uuid::Uuid;

use super::advertising::MAX_LEGACY_ADV_LEN;
use super::transport::{BleAddress, BlePeripheral, Notifier, PeripheralEvent, DEFAULT_ATT_MTU};
use super::BleError;

/// ATT notification header: opcode plus attribute handle.
const NOTIFICATION_HEADER_LEN: usize = 3;

/// An advertisement as seen on the simulated air.
#[derive(Debug, Clone)]
pub struct SimAdvertisement {
    pub data: Vec<u8>,
    pub source_address: BleAddress,
}

#[derive(Clone)]
struct PeripheralLink {
    events: mpsc::UnboundedSender<PeripheralEvent>,
    att_mtu: usize,
}

/// The simulated "air" shared by a peripheral and its centrals.
pub struct SimBleNetwork {
    /// Broadcast channel for advertisements.
    adv_tx: broadcast::Sender<SimAdvertisement>,
    /// Peripherals currently advertising, and therefore connectable.
    peripherals: Mutex<HashMap<BleAddress, PeripheralLink>>,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            adv_tx,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Create a peripheral on this network. It is powered off until
    /// [`SimPeripheral::power_on`] is called.
    pub fn create_peripheral(self: &Arc<Self>) -> SimPeripheral {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        SimPeripheral {
            address: BleAddress::Simulated(Uuid::new_v4()),
            network: Arc::clone(self),
            att_mtu: DEFAULT_ATT_MTU,
            events_tx,
            events_rx: Mutex::new(events_rx),
            advertising: Mutex::new(None),
        }
    }

    /// Receive every advertisement broadcast from now on.
    pub fn advertisements(&self) -> broadcast::Receiver<SimAdvertisement> {
        self.adv_tx.subscribe()
    }

    /// Connect a new central to an advertising peripheral.
    pub async fn connect(&self, address: &BleAddress) -> Result<SimCentral, BleError> {
        let link = {
            let peripherals = self.peripherals.lock().await;
            peripherals.get(address).cloned().ok_or_else(|| {
                BleError::ConnectionError(format!("No advertising peripheral at {}", address))
            })?
        };

        let central = SimCentral {
            address: BleAddress::Simulated(Uuid::new_v4()),
            link,
            connected: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(AtomicBool::new(false)),
            subscriptions: Mutex::new(HashMap::new()),
        };
        central.send(PeripheralEvent::Connected {
            peer: central.address.clone(),
        })?;
        Ok(central)
    }
}

/// A simulated peripheral: radio power, advertising, and the event queue
/// the GATT runtime drains.
pub struct SimPeripheral {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
    att_mtu: usize,
    events_tx: mpsc::UnboundedSender<PeripheralEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<PeripheralEvent>>,
    advertising: Mutex<Option<Vec<u8>>>,
}

impl SimPeripheral {
    /// Get this peripheral's BLE address.
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    /// Set the ATT MTU negotiated with centrals that connect later.
    pub fn set_att_mtu(&mut self, att_mtu: usize) {
        self.att_mtu = att_mtu;
    }

    pub fn att_mtu(&self) -> usize {
        self.att_mtu
    }

    pub fn power_on(&self) {
        let _ = self
            .events_tx
            .send(PeripheralEvent::PowerStateChanged { powered_on: true });
    }

    pub fn power_off(&self) {
        let _ = self
            .events_tx
            .send(PeripheralEvent::PowerStateChanged { powered_on: false });
    }

    /// The advertising data currently on air, if advertising.
    pub async fn advertising_data(&self) -> Option<Vec<u8>> {
        self.advertising.lock().await.clone()
    }
}

#[async_trait]
impl BlePeripheral for SimPeripheral {
    async fn start_advertising(&self, data: Vec<u8>) -> Result<(), BleError> {
        if data.len() > MAX_LEGACY_ADV_LEN {
            return Err(BleError::AdvertisingError(format!(
                "controller rejected {} bytes of advertising data",
                data.len()
            )));
        }

        // Register this device as a connectable peripheral.
        {
            let mut peripherals = self.network.peripherals.lock().await;
            peripherals.insert(
                self.address.clone(),
                PeripheralLink {
                    events: self.events_tx.clone(),
                    att_mtu: self.att_mtu,
                },
            );
        }
        *self.advertising.lock().await = Some(data.clone());

        let adv = SimAdvertisement {
            data,
            source_address: self.address.clone(),
        };
        let _ = self.network.adv_tx.send(adv);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        let mut peripherals = self.network.peripherals.lock().await;
        peripherals.remove(&self.address);
        *self.advertising.lock().await = None;
        Ok(())
    }

    async fn next_event(&self) -> Option<PeripheralEvent> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await
    }
}

/// A connected central. Requests are delivered to the peripheral as
/// events and answered through the event's responder.
pub struct SimCentral {
    address: BleAddress,
    link: PeripheralLink,
    connected: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
    /// Subscribed flags by characteristic. The notifier itself belongs to
    /// the peripheral so the channel closes when its scheduler stops.
    subscriptions: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl SimCentral {
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, event: PeripheralEvent) -> Result<(), BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        self.link
            .events
            .send(event)
            .map_err(|_| BleError::Disconnected)
    }

    pub async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        let (responder, response) = oneshot::channel();
        self.send(PeripheralEvent::ReadRequest {
            peer: self.address.clone(),
            characteristic,
            responder,
        })?;
        response
            .await
            .map_err(|_| BleError::Disconnected)?
            .map_err(BleError::Rejected)
    }

    pub async fn read_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let (responder, response) = oneshot::channel();
        self.send(PeripheralEvent::ReadDescriptorRequest {
            peer: self.address.clone(),
            characteristic,
            descriptor,
            responder,
        })?;
        response
            .await
            .map_err(|_| BleError::Disconnected)?
            .map_err(BleError::Rejected)
    }

    pub async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), BleError> {
        let (responder, response) = oneshot::channel();
        self.send(PeripheralEvent::WriteRequest {
            peer: self.address.clone(),
            characteristic,
            value: value.to_vec(),
            responder,
        })?;
        response
            .await
            .map_err(|_| BleError::Disconnected)?
            .map_err(BleError::Rejected)
    }

    pub async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let (responder, response) = oneshot::channel();
        self.send(PeripheralEvent::WriteDescriptorRequest {
            peer: self.address.clone(),
            characteristic,
            descriptor,
            value: value.to_vec(),
            responder,
        })?;
        response
            .await
            .map_err(|_| BleError::Disconnected)?
            .map_err(BleError::Rejected)
    }

    /// Enable notifications. Pushed values arrive on the returned channel,
    /// which closes once the peripheral drops the subscription.
    pub async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BleError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribed = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(SimNotifier {
            peer: self.address.clone(),
            att_mtu: self.link.att_mtu,
            tx,
            subscribed: Arc::clone(&subscribed),
            connected: Arc::clone(&self.connected),
            failing: Arc::clone(&self.failing),
        });

        self.send(PeripheralEvent::Subscribe {
            characteristic,
            notifier,
        })?;

        let mut subs = self.subscriptions.lock().await;
        if let Some(previous) = subs.insert(characteristic, subscribed) {
            previous.store(false, Ordering::SeqCst);
        }
        Ok(rx)
    }

    /// Disable notifications and tell the peripheral.
    pub async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), BleError> {
        self.unsubscribe_without_event(characteristic).await;
        self.send(PeripheralEvent::Unsubscribe {
            peer: self.address.clone(),
            characteristic,
        })
    }

    /// Disable notifications without delivering an event, as when a stack
    /// drops the CCCD state on its own. The peripheral only notices by
    /// polling the notifier.
    pub async fn unsubscribe_without_event(&self, characteristic: Uuid) {
        let mut subs = self.subscriptions.lock().await;
        if let Some(subscribed) = subs.remove(&characteristic) {
            subscribed.store(false, Ordering::SeqCst);
        }
    }

    /// Make every notification to this central fail until cleared.
    pub fn fail_notifications(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        let event = PeripheralEvent::Disconnected {
            peer: self.address.clone(),
        };
        let result = self.send(event);
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.lock().await.clear();
        result
    }
}

/// Notification sink for one central's subscription to one characteristic.
pub struct SimNotifier {
    peer: BleAddress,
    att_mtu: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    subscribed: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

#[async_trait]
impl Notifier for SimNotifier {
    async fn notify(&self, data: &[u8]) -> Result<(), BleError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(BleError::NotSubscribed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BleError::Timeout);
        }
        let max = self.att_mtu.saturating_sub(NOTIFICATION_HEADER_LEN);
        if data.len() > max {
            return Err(BleError::MtuExceeded {
                size: data.len(),
                mtu: max,
            });
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| BleError::Disconnected)
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn peer_address(&self) -> &BleAddress {
        &self.peer
    }
}
