//! Request router
//!
//! Routes reads, writes and subscriptions from the transport to the
//! characteristic with the matching UUID and keeps one scheduler handle per
//! active (characteristic, peer) subscription.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ble::transport::{BleAddress, Notifier, ReadResponse, DEFAULT_ATT_MTU};
use crate::gatt::characteristic::{Characteristic, WriteStatus};
use crate::gatt::notify::{SchedulerReport, SubscriptionHandle};
use crate::gatt::service::ServiceRegistry;
use crate::gatt::{GattError, Operation};

type SubscriptionKey = (Uuid, BleAddress);

/// How a scheduler ended: its report, or the error that stopped it.
pub type SubscriptionOutcome = Result<SchedulerReport, GattError>;

pub struct GattServer {
    registry: Arc<ServiceRegistry>,
    att_mtu: usize,
    subscriptions: Mutex<HashMap<SubscriptionKey, SubscriptionHandle>>,
}

impl GattServer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            att_mtu: DEFAULT_ATT_MTU,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Bound read responses by a negotiated ATT MTU.
    pub fn with_att_mtu(mut self, att_mtu: usize) -> Self {
        self.att_mtu = att_mtu;
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn characteristic(&self, uuid: &Uuid) -> Result<&Arc<Characteristic>, GattError> {
        self.registry
            .characteristic(uuid)
            .ok_or(GattError::UnknownCharacteristic(*uuid))
    }

    /// Serve a characteristic read.
    pub fn read(&self, characteristic: &Uuid) -> Result<Vec<u8>, GattError> {
        let mut response = ReadResponse::for_mtu(self.att_mtu);
        self.characteristic(characteristic)?.on_read(&mut response)?;
        Ok(response.into_bytes())
    }

    /// Serve a descriptor read. Descriptors are static.
    pub fn read_descriptor(
        &self,
        characteristic: &Uuid,
        descriptor: &Uuid,
    ) -> Result<Vec<u8>, GattError> {
        let descriptor = self
            .characteristic(characteristic)?
            .descriptor(descriptor)
            .ok_or(GattError::UnknownDescriptor {
                characteristic: *characteristic,
                descriptor: *descriptor,
            })?;
        Ok(descriptor.value().to_vec())
    }

    /// Descriptors are read-only. Client configuration writes never reach
    /// the router; the transport turns them into subscribe events.
    pub fn write_descriptor(
        &self,
        characteristic: &Uuid,
        descriptor: &Uuid,
        _payload: &[u8],
    ) -> Result<(), GattError> {
        self.read_descriptor(characteristic, descriptor)?;
        Err(GattError::NotPermitted {
            operation: Operation::Write,
            characteristic: *characteristic,
        })
    }

    /// Serve a characteristic write.
    pub fn write(&self, characteristic: &Uuid, payload: &[u8]) -> Result<WriteStatus, GattError> {
        self.characteristic(characteristic)?.on_write(payload)
    }

    /// Start notifications for the notifier's peer. A previous subscription
    /// of the same peer to the same characteristic is stopped and replaced.
    pub async fn subscribe(
        &self,
        characteristic: &Uuid,
        notifier: Arc<dyn Notifier>,
    ) -> Result<(), GattError> {
        let peer = notifier.peer_address().clone();
        let handle = self.characteristic(characteristic)?.on_subscribe(notifier)?;

        let mut subs = self.subscriptions.lock().await;
        if let Some(previous) = subs.insert((*characteristic, peer), handle) {
            previous.stop();
        }
        Ok(())
    }

    /// Stop notifications for one peer on one characteristic.
    pub async fn unsubscribe(&self, characteristic: &Uuid, peer: &BleAddress) {
        let handle = {
            let mut subs = self.subscriptions.lock().await;
            subs.remove(&(*characteristic, peer.clone()))
        };
        if let Some(handle) = handle {
            if let Ok(c) = self.characteristic(characteristic) {
                c.on_unsubscribe(&handle);
            } else {
                handle.stop();
            }
        }
    }

    /// Stop every subscription held by `peer`.
    pub async fn disconnect(&self, peer: &BleAddress) {
        let mut subs = self.subscriptions.lock().await;
        subs.retain(|(_, subscriber), handle| {
            if subscriber == peer {
                handle.stop();
                false
            } else {
                true
            }
        });
    }

    /// Drop subscriptions whose scheduler stopped on its own, after a sink
    /// failure or a silent unsubscribe, and return how each one ended.
    pub async fn reap_finished(&self) -> Vec<SubscriptionOutcome> {
        let finished: Vec<SubscriptionHandle> = {
            let mut subs = self.subscriptions.lock().await;
            let keys: Vec<SubscriptionKey> = subs
                .iter()
                .filter(|(_, handle)| !handle.is_running())
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| subs.remove(key)).collect()
        };
        join_all(finished).await
    }

    /// Stop every subscription, wait for the schedulers to wind down and
    /// return how each one ended.
    pub async fn shutdown(&self) -> Vec<SubscriptionOutcome> {
        let handles: Vec<SubscriptionHandle> = {
            let mut subs = self.subscriptions.lock().await;
            subs.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.stop();
        }
        join_all(handles).await
    }

    /// Number of schedulers still running.
    pub async fn active_subscriptions(&self) -> usize {
        let subs = self.subscriptions.lock().await;
        subs.values().filter(|h| h.is_running()).count()
    }

    /// Number of subscriptions held, including stopped ones not yet reaped.
    pub async fn held_subscriptions(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

async fn join_all(handles: Vec<SubscriptionHandle>) -> Vec<SubscriptionOutcome> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.join().await);
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BleError;
    use crate::gatt::characteristic::{Descriptor, NotifyHandler, Properties};
    use crate::gatt::{define_service, uuid16, StopReason};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelNotifier {
        address: BleAddress,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        subscribed: AtomicBool,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, data: &[u8]) -> Result<(), BleError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BleError::Timeout);
            }
            self.tx.send(data.to_vec()).map_err(|_| BleError::Disconnected)
        }

        fn is_subscribed(&self) -> bool {
            self.subscribed.load(Ordering::SeqCst)
        }

        fn peer_address(&self) -> &BleAddress {
            &self.address
        }
    }

    fn peer(address: BleAddress) -> (Arc<ChannelNotifier>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(ChannelNotifier {
            address,
            tx,
            subscribed: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        });
        (notifier, rx)
    }

    const NOTIFYING: Uuid = uuid16(0x2A6E);
    const NAME: Uuid = uuid16(0x2A00);

    fn server() -> GattServer {
        let notifying = Characteristic::new(NOTIFYING, Properties::READ | Properties::NOTIFY)
            .with_value(vec![0x01])
            .with_notify(NotifyHandler::periodic(Duration::from_secs(2), || {
                Ok(vec![0x01])
            }))
            .with_descriptor(Descriptor::new(uuid16(0x2901), b"Counter".to_vec()));
        let name = Characteristic::new(NAME, Properties::READ).with_value(vec![0x41; 30]);
        let service = define_service(uuid16(0x181A), vec![notifying, name]).unwrap();
        GattServer::new(Arc::new(ServiceRegistry::new(vec![service]).unwrap()))
    }

    #[test]
    fn test_read_routes_by_uuid() {
        let server = server();
        assert_eq!(server.read(&NOTIFYING).unwrap(), vec![0x01]);
        assert_eq!(
            server.read(&uuid16(0x2A19)),
            Err(GattError::UnknownCharacteristic(uuid16(0x2A19)))
        );
    }

    #[test]
    fn test_read_bounded_by_mtu() {
        let server = server();
        assert!(matches!(
            server.read(&NAME),
            Err(GattError::SinkWriteFailed(BleError::MtuExceeded { .. }))
        ));

        let server = server.with_att_mtu(64);
        assert_eq!(server.read(&NAME).unwrap().len(), 30);
    }

    #[test]
    fn test_descriptor_reads() {
        let server = server();
        assert_eq!(
            server.read_descriptor(&NOTIFYING, &uuid16(0x2901)).unwrap(),
            b"Counter"
        );
        assert!(matches!(
            server.read_descriptor(&NOTIFYING, &uuid16(0x2904)),
            Err(GattError::UnknownDescriptor { .. })
        ));
    }

    #[test]
    fn test_descriptor_writes_are_rejected() {
        let server = server();
        assert_eq!(
            server.write_descriptor(&NOTIFYING, &uuid16(0x2901), b"Renamed"),
            Err(GattError::NotPermitted {
                operation: Operation::Write,
                characteristic: NOTIFYING,
            })
        );
        assert!(matches!(
            server.write_descriptor(&NOTIFYING, &uuid16(0x2904), b"x"),
            Err(GattError::UnknownDescriptor { .. })
        ));
        assert_eq!(
            server.read_descriptor(&NOTIFYING, &uuid16(0x2901)).unwrap(),
            b"Counter"
        );
    }

    #[test]
    fn test_write_to_read_only_is_rejected() {
        let server = server();
        assert_eq!(
            server.write(&NAME, b"x"),
            Err(GattError::NotPermitted {
                operation: Operation::Write,
                characteristic: NAME,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_to_non_notifying_characteristic_fails() {
        let server = server();
        let (notifier, _rx) = peer(BleAddress::Simulated(Uuid::new_v4()));
        let result = server.subscribe(&NAME, notifier).await;
        assert!(matches!(
            result,
            Err(GattError::NotPermitted {
                operation: Operation::Notify,
                ..
            })
        ));
        assert_eq!(server.active_subscriptions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_lifecycle() {
        let server = server();
        let address = BleAddress::Simulated(Uuid::new_v4());
        let (notifier, mut rx) = peer(address.clone());

        server.subscribe(&NOTIFYING, notifier).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![0x01]);
        assert_eq!(server.active_subscriptions().await, 1);

        server.unsubscribe(&NOTIFYING, &address).await;
        // The scheduler drops its notifier once stopped, closing the channel.
        assert!(rx.recv().await.is_none());
        assert_eq!(server.active_subscriptions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_replaces_previous_scheduler() {
        let server = server();
        let address = BleAddress::Simulated(Uuid::new_v4());
        let (first, mut first_rx) = peer(address.clone());
        let (second, mut second_rx) = peer(address.clone());

        server.subscribe(&NOTIFYING, first).await.unwrap();
        first_rx.recv().await.unwrap();
        server.subscribe(&NOTIFYING, second).await.unwrap();
        second_rx.recv().await.unwrap();

        assert!(first_rx.recv().await.is_none());
        assert_eq!(server.active_subscriptions().await, 1);
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_only_stops_that_peer() {
        let server = server();
        let leaving = BleAddress::Simulated(Uuid::new_v4());
        let staying = BleAddress::Simulated(Uuid::new_v4());
        let (a, mut a_rx) = peer(leaving.clone());
        let (b, mut b_rx) = peer(staying.clone());

        server.subscribe(&NOTIFYING, a).await.unwrap();
        server.subscribe(&NOTIFYING, b).await.unwrap();
        a_rx.recv().await.unwrap();
        b_rx.recv().await.unwrap();

        server.disconnect(&leaving).await;
        assert!(a_rx.recv().await.is_none());

        // The other peer keeps its cadence.
        assert_eq!(b_rx.recv().await.unwrap(), vec![0x01]);
        assert_eq!(server.active_subscriptions().await, 1);

        server.shutdown().await;
        assert_eq!(server.active_subscriptions().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_schedulers() {
        let server = server();
        let (notifier, mut rx) = peer(BleAddress::Simulated(Uuid::new_v4()));
        server
            .subscribe(&NOTIFYING, Arc::clone(&notifier) as Arc<dyn Notifier>)
            .await
            .unwrap();
        rx.recv().await.unwrap();

        let outcomes = server.shutdown().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].as_ref().unwrap().reason, StopReason::Cancelled);
        // Only the test's own reference to the notifier remains.
        assert_eq!(Arc::strong_count(&notifier), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_schedulers_are_reaped_with_their_errors() {
        let server = server();
        let (healthy, mut healthy_rx) = peer(BleAddress::Simulated(Uuid::new_v4()));
        server.subscribe(&NOTIFYING, healthy).await.unwrap();

        let mut failing = Vec::new();
        for _ in 0..10 {
            let (notifier, rx) = peer(BleAddress::Simulated(Uuid::new_v4()));
            notifier.failing.store(true, Ordering::SeqCst);
            server
                .subscribe(&NOTIFYING, Arc::clone(&notifier) as Arc<dyn Notifier>)
                .await
                .unwrap();
            failing.push((notifier, rx));
        }

        healthy_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(server.active_subscriptions().await, 1);
        assert_eq!(server.held_subscriptions().await, 11);

        let outcomes = server.reap_finished().await;
        assert_eq!(outcomes.len(), 10);
        for outcome in outcomes {
            assert_eq!(outcome, Err(GattError::SinkWriteFailed(BleError::Timeout)));
        }
        assert_eq!(server.held_subscriptions().await, 1);
        assert_eq!(server.active_subscriptions().await, 1);

        // Nothing left to reap while the healthy scheduler runs.
        assert!(server.reap_finished().await.is_empty());
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silently_unsubscribed_schedulers_are_reaped() {
        let server = server();
        let (notifier, mut rx) = peer(BleAddress::Simulated(Uuid::new_v4()));
        server
            .subscribe(&NOTIFYING, Arc::clone(&notifier) as Arc<dyn Notifier>)
            .await
            .unwrap();
        rx.recv().await.unwrap();

        notifier.subscribed.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;

        let outcomes = server.reap_finished().await;
        assert_eq!(outcomes.len(), 1);
        let report = outcomes[0].as_ref().unwrap();
        assert_eq!(report.reason, StopReason::Unsubscribed);
        assert_eq!(report.ticks, 1);
        assert_eq!(server.held_subscriptions().await, 0);
    }
}
