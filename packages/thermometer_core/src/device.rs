//! Device lifecycle
//!
//! `ThermometerDevice` owns the unit state, the service registry and the
//! request router, and runs the event loop that connects them to a
//! [`BlePeripheral`] until shutdown.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::ble::advertising::AdvertisementData;
use crate::ble::transport::{BlePeripheral, PeripheralEvent};
use crate::ble::BleError;
use crate::config::{ConfigError, DeviceConfig};
use crate::gatt::{GattError, GattServer, ServiceRegistry, SubscriptionOutcome};
use crate::sensor::{FallbackSensor, TemperatureSource, ThermalZoneSensor};
use crate::services::{gap_service, thermometer_service};
use crate::state::DeviceState;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),

    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub struct ThermometerDevice {
    config: DeviceConfig,
    state: Arc<DeviceState>,
    server: GattServer,
}

impl ThermometerDevice {
    /// Build the services around `sensor`. Unavailable readings fall back to
    /// the configured range. An invalid service definition fails here,
    /// before anything is advertised.
    pub fn new(
        config: DeviceConfig,
        sensor: Arc<dyn TemperatureSource>,
    ) -> Result<Self, DeviceError> {
        config.validate()?;

        let state = Arc::new(DeviceState::new());
        let sensor: Arc<dyn TemperatureSource> =
            Arc::new(FallbackSensor::new(sensor, config.fallback_range)?);

        let services = vec![
            gap_service(&config.device_name, config.appearance)?,
            thermometer_service(Arc::clone(&state), sensor, config.notify_interval())?,
        ];
        let registry = Arc::new(ServiceRegistry::new(services)?);
        let server = GattServer::new(registry).with_att_mtu(config.att_mtu);

        Ok(Self {
            config,
            state,
            server,
        })
    }

    /// Build a device reading the thermal zone file named in `config`.
    pub fn from_config(config: DeviceConfig) -> Result<Self, DeviceError> {
        let sensor = Arc::new(ThermalZoneSensor::new(config.sensor_path.clone()));
        Self::new(config, sensor)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn server(&self) -> &GattServer {
        &self.server
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        self.server.registry()
    }

    pub fn advertisement(&self) -> AdvertisementData {
        AdvertisementData::for_registry(&self.config.device_name, self.registry())
    }

    /// Encoded advertising payload: device name and advertised services.
    pub fn advertising_data(&self) -> Result<Vec<u8>, BleError> {
        self.advertisement().encode()
    }

    /// Serve `transport` until `shutdown` resolves or the transport closes.
    /// Advertising stops and every scheduler is wound down before returning,
    /// including when a transport error ends the loop.
    pub async fn run<P, F>(&self, transport: &P, shutdown: F) -> Result<(), DeviceError>
    where
        P: BlePeripheral + ?Sized,
        F: Future<Output = ()>,
    {
        log::info!("Thermometer '{}' waiting for radio", self.config.device_name);

        let served = self.serve(transport, shutdown).await;

        let stopped = transport.stop_advertising().await;
        log_outcomes(self.server.shutdown().await);
        log::info!("Thermometer '{}' stopped", self.config.device_name);

        served?;
        stopped?;
        Ok(())
    }

    async fn serve<P, F>(&self, transport: &P, shutdown: F) -> Result<(), DeviceError>
    where
        P: BlePeripheral + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    return Ok(());
                }
                event = transport.next_event() => match event {
                    Some(event) => {
                        self.handle_event(transport, event).await?;
                        log_outcomes(self.server.reap_finished().await);
                    }
                    None => {
                        log::info!("Transport closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_event<P>(
        &self,
        transport: &P,
        event: PeripheralEvent,
    ) -> Result<(), DeviceError>
    where
        P: BlePeripheral + ?Sized,
    {
        log::debug!("Event: {:?}", event);
        match event {
            PeripheralEvent::PowerStateChanged { powered_on: true } => {
                let data = self.advertising_data()?;
                transport.start_advertising(data).await?;
                log::info!(
                    "Advertising '{}' with {} service(s)",
                    self.config.device_name,
                    self.registry().advertised_uuids().len()
                );
            }
            PeripheralEvent::PowerStateChanged { powered_on: false } => {
                log::warn!("Radio powered off; stopping notifications");
                log_outcomes(self.server.shutdown().await);
            }
            PeripheralEvent::Connected { peer } => {
                log::info!("Central {} connected", peer);
            }
            PeripheralEvent::Disconnected { peer } => {
                log::info!("Central {} disconnected", peer);
                self.server.disconnect(&peer).await;
            }
            PeripheralEvent::ReadRequest {
                peer,
                characteristic,
                responder,
            } => {
                let result = self.server.read(&characteristic).map_err(|e| {
                    log::warn!("Read of {} by {} failed: {}", characteristic, peer, e);
                    e.att_error()
                });
                let _ = responder.send(result);
            }
            PeripheralEvent::ReadDescriptorRequest {
                peer,
                characteristic,
                descriptor,
                responder,
            } => {
                let result = self
                    .server
                    .read_descriptor(&characteristic, &descriptor)
                    .map_err(|e| {
                        log::warn!("Descriptor read by {} failed: {}", peer, e);
                        e.att_error()
                    });
                let _ = responder.send(result);
            }
            PeripheralEvent::WriteRequest {
                peer,
                characteristic,
                value,
                responder,
            } => {
                let result = self
                    .server
                    .write(&characteristic, &value)
                    .map(|_| ())
                    .map_err(|e| {
                        log::warn!("Write of {} by {} failed: {}", characteristic, peer, e);
                        e.att_error()
                    });
                let _ = responder.send(result);
            }
            PeripheralEvent::WriteDescriptorRequest {
                peer,
                characteristic,
                descriptor,
                value,
                responder,
            } => {
                let result = self
                    .server
                    .write_descriptor(&characteristic, &descriptor, &value)
                    .map_err(|e| {
                        log::warn!("Descriptor write by {} failed: {}", peer, e);
                        e.att_error()
                    });
                let _ = responder.send(result);
            }
            PeripheralEvent::Subscribe {
                characteristic,
                notifier,
            } => {
                let peer = notifier.peer_address().clone();
                if let Err(e) = self.server.subscribe(&characteristic, notifier).await {
                    log::warn!("Subscription of {} to {} refused: {}", peer, characteristic, e);
                }
            }
            PeripheralEvent::Unsubscribe {
                peer,
                characteristic,
            } => {
                self.server.unsubscribe(&characteristic, &peer).await;
            }
        }
        Ok(())
    }
}

fn log_outcomes(outcomes: Vec<SubscriptionOutcome>) {
    for outcome in outcomes {
        match outcome {
            Ok(report) => log::debug!(
                "Subscription of {} to {} ended ({}, {} ticks, {} skipped)",
                report.peer,
                report.characteristic,
                report.reason,
                report.ticks,
                report.failed_ticks
            ),
            Err(e) => log::warn!("Subscription ended with error: {}", e),
        }
    }
}
