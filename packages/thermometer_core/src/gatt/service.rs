//! Service definitions and the device-wide service registry
//!
//! Services are built and validated once at startup and are immutable
//! afterwards. The registry is handed read-only to the advertising layer
//! and to the request router.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::gatt::characteristic::Characteristic;
use crate::gatt::{as_uuid16, GattError};

/// A GATT service and its ordered characteristics.
#[derive(Debug, Clone)]
pub struct Service {
    pub uuid: Uuid,
    characteristics: Vec<Arc<Characteristic>>,
    advertised: bool,
}

impl Service {
    pub fn characteristics(&self) -> &[Arc<Characteristic>] {
        &self.characteristics
    }

    /// List this service's UUID in the advertising data.
    pub fn advertised(mut self) -> Self {
        self.advertised = true;
        self
    }

    pub fn is_advertised(&self) -> bool {
        self.advertised
    }
}

/// Build a service, validating that characteristic UUIDs are unique within
/// it and that each characteristic's properties match its handlers.
pub fn define_service(
    uuid: Uuid,
    characteristics: Vec<Characteristic>,
) -> Result<Service, GattError> {
    let mut seen = HashSet::new();
    for characteristic in &characteristics {
        if !seen.insert(characteristic.uuid) {
            return Err(GattError::InvalidDefinition(format!(
                "service {} declares characteristic {} twice",
                uuid, characteristic.uuid
            )));
        }
        characteristic.validate()?;
    }

    Ok(Service {
        uuid,
        characteristics: characteristics.into_iter().map(Arc::new).collect(),
        advertised: false,
    })
}

/// The immutable set of services exposed by the device.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: Vec<Service>,
}

impl ServiceRegistry {
    /// Requests are routed by characteristic UUID, so characteristic UUIDs
    /// must be unique across the whole device, not only within a service.
    pub fn new(services: Vec<Service>) -> Result<Self, GattError> {
        let mut service_ids = HashSet::new();
        let mut characteristic_ids = HashSet::new();
        for service in &services {
            if !service_ids.insert(service.uuid) {
                return Err(GattError::InvalidDefinition(format!(
                    "service {} registered twice",
                    service.uuid
                )));
            }
            for characteristic in &service.characteristics {
                if !characteristic_ids.insert(characteristic.uuid) {
                    return Err(GattError::InvalidDefinition(format!(
                        "characteristic {} appears in more than one service",
                        characteristic.uuid
                    )));
                }
            }
        }

        for service in &services {
            log::info!("Registered service {}", service.uuid);
            for characteristic in &service.characteristics {
                log::debug!(
                    "  characteristic {} [{}] with {} descriptors",
                    characteristic.uuid,
                    characteristic.properties().names().join(","),
                    characteristic.descriptors().len()
                );
            }
        }

        Ok(Self { services })
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| s.uuid == *uuid)
    }

    /// Look up a characteristic anywhere on the device.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Arc<Characteristic>> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)
    }

    /// UUIDs of the services to list in the advertisement, in order.
    pub fn advertised_uuids(&self) -> Vec<Uuid> {
        self.services
            .iter()
            .filter(|s| s.advertised)
            .map(|s| s.uuid)
            .collect()
    }

    /// Serializable view of the attribute table.
    pub fn summary(&self) -> Vec<ServiceSummary> {
        self.services
            .iter()
            .map(|service| ServiceSummary {
                uuid: display_uuid(&service.uuid),
                advertised: service.advertised,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| CharacteristicSummary {
                        uuid: display_uuid(&c.uuid),
                        properties: c.properties().names(),
                        descriptors: c
                            .descriptors()
                            .iter()
                            .map(|d| DescriptorSummary {
                                uuid: display_uuid(&d.uuid),
                                value: hex::encode(d.value()),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }
}

fn display_uuid(uuid: &Uuid) -> String {
    match as_uuid16(uuid) {
        Some(short) => format!("0x{:04X}", short),
        None => uuid.to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub uuid: String,
    pub advertised: bool,
    pub characteristics: Vec<CharacteristicSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CharacteristicSummary {
    pub uuid: String,
    pub properties: Vec<&'static str>,
    pub descriptors: Vec<DescriptorSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DescriptorSummary {
    pub uuid: String,
    pub value: String,
}
