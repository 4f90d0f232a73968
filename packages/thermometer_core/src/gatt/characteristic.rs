//! Characteristic runtime
//!
//! Binds one characteristic UUID to at most one handler per operation
//! kind, a fixed list of descriptors and the advertised property bits.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::ble::transport::{Notifier, ResponseSink};
use crate::gatt::notify::{self, SubscriptionHandle, WakeSignal};
use crate::gatt::{GattError, Operation};

/// Characteristic property bits as carried in the ATT characteristic
/// declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Properties(u8);

impl Properties {
    pub const NONE: Properties = Properties(0x00);
    pub const READ: Properties = Properties(0x02);
    pub const WRITE: Properties = Properties(0x08);
    pub const NOTIFY: Properties = Properties(0x10);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Properties::READ) {
            names.push("read");
        }
        if self.contains(Properties::WRITE) {
            names.push("write");
        }
        if self.contains(Properties::NOTIFY) {
            names.push("notify");
        }
        names
    }
}

impl BitOr for Properties {
    type Output = Properties;

    fn bitor(self, rhs: Properties) -> Properties {
        Properties(self.0 | rhs.0)
    }
}

/// Static descriptor attached to a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    value: Vec<u8>,
}

impl Descriptor {
    pub fn new(uuid: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            value: value.into(),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Characteristic Presentation Format (0x2904) descriptor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationFormat {
    pub format: u8,
    pub exponent: i8,
    pub unit: u16,
    pub namespace: u8,
    pub description: u16,
}

impl PresentationFormat {
    pub const FORMAT_SINT16: u8 = 0x0E;
    pub const UNIT_DEGREE_CELSIUS: u16 = 0x272F;
    pub const NAMESPACE_BLUETOOTH_SIG: u8 = 0x01;

    /// Signed 16-bit hundredths of a degree Celsius.
    pub const fn celsius_centi() -> Self {
        Self {
            format: Self::FORMAT_SINT16,
            exponent: -2,
            unit: Self::UNIT_DEGREE_CELSIUS,
            namespace: Self::NAMESPACE_BLUETOOTH_SIG,
            description: 0x0000,
        }
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        let [unit_lo, unit_hi] = self.unit.to_le_bytes();
        let [desc_lo, desc_hi] = self.description.to_le_bytes();
        [
            self.format,
            self.exponent as u8,
            unit_lo,
            unit_hi,
            self.namespace,
            desc_lo,
            desc_hi,
        ]
    }
}

/// Outcome of an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
}

pub type ReadFn = dyn Fn(&mut dyn ResponseSink) -> Result<(), GattError> + Send + Sync;
pub type WriteFn = dyn Fn(&[u8]) -> WriteStatus + Send + Sync;
pub type ValueFn = dyn Fn() -> Result<Vec<u8>, GattError> + Send + Sync;

/// How a notifying characteristic produces and paces its pushes.
#[derive(Clone)]
pub struct NotifyHandler {
    value: Arc<ValueFn>,
    interval: Duration,
    wake: Option<WakeSignal>,
}

impl NotifyHandler {
    /// Push the value produced by `value` every `interval`.
    pub fn periodic(
        interval: Duration,
        value: impl Fn() -> Result<Vec<u8>, GattError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            value: Arc::new(value),
            interval,
            wake: None,
        }
    }

    /// Also push immediately whenever `signal` is raised.
    pub fn with_wake(mut self, signal: WakeSignal) -> Self {
        self.wake = Some(signal);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// A characteristic definition and its request handlers.
#[derive(Clone)]
pub struct Characteristic {
    pub uuid: Uuid,
    properties: Properties,
    value: Option<Vec<u8>>,
    on_read: Option<Arc<ReadFn>>,
    on_write: Option<Arc<WriteFn>>,
    on_notify: Option<NotifyHandler>,
    descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: Properties) -> Self {
        Self {
            uuid,
            properties,
            value: None,
            on_read: None,
            on_write: None,
            on_notify: None,
            descriptors: Vec::new(),
        }
    }

    /// Serve a constant value when no read handler is installed.
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_read(
        mut self,
        handler: impl Fn(&mut dyn ResponseSink) -> Result<(), GattError> + Send + Sync + 'static,
    ) -> Self {
        self.on_read = Some(Arc::new(handler));
        self
    }

    pub fn with_write(
        mut self,
        handler: impl Fn(&[u8]) -> WriteStatus + Send + Sync + 'static,
    ) -> Self {
        self.on_write = Some(Arc::new(handler));
        self
    }

    pub fn with_notify(mut self, handler: NotifyHandler) -> Self {
        self.on_notify = Some(handler);
        self
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn properties(&self) -> Properties {
        self.properties
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }

    /// Check the advertised properties against the supplied handlers.
    pub(crate) fn validate(&self) -> Result<(), GattError> {
        let props = self.properties;
        let readable = self.on_read.is_some() || self.value.is_some();
        if props.contains(Properties::READ) != readable {
            return Err(GattError::InvalidDefinition(format!(
                "characteristic {} read property does not match its read handler",
                self.uuid
            )));
        }
        if props.contains(Properties::WRITE) != self.on_write.is_some() {
            return Err(GattError::InvalidDefinition(format!(
                "characteristic {} write property does not match its write handler",
                self.uuid
            )));
        }
        if props.contains(Properties::NOTIFY) != self.on_notify.is_some() {
            return Err(GattError::InvalidDefinition(format!(
                "characteristic {} notify property does not match its notify handler",
                self.uuid
            )));
        }
        if let Some(handler) = &self.on_notify {
            if handler.interval.is_zero() {
                return Err(GattError::InvalidDefinition(format!(
                    "characteristic {} has a zero notification interval",
                    self.uuid
                )));
            }
        }
        for (i, descriptor) in self.descriptors.iter().enumerate() {
            if self.descriptors[..i].iter().any(|d| d.uuid == descriptor.uuid) {
                return Err(GattError::InvalidDefinition(format!(
                    "characteristic {} declares descriptor {} twice",
                    self.uuid, descriptor.uuid
                )));
            }
        }
        Ok(())
    }

    /// Serve a read request by writing the current value to `sink`.
    pub fn on_read(&self, sink: &mut dyn ResponseSink) -> Result<(), GattError> {
        if !self.properties.contains(Properties::READ) {
            return Err(self.not_permitted(Operation::Read));
        }
        match (&self.on_read, &self.value) {
            (Some(handler), _) => handler(sink),
            (None, Some(value)) => sink.write(value).map_err(GattError::SinkWriteFailed),
            (None, None) => Err(self.not_permitted(Operation::Read)),
        }
    }

    /// Serve a write request.
    pub fn on_write(&self, payload: &[u8]) -> Result<WriteStatus, GattError> {
        match &self.on_write {
            Some(handler) if self.properties.contains(Properties::WRITE) => Ok(handler(payload)),
            _ => Err(self.not_permitted(Operation::Write)),
        }
    }

    /// Start a notification scheduler pushing to `notifier`.
    pub fn on_subscribe(
        &self,
        notifier: Arc<dyn Notifier>,
    ) -> Result<SubscriptionHandle, GattError> {
        match &self.on_notify {
            Some(handler) if self.properties.contains(Properties::NOTIFY) => {
                Ok(notify::spawn(
                    self.uuid,
                    notifier,
                    Arc::clone(&handler.value),
                    handler.interval,
                    handler.wake.as_ref().map(WakeSignal::subscribe),
                ))
            }
            _ => Err(self.not_permitted(Operation::Notify)),
        }
    }

    /// Stop the scheduler started by `on_subscribe`.
    pub fn on_unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.stop();
    }

    fn not_permitted(&self, operation: Operation) -> GattError {
        GattError::NotPermitted {
            operation,
            characteristic: self.uuid,
        }
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("properties", &self.properties.names())
            .field("value", &self.value.as_ref().map(hex::encode))
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::ReadResponse;
    use crate::ble::BleError;
    use crate::gatt::uuid16;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_presentation_format_bytes() {
        assert_eq!(
            PresentationFormat::celsius_centi().to_bytes(),
            [0x0E, 0xFE, 0x2F, 0x27, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_properties_combine() {
        let props = Properties::READ | Properties::NOTIFY;
        assert_eq!(props.bits(), 0x12);
        assert!(props.contains(Properties::READ));
        assert!(!props.contains(Properties::WRITE));
        assert_eq!(props.names(), vec!["read", "notify"]);
    }

    #[test]
    fn test_static_value_read() {
        let c = Characteristic::new(uuid16(0x2A00), Properties::READ)
            .with_value(b"Thermometer".to_vec());
        let mut sink = Vec::new();
        c.on_read(&mut sink).unwrap();
        assert_eq!(sink, b"Thermometer");
    }

    #[test]
    fn test_read_handler_takes_precedence() {
        let c = Characteristic::new(uuid16(0x2A6E), Properties::READ)
            .with_value(vec![0x00])
            .with_read(|sink| sink.write(&[0xAB]).map_err(GattError::from));
        let mut sink = Vec::new();
        c.on_read(&mut sink).unwrap();
        assert_eq!(sink, vec![0xAB]);
    }

    #[test]
    fn test_sink_rejection_is_reported() {
        let c = Characteristic::new(uuid16(0x2A00), Properties::READ).with_value(vec![0u8; 40]);
        let mut sink = ReadResponse::for_mtu(23);
        let err = c.on_read(&mut sink).unwrap_err();
        assert_eq!(
            err,
            GattError::SinkWriteFailed(BleError::MtuExceeded { size: 40, mtu: 22 })
        );
    }

    #[test]
    fn test_write_invokes_handler() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&writes);
        let c = Characteristic::new(uuid16(0x2A6E), Properties::WRITE).with_write(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            WriteStatus::Success
        });
        assert_eq!(c.on_write(b"F").unwrap(), WriteStatus::Success);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_operations_gated_by_properties() {
        let c = Characteristic::new(uuid16(0x2A01), Properties::READ).with_value(vec![0x40, 0x05]);
        assert!(matches!(
            c.on_write(b"x"),
            Err(GattError::NotPermitted {
                operation: Operation::Write,
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_handlers() {
        let no_notify = Characteristic::new(uuid16(0x2A6E), Properties::READ | Properties::NOTIFY)
            .with_value(vec![0x00]);
        assert!(matches!(
            no_notify.validate(),
            Err(GattError::InvalidDefinition(_))
        ));

        let undeclared_write = Characteristic::new(uuid16(0x2A6E), Properties::READ)
            .with_value(vec![0x00])
            .with_write(|_| WriteStatus::Success);
        assert!(undeclared_write.validate().is_err());

        let unreadable = Characteristic::new(uuid16(0x2A6E), Properties::READ);
        assert!(unreadable.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_undeclared_notify() {
        let c = Characteristic::new(uuid16(0x2A6E), Properties::READ)
            .with_value(vec![0x00])
            .with_notify(NotifyHandler::periodic(Duration::from_secs(2), || Ok(vec![0x00])));
        assert!(matches!(c.validate(), Err(GattError::InvalidDefinition(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_descriptors() {
        let c = Characteristic::new(uuid16(0x2A6E), Properties::READ)
            .with_value(vec![0x00])
            .with_descriptor(Descriptor::new(uuid16(0x2901), b"a".to_vec()))
            .with_descriptor(Descriptor::new(uuid16(0x2901), b"b".to_vec()));
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_consistent_definition() {
        let c = Characteristic::new(uuid16(0x2A6E), Properties::READ | Properties::NOTIFY)
            .with_read(|sink| sink.write(&[0x00]).map_err(GattError::from))
            .with_notify(NotifyHandler::periodic(Duration::from_secs(2), || Ok(vec![0x00])))
            .with_descriptor(Descriptor::new(
                uuid16(0x2904),
                PresentationFormat::celsius_centi().to_bytes(),
            ));
        assert!(c.validate().is_ok());
        assert_eq!(
            c.descriptor(&uuid16(0x2904)).unwrap().value(),
            &[0x0E, 0xFE, 0x2F, 0x27, 0x01, 0x00, 0x00]
        );
    }
}
