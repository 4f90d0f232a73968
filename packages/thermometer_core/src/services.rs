//! Service definitions exposed by the thermometer
//!
//! A read-only GAP service carrying the device identity and the custom
//! thermometer service with its temperature and unit characteristics.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::gatt::codec::{decode_unit_write, encode_reading, encode_unit_read};
use crate::gatt::{
    define_service, uuid16, Characteristic, Descriptor, GattError, NotifyHandler,
    PresentationFormat, Properties, Service, WriteStatus,
};
use crate::sensor::TemperatureSource;
use crate::state::DeviceState;

pub const GAP_SERVICE: Uuid = uuid16(0x1800);
pub const DEVICE_NAME: Uuid = uuid16(0x2A00);
pub const APPEARANCE: Uuid = uuid16(0x2A01);

pub const THERMOMETER_SERVICE: Uuid = Uuid::from_u128(0x9941f656_8e3e_11eb_8dcd_0242ac130003);
pub const TEMPERATURE: Uuid = uuid16(0x2A6E);
pub const UNIT: Uuid = Uuid::from_u128(0x9941fb38_8e3e_11eb_8dcd_0242ac130003);

pub const USER_DESCRIPTION: Uuid = uuid16(0x2901);
pub const PRESENTATION_FORMAT: Uuid = uuid16(0x2904);

pub const UNIT_DESCRIPTION: &str = "Temperature Units (F or C)";

/// Standard GAP service: device name and appearance, both read-only.
pub fn gap_service(device_name: &str, appearance: u16) -> Result<Service, GattError> {
    define_service(
        GAP_SERVICE,
        vec![
            Characteristic::new(DEVICE_NAME, Properties::READ)
                .with_value(device_name.as_bytes().to_vec()),
            Characteristic::new(APPEARANCE, Properties::READ)
                .with_value(appearance.to_le_bytes().to_vec()),
        ],
    )
}

/// The advertised thermometer service.
///
/// The temperature characteristic encodes a fresh reading on every read and
/// every notification tick, in whatever unit the shared state holds at that
/// moment. Writing the unit characteristic wakes every temperature
/// subscription so the new unit is pushed without waiting for the cadence.
pub fn thermometer_service(
    state: Arc<DeviceState>,
    sensor: Arc<dyn TemperatureSource>,
    notify_interval: Duration,
) -> Result<Service, GattError> {
    let current_reading = {
        let state = Arc::clone(&state);
        move || -> Result<Vec<u8>, GattError> {
            let celsius = sensor.read_celsius()?;
            Ok(encode_reading(celsius, state.unit())?.to_vec())
        }
    };
    let read_reading = current_reading.clone();

    let temperature = Characteristic::new(TEMPERATURE, Properties::READ | Properties::NOTIFY)
        .with_read(move |sink| {
            let bytes = read_reading()?;
            sink.write(&bytes)?;
            Ok(())
        })
        .with_notify(
            NotifyHandler::periodic(notify_interval, current_reading)
                .with_wake(state.unit_changed().clone()),
        )
        .with_descriptor(Descriptor::new(
            PRESENTATION_FORMAT,
            PresentationFormat::celsius_centi().to_bytes(),
        ));

    let read_state = Arc::clone(&state);
    let unit = Characteristic::new(UNIT, Properties::READ | Properties::WRITE)
        .with_read(move |sink| {
            sink.write(&encode_unit_read(read_state.unit()))?;
            Ok(())
        })
        .with_write(move |payload| {
            state.set_unit(decode_unit_write(payload));
            WriteStatus::Success
        })
        .with_descriptor(Descriptor::new(USER_DESCRIPTION, UNIT_DESCRIPTION.as_bytes()));

    Ok(define_service(THERMOMETER_SERVICE, vec![temperature, unit])?.advertised())
}
