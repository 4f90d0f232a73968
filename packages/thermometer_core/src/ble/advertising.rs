//! Legacy advertising payloads
//!
//! Builds the ≤31-byte advertising data the transport broadcasts: flags,
//! the advertised service UUIDs and the local name, shortened when the
//! complete name does not fit.

use uuid::Uuid;

use super::BleError;
use crate::gatt::{as_uuid16, ServiceRegistry};

/// Maximum size of legacy advertising data.
pub const MAX_LEGACY_ADV_LEN: usize = 31;

const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORTENED_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;

/// LE general discoverable, BR/EDR not supported.
const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// The contents of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub local_name: String,
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    pub fn new(local_name: impl Into<String>, service_uuids: Vec<Uuid>) -> Self {
        Self {
            local_name: local_name.into(),
            service_uuids,
        }
    }

    /// Advertise `local_name` and every service the registry marks as
    /// advertised.
    pub fn for_registry(local_name: &str, registry: &ServiceRegistry) -> Self {
        Self::new(local_name, registry.advertised_uuids())
    }

    /// Encode as AD structures. The name is shortened, or dropped, to fit;
    /// flags and service UUIDs must fit or encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, BleError> {
        let mut buf = vec![0x02, AD_FLAGS, FLAGS_GENERAL_DISCOVERABLE];

        let (short, long): (Vec<Uuid>, Vec<Uuid>) = self
            .service_uuids
            .iter()
            .partition(|uuid| as_uuid16(uuid).is_some());

        if !short.is_empty() {
            buf.push((1 + 2 * short.len()) as u8);
            buf.push(AD_COMPLETE_UUID16);
            for uuid in &short {
                if let Some(id) = as_uuid16(uuid) {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
        }
        if !long.is_empty() {
            buf.push((1 + 16 * long.len()) as u8);
            buf.push(AD_COMPLETE_UUID128);
            for uuid in &long {
                buf.extend_from_slice(&uuid.as_u128().to_le_bytes());
            }
        }

        if buf.len() > MAX_LEGACY_ADV_LEN {
            return Err(BleError::PayloadTooLarge {
                size: buf.len(),
                max: MAX_LEGACY_ADV_LEN,
            });
        }

        let room = MAX_LEGACY_ADV_LEN - buf.len();
        let name = self.local_name.as_bytes();
        if !name.is_empty() && room > 2 {
            if name.len() + 2 <= room {
                buf.push((1 + name.len()) as u8);
                buf.push(AD_COMPLETE_NAME);
                buf.extend_from_slice(name);
            } else {
                let shortened = truncate_utf8(&self.local_name, room - 2);
                if !shortened.is_empty() {
                    buf.push((1 + shortened.len()) as u8);
                    buf.push(AD_SHORTENED_NAME);
                    buf.extend_from_slice(shortened.as_bytes());
                }
            }
        }

        Ok(buf)
    }

    /// Parse AD structures back into name and service UUIDs. Unknown AD
    /// types are skipped; a truncated structure yields `None`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut local_name = String::new();
        let mut service_uuids = Vec::new();

        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len == 0 {
                break;
            }
            if tail.len() < len {
                return None;
            }
            let (structure, next) = tail.split_at(len);
            let (ad_type, body) = structure.split_first()?;
            match *ad_type {
                AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                    for chunk in body.chunks_exact(2) {
                        let id = u16::from_le_bytes([chunk[0], chunk[1]]);
                        service_uuids.push(crate::gatt::uuid16(id));
                    }
                }
                AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                    for chunk in body.chunks_exact(16) {
                        let bytes: [u8; 16] = chunk.try_into().ok()?;
                        service_uuids.push(Uuid::from_u128(u128::from_le_bytes(bytes)));
                    }
                }
                AD_SHORTENED_NAME | AD_COMPLETE_NAME => {
                    local_name = String::from_utf8_lossy(body).into_owned();
                }
                _ => {}
            }
            rest = next;
        }

        Some(Self {
            local_name,
            service_uuids,
        })
    }
}

/// Longest prefix of `s` no longer than `max` bytes that ends on a char
/// boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
