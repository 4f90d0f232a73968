//! Wire codec for temperature readings and the unit characteristic
//!
//! A reading travels as 3 bytes: the temperature scaled by 100 as a signed
//! 16-bit little-endian integer, followed by the ASCII unit tag.

use crate::gatt::GattError;
use crate::state::UnitPreference;

/// Size of an encoded reading.
pub const READING_LEN: usize = 3;

/// A temperature in hundredths of a degree plus its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub centi_degrees: i16,
    pub unit: UnitPreference,
}

impl Reading {
    /// Convert a Celsius value into `unit`, scale by 100 and truncate
    /// toward zero. Values outside the `i16` range (or not finite) fail
    /// instead of wrapping.
    pub fn from_celsius(raw_celsius: f64, unit: UnitPreference) -> Result<Self, GattError> {
        let value = unit.convert_celsius(raw_celsius);
        let scaled = (value * 100.0).trunc();
        if !scaled.is_finite() || scaled < i16::MIN as f64 || scaled > i16::MAX as f64 {
            return Err(GattError::EncodingOverflow { value });
        }
        Ok(Self {
            centi_degrees: scaled as i16,
            unit,
        })
    }

    pub fn to_bytes(&self) -> [u8; READING_LEN] {
        let [lo, hi] = self.centi_degrees.to_le_bytes();
        [lo, hi, self.unit.ascii()]
    }

    /// Parse an encoded reading; `None` for a wrong length or unknown tag.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let [lo, hi, tag]: [u8; READING_LEN] = data.try_into().ok()?;
        let unit = match tag {
            b'C' => UnitPreference::Celsius,
            b'F' => UnitPreference::Fahrenheit,
            _ => return None,
        };
        Some(Self {
            centi_degrees: i16::from_le_bytes([lo, hi]),
            unit,
        })
    }

    /// The temperature in degrees of `self.unit`.
    pub fn degrees(&self) -> f64 {
        f64::from(self.centi_degrees) / 100.0
    }
}

/// Encode a fresh Celsius reading in the selected unit.
pub fn encode_reading(
    raw_celsius: f64,
    unit: UnitPreference,
) -> Result<[u8; READING_LEN], GattError> {
    Reading::from_celsius(raw_celsius, unit).map(|reading| reading.to_bytes())
}

/// Decode a unit write. Exactly `b"F"` selects Fahrenheit; every other
/// payload, including an empty one, selects Celsius.
pub fn decode_unit_write(payload: &[u8]) -> UnitPreference {
    if payload == [b'F'] {
        UnitPreference::Fahrenheit
    } else {
        UnitPreference::Celsius
    }
}

pub fn encode_unit_read(unit: UnitPreference) -> [u8; 1] {
    [unit.ascii()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_zero_celsius() {
        assert_eq!(
            encode_reading(0.0, UnitPreference::Celsius).unwrap(),
            [0x00, 0x00, 0x43]
        );
    }

    #[test]
    fn test_encode_fractional_celsius() {
        // 25.5 * 100 = 2550 = 0x09F6
        assert_eq!(
            encode_reading(25.5, UnitPreference::Celsius).unwrap(),
            [0xF6, 0x09, 0x43]
        );
    }

    #[test]
    fn test_encode_zero_celsius_as_fahrenheit() {
        // 32.0 F * 100 = 3200 = 0x0C80
        assert_eq!(
            encode_reading(0.0, UnitPreference::Fahrenheit).unwrap(),
            [0x80, 0x0C, 0x46]
        );
    }

    #[test]
    fn test_encode_negative_value() {
        let bytes = encode_reading(-12.25, UnitPreference::Celsius).unwrap();
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), -1225);
        assert_eq!(bytes[2], b'C');
    }

    #[test]
    fn test_scaling_truncates_toward_zero() {
        let positive = Reading::from_celsius(21.999, UnitPreference::Celsius).unwrap();
        assert_eq!(positive.centi_degrees, 2199);

        let negative = Reading::from_celsius(-21.999, UnitPreference::Celsius).unwrap();
        assert_eq!(negative.centi_degrees, -2199);
    }

    #[test]
    fn test_range_boundaries() {
        let max = Reading::from_celsius(327.67, UnitPreference::Celsius).unwrap();
        assert_eq!(max.centi_degrees, i16::MAX);

        let min = Reading::from_celsius(-327.68, UnitPreference::Celsius).unwrap();
        assert_eq!(min.centi_degrees, i16::MIN);

        assert!(matches!(
            encode_reading(327.68, UnitPreference::Celsius),
            Err(GattError::EncodingOverflow { .. })
        ));
        assert!(matches!(
            encode_reading(-327.69, UnitPreference::Celsius),
            Err(GattError::EncodingOverflow { .. })
        ));
    }

    #[test]
    fn test_fahrenheit_conversion_can_overflow() {
        // 200 C fits as Celsius but 392 F does not.
        assert!(encode_reading(200.0, UnitPreference::Celsius).is_ok());
        assert!(matches!(
            encode_reading(200.0, UnitPreference::Fahrenheit),
            Err(GattError::EncodingOverflow { .. })
        ));
    }

    #[test]
    fn test_non_finite_input_overflows() {
        assert!(encode_reading(f64::NAN, UnitPreference::Celsius).is_err());
        assert!(encode_reading(f64::INFINITY, UnitPreference::Celsius).is_err());
    }

    #[test]
    fn test_only_exact_f_selects_fahrenheit() {
        assert_eq!(decode_unit_write(b"F"), UnitPreference::Fahrenheit);

        let payloads: [&[u8]; 8] = [
            b"",
            b"C",
            b"f",
            b"FF",
            b"F\0",
            b"c",
            b"\x46\x00",
            b"Fahrenheit",
        ];
        for payload in payloads {
            assert_eq!(
                decode_unit_write(payload),
                UnitPreference::Celsius,
                "payload {:?}",
                payload
            );
        }
    }

    #[test]
    fn test_unit_read_write_symmetry() {
        for unit in [UnitPreference::Celsius, UnitPreference::Fahrenheit] {
            assert_eq!(decode_unit_write(&encode_unit_read(unit)), unit);
        }
        assert_eq!(encode_unit_read(UnitPreference::Celsius), [0x43]);
        assert_eq!(encode_unit_read(UnitPreference::Fahrenheit), [0x46]);
    }

    #[test]
    fn test_parse_encoded_reading() {
        let reading = Reading::from_bytes(&[0xF6, 0x09, 0x43]).unwrap();
        assert_eq!(reading.centi_degrees, 2550);
        assert_eq!(reading.unit, UnitPreference::Celsius);
        assert_eq!(reading.degrees(), 25.5);

        assert!(Reading::from_bytes(&[0xF6, 0x09]).is_none());
        assert!(Reading::from_bytes(&[0xF6, 0x09, b'K']).is_none());
    }
}
