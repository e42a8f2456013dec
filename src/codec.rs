//! Conversion between raw 16-bit wire values and physical units.
//!
//! The analyzer packs most values in a base-240 layout: the high byte counts
//! multiples of 240 and the low byte carries the remainder. Capacity adds a
//! range selector in the top bits.

use crate::error::{EbcError, Result};
use crate::types::PackingKind;

fn base240(raw: u16) -> f64 {
    let [hi, lo] = raw.to_be_bytes();
    (hi as u32 * 240 + lo as u32) as f64
}

/// Decode a response slot into its physical value.
pub fn decode(raw: u16, packing: PackingKind) -> Result<f64> {
    let value = match packing {
        PackingKind::None => 0.0,
        // Only verified below 10 V, kept apart from the setpoint scale on purpose
        PackingKind::Voltage if raw == 0 => 0.0,
        PackingKind::Voltage => base240(raw) / 1000.0,
        PackingKind::VoltageSet | PackingKind::CurrentSet | PackingKind::Current if raw == 0 => 0.0,
        PackingKind::VoltageSet | PackingKind::CurrentSet | PackingKind::Current => {
            base240(raw) / 100.0
        }
        PackingKind::Capacity => decode_capacity(raw),
        PackingKind::Power | PackingKind::Time => raw as f64,
    };
    Ok(value)
}

fn decode_capacity(raw: u16) -> f64 {
    let [hi, lo] = raw.to_be_bytes();
    if raw & 0x8000 == 0 {
        // below 10 Ah
        return if raw == 0 { 0.0 } else { base240(raw) / 1000.0 };
    }
    if raw & 0xE000 == 0xE000 {
        // 200 Ah and above
        let units = (hi & 0x3F) as i32 * 240 + lo as i32 - 0x1C00;
        units as f64 / 10.0
    } else {
        let units = (hi & 0x7F) as i32 * 240 + lo as i32 - 0x0800;
        units as f64 / 100.0
    }
}

/// Encode a physical value for a command slot.
///
/// Only setpoint, power and time slots travel in commands; every other
/// packing kind has no encoder.
pub fn encode(value: f64, packing: PackingKind) -> Result<u16> {
    match packing {
        PackingKind::VoltageSet | PackingKind::CurrentSet => {
            let hundredths = (value * 100.0).round();
            if !(0.0..=u16::MAX as f64).contains(&hundredths) {
                return Err(EbcError::ValueOutOfRange { value, packing });
            }
            let hundredths = hundredths as u32;
            let raw = ((hundredths / 240) << 8) | (hundredths % 240);
            u16::try_from(raw).map_err(|_| EbcError::ValueOutOfRange { value, packing })
        }
        PackingKind::Power | PackingKind::Time => {
            if !(0.0..=u16::MAX as f64).contains(&value) {
                return Err(EbcError::ValueOutOfRange { value, packing });
            }
            Ok(value as u16)
        }
        _ => Err(EbcError::NoEncoder(packing)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_decode_measured_values() {
        // fa 0a 0023 101c 0000 0000 0023 018c 0000 09 82 f8
        assert!(approx(decode(0x0023, PackingKind::Current).unwrap(), 0.35));
        assert!(approx(decode(0x101C, PackingKind::Voltage).unwrap(), 3.868));
        assert!(approx(decode(0x018C, PackingKind::VoltageSet).unwrap(), 3.80));
        assert_eq!(decode(0x0000, PackingKind::Voltage).unwrap(), 0.0);
        assert_eq!(decode(0x0000, PackingKind::CurrentSet).unwrap(), 0.0);
    }

    #[test]
    fn test_voltage_and_setpoint_scales_differ() {
        let raw = 0x01B4;
        assert!(approx(decode(raw, PackingKind::Voltage).unwrap(), 0.42));
        assert!(approx(decode(raw, PackingKind::VoltageSet).unwrap(), 4.2));
    }

    #[test]
    fn test_decode_capacity_ranges() {
        assert!(approx(decode(0x0A64, PackingKind::Capacity).unwrap(), 2.5));
        assert!(approx(decode(0x8EBC, PackingKind::Capacity).unwrap(), 15.0));
        assert!(approx(decode(0xE844, PackingKind::Capacity).unwrap(), 250.0));
        assert_eq!(decode(0x0000, PackingKind::Capacity).unwrap(), 0.0);
    }

    #[test]
    fn test_integer_packings_are_identity() {
        assert_eq!(decode(15, PackingKind::Time).unwrap(), 15.0);
        assert_eq!(decode(11, PackingKind::Power).unwrap(), 11.0);
        assert_eq!(encode(15.0, PackingKind::Time).unwrap(), 15);
        assert_eq!(encode(11.0, PackingKind::Power).unwrap(), 11);
    }

    #[test]
    fn test_encode_setpoints() {
        assert_eq!(encode(1.0, PackingKind::CurrentSet).unwrap(), 0x0064);
        assert_eq!(encode(4.2, PackingKind::VoltageSet).unwrap(), 0x01B4);
        assert_eq!(encode(0.1, PackingKind::CurrentSet).unwrap(), 0x000A);
        assert_eq!(encode(2.5, PackingKind::VoltageSet).unwrap(), 0x010A);
        assert_eq!(encode(0.35, PackingKind::CurrentSet).unwrap(), 0x0023);
    }

    #[test]
    fn test_encode_unsupported_packing() {
        assert!(matches!(
            encode(1.0, PackingKind::Voltage),
            Err(EbcError::NoEncoder(PackingKind::Voltage))
        ));
        assert!(matches!(
            encode(1.0, PackingKind::Capacity),
            Err(EbcError::NoEncoder(PackingKind::Capacity))
        ));
        assert!(matches!(
            encode(-1.0, PackingKind::VoltageSet),
            Err(EbcError::ValueOutOfRange { .. })
        ));
    }

    proptest! {
        #[test]
        fn setpoints_survive_the_wire(hundredths in 0u32..=6000) {
            let value = hundredths as f64 / 100.0;
            for packing in [PackingKind::VoltageSet, PackingKind::CurrentSet] {
                let raw = encode(value, packing).unwrap();
                let decoded = decode(raw, packing).unwrap();
                prop_assert!((decoded - value).abs() < 0.005);
            }
        }

        #[test]
        fn low_byte_never_reaches_240(hundredths in 0u32..=6000) {
            let raw = encode(hundredths as f64 / 100.0, PackingKind::VoltageSet).unwrap();
            prop_assert!((raw & 0xFF) < 240);
        }
    }
}
