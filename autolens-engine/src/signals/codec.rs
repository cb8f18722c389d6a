//! Signal bit-field codec
//!
//! Extracts and inserts signal bit-fields in a CAN payload and converts
//! between raw integers and physical values.
//!
//! Bit positions use the DBC numbering `byte_index * 8 + bit_in_byte`, with
//! bit 0 being the least significant bit of a byte.
//!
//! - Little-endian (Intel) signals start at their LSB and walk upward.
//! - Big-endian (Motorola) signals start at their MSB and walk toward bit 0
//!   of the byte, then continue at bit 7 of the next byte (the "sawtooth").

use crate::signals::database::{ByteOrder, SignalDefinition, ValueType};

/// Walk the bit positions of a signal, most significant bit last for Intel
/// and first for Motorola. `f` receives `(result_bit, position)`.
fn walk_bits(signal: &SignalDefinition, mut f: impl FnMut(usize, usize) -> bool) {
    let length = signal.length as usize;
    let mut pos = signal.start_bit as usize;
    for i in 0..length {
        let result_bit = match signal.byte_order {
            ByteOrder::LittleEndian => i,
            ByteOrder::BigEndian => length - 1 - i,
        };
        if !f(result_bit, pos) {
            return;
        }
        pos = match signal.byte_order {
            ByteOrder::LittleEndian => pos + 1,
            ByteOrder::BigEndian if pos % 8 == 0 => pos + 15,
            ByteOrder::BigEndian => pos - 1,
        };
    }
}

/// Number of bytes a payload needs to hold the whole signal
///
/// # Example
/// ```
/// use autolens_engine::signals::{codec, ByteOrder, SignalDefinition};
///
/// let motorola = SignalDefinition::new("Steer", 7, 16).with_byte_order(ByteOrder::BigEndian);
/// assert_eq!(codec::required_bytes(&motorola), 2);
/// ```
pub fn required_bytes(signal: &SignalDefinition) -> usize {
    let mut highest = 0usize;
    let mut any = false;
    walk_bits(signal, |_, pos| {
        highest = highest.max(pos);
        any = true;
        true
    });
    if any {
        highest / 8 + 1
    } else {
        0
    }
}

/// Extract the unsigned bit pattern of a signal
///
/// Returns 0 when the signal extends past `data`.
pub fn extract_bits(signal: &SignalDefinition, data: &[u8]) -> u64 {
    if signal.length == 0 || signal.length > 64 {
        return 0;
    }
    let mut result: u64 = 0;
    let mut truncated = false;
    walk_bits(signal, |result_bit, pos| {
        let byte_idx = pos / 8;
        if byte_idx >= data.len() {
            truncated = true;
            return false;
        }
        let bit = (data[byte_idx] >> (pos % 8)) & 0x01;
        result |= (bit as u64) << result_bit;
        true
    });

    if truncated {
        log::trace!(
            "Signal '{}' extends past {}-byte payload",
            signal.name,
            data.len()
        );
        return 0;
    }
    result
}

/// Extract the raw integer of a signal, sign-extended for signed types
pub fn extract(signal: &SignalDefinition, data: &[u8]) -> i64 {
    let bits = extract_bits(signal, data);
    match signal.value_type {
        ValueType::Signed => sign_extend(bits, signal.length as usize),
        _ => bits as i64,
    }
}

/// Write `raw` into the signal's footprint
///
/// Only the signal's own bits change. Returns false and leaves `data`
/// untouched if the signal does not fit.
pub fn insert(signal: &SignalDefinition, data: &mut [u8], raw: u64) -> bool {
    if signal.length == 0 || signal.length > 64 || required_bytes(signal) > data.len() {
        return false;
    }
    let raw = raw & mask(signal.length as usize);
    walk_bits(signal, |result_bit, pos| {
        let byte_idx = pos / 8;
        let bit_mask = 1u8 << (pos % 8);
        if (raw >> result_bit) & 0x01 != 0 {
            data[byte_idx] |= bit_mask;
        } else {
            data[byte_idx] &= !bit_mask;
        }
        true
    });
    true
}

/// Decode the physical value of a signal
pub fn decode(signal: &SignalDefinition, data: &[u8]) -> f64 {
    let bits = extract_bits(signal, data);
    raw_bits_to_physical(signal, bits)
}

/// Convert an extracted bit pattern to a physical value
pub fn raw_bits_to_physical(signal: &SignalDefinition, bits: u64) -> f64 {
    match signal.value_type {
        ValueType::Float32 if signal.length == 32 => f32::from_bits(bits as u32) as f64,
        ValueType::Float64 if signal.length == 64 => f64::from_bits(bits),
        ValueType::Signed => {
            sign_extend(bits, signal.length as usize) as f64 * signal.factor + signal.offset
        }
        _ => bits as f64 * signal.factor + signal.offset,
    }
}

/// Convert a physical value to the bit pattern to insert
///
/// Integer types round to nearest and saturate at the raw range.
pub fn physical_to_raw_bits(signal: &SignalDefinition, physical: f64) -> u64 {
    let length = signal.length as usize;
    match signal.value_type {
        ValueType::Float32 if length == 32 => (physical as f32).to_bits() as u64,
        ValueType::Float64 if length == 64 => physical.to_bits(),
        ValueType::Signed => {
            let raw = to_raw(signal, physical);
            let (lo, hi) = signed_range(length);
            (raw.clamp(lo as f64, hi as f64) as i64) as u64 & mask(length)
        }
        _ => {
            let raw = to_raw(signal, physical);
            raw.clamp(0.0, mask(length) as f64) as u64
        }
    }
}

/// Encode a physical value into the payload
pub fn encode(signal: &SignalDefinition, data: &mut [u8], physical: f64) -> bool {
    insert(signal, data, physical_to_raw_bits(signal, physical))
}

fn to_raw(signal: &SignalDefinition, physical: f64) -> f64 {
    let factor = if signal.factor == 0.0 { 1.0 } else { signal.factor };
    ((physical - signal.offset) / factor).round()
}

fn mask(length: usize) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

fn signed_range(length: usize) -> (i64, i64) {
    if length >= 64 {
        (i64::MIN, i64::MAX)
    } else {
        let half = 1i64 << (length - 1);
        (-half, half - 1)
    }
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bits: usize) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touched_bits(signal: &SignalDefinition, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        insert(signal, &mut data, u64::MAX);
        data
    }

    #[test]
    fn test_intel_extraction() {
        let rpm = SignalDefinition::new("EngineRPM", 0, 16).with_scaling(0.25, 0.0);
        let data = [0xA0, 0x0F, 0x54, 0, 0, 0, 0, 0];
        assert_eq!(extract(&rpm, &data), 0x0FA0);
        assert_eq!(decode(&rpm, &data), 1000.0);
    }

    #[test]
    fn test_motorola_signed_extraction() {
        let steer = SignalDefinition::new("SteerAngle", 7, 16)
            .with_byte_order(ByteOrder::BigEndian)
            .with_value_type(ValueType::Signed)
            .with_scaling(0.1, 0.0);
        let data = [0xFE, 0x0C, 0, 0, 0, 0, 0, 0];
        assert_eq!(extract_bits(&steer, &data), 0xFE0C);
        assert_eq!(extract(&steer, &data), -500);
        assert!((decode(&steer, &data) + 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_motorola_start_23_reads_bytes_two_and_three() {
        let steer = SignalDefinition::new("SteerAngle", 23, 16)
            .with_byte_order(ByteOrder::BigEndian)
            .with_value_type(ValueType::Signed);
        let data = [0, 0, 0xFE, 0x0C, 0, 0, 0, 0];
        assert_eq!(extract(&steer, &data), -500);
    }

    #[test]
    fn test_motorola_unaligned() {
        // 12 bits: MSB at bit 3 of byte 0, then all of byte 1
        let sig = SignalDefinition::new("Odd", 3, 12).with_byte_order(ByteOrder::BigEndian);
        let data = [0x0A, 0xBC];
        assert_eq!(extract_bits(&sig, &data), 0xABC);
        assert_eq!(required_bytes(&sig), 2);
    }

    #[test]
    fn test_truncated_frame_returns_zero() {
        let sig = SignalDefinition::new("Far", 56, 8);
        assert_eq!(extract(&sig, &[0xFF; 4]), 0);
    }

    #[test]
    fn test_insert_only_touches_footprint() {
        let sig = SignalDefinition::new("Mid", 10, 5);
        let mut data = [0xFFu8; 4];
        assert!(insert(&sig, &mut data, 0));
        assert_eq!(data, [0xFF, 0x83, 0xFF, 0xFF]);

        let footprint = touched_bits(&sig, 4);
        assert_eq!(footprint, vec![0x00, 0x7C, 0x00, 0x00]);
    }

    #[test]
    fn test_insert_extract_round_trip() {
        let signals = [
            SignalDefinition::new("LE", 3, 11),
            SignalDefinition::new("BE", 13, 11).with_byte_order(ByteOrder::BigEndian),
            SignalDefinition::new("SBE", 39, 9)
                .with_byte_order(ByteOrder::BigEndian)
                .with_value_type(ValueType::Signed),
        ];
        for sig in &signals {
            for raw in [0u64, 1, 0x55, 0x1FF] {
                let mut data = [0u8; 8];
                assert!(insert(sig, &mut data, raw));
                assert_eq!(extract_bits(sig, &data), raw & mask(sig.length as usize), "{}", sig.name);
            }
        }
    }

    #[test]
    fn test_float_signals() {
        let f32_sig = SignalDefinition::new("Temp", 0, 32).with_value_type(ValueType::Float32);
        let mut data = [0u8; 8];
        assert!(encode(&f32_sig, &mut data, -12.5));
        assert_eq!(decode(&f32_sig, &data), -12.5);

        let f64_sig = SignalDefinition::new("Precise", 0, 64).with_value_type(ValueType::Float64);
        assert!(encode(&f64_sig, &mut data, 1234.000001));
        assert_eq!(decode(&f64_sig, &data), 1234.000001);
    }

    #[test]
    fn test_physical_to_raw_rounds_and_saturates() {
        let sig = SignalDefinition::new("Throttle", 0, 8).with_scaling(0.5, 0.0);
        assert_eq!(physical_to_raw_bits(&sig, 42.2), 84);
        assert_eq!(physical_to_raw_bits(&sig, 500.0), 255);
        assert_eq!(physical_to_raw_bits(&sig, -3.0), 0);

        let signed = SignalDefinition::new("Steer", 0, 16)
            .with_value_type(ValueType::Signed)
            .with_scaling(0.1, 0.0);
        assert_eq!(physical_to_raw_bits(&signed, -50.0), 0xFE0C);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0x8, 4), -8);
    }
}
