//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Wire protocol codecs and register-group planning."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Register descriptors and the shared value decoder.

use crate::{ProtocolError, Result};

/// On-wire representation of one readable quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U16,
    I16,
    U32,
    I32,
    /// Eight registers interpreted as a 16-byte ASCII field.
    Ascii8,
    /// Enumerated code; never scaled.
    Code,
    /// Bit-packed flags; never scaled.
    Bitfield,
    /// Raw hex word (firmware revisions etc.); never scaled.
    Hex,
}

impl WireType {
    /// Number of 16-bit registers the type occupies.
    pub const fn word_count(&self) -> u16 {
        match self {
            WireType::U32 | WireType::I32 => 2,
            WireType::Ascii8 => 8,
            _ => 1,
        }
    }

    /// Whether the scale factor applies.
    pub const fn is_scalable(&self) -> bool {
        !matches!(self, WireType::Code | WireType::Bitfield | WireType::Hex)
    }
}

/// Modbus function space a register lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterFunction {
    /// FC04.
    Input,
    /// FC03.
    Holding,
}

impl RegisterFunction {
    pub const fn function_code(&self) -> u8 {
        match self {
            RegisterFunction::Holding => 0x03,
            RegisterFunction::Input => 0x04,
        }
    }
}

/// Polling tier. Critical registers are read every cycle even when a
/// device needs its request count trimmed; summary registers may be
/// sampled less often by a plugin under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPriority {
    #[default]
    Critical,
    Summary,
}

/// Word order for 32-bit quantities. Most devices put the high word first;
/// EG4-style firmware swaps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Describes one readable quantity on a device.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDescriptor {
    /// Raw device key, translated to a StandardKey by the owning plugin.
    pub key: &'static str,
    pub address: u16,
    pub wire: WireType,
    pub scale: f64,
    pub unit: &'static str,
    /// Read once per connection instead of every cycle.
    pub is_static: bool,
    pub priority: ReadPriority,
    pub function: RegisterFunction,
}

impl RegisterDescriptor {
    pub const fn new(key: &'static str, address: u16, wire: WireType) -> Self {
        Self {
            key,
            address,
            wire,
            scale: 1.0,
            unit: "",
            is_static: false,
            priority: ReadPriority::Critical,
            function: RegisterFunction::Input,
        }
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = unit;
        self
    }

    pub const fn statik(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub const fn summary(mut self) -> Self {
        self.priority = ReadPriority::Summary;
        self
    }

    pub const fn holding(mut self) -> Self {
        self.function = RegisterFunction::Holding;
        self
    }

    pub const fn word_count(&self) -> u16 {
        self.wire.word_count()
    }

    fn should_scale(&self) -> bool {
        self.wire.is_scalable()
            && !matches!(self.unit, "code" | "bitfield" | "hex")
            && (self.scale - 1.0).abs() > 1e-9
    }
}

/// A decoded register value before plugin-level standardisation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Int(i) => Some(*i as f64),
            RawValue::Float(f) => Some(*f),
            RawValue::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            RawValue::Int(i) if (0..=u16::MAX as i64).contains(i) => Some(*i as u16),
            _ => None,
        }
    }
}

/// Decode one value from the raw words starting at the descriptor's offset
/// within its read group.
pub fn decode_register(
    desc: &RegisterDescriptor,
    words: &[u16],
    order: WordOrder,
) -> Result<RawValue> {
    let needed = desc.word_count() as usize;
    if words.len() < needed {
        return Err(ProtocolError::Decode(format!(
            "{}: need {} words, got {}",
            desc.key,
            needed,
            words.len()
        )));
    }

    let value = match desc.wire {
        WireType::U16 => RawValue::Int(words[0] as i64),
        WireType::I16 => RawValue::Int(words[0] as i16 as i64),
        WireType::U32 => {
            let (hi, lo) = order_words(words[0], words[1], order);
            RawValue::Int(((hi as u32) << 16 | lo as u32) as i64)
        }
        WireType::I32 => {
            let (hi, lo) = order_words(words[0], words[1], order);
            RawValue::Int(((hi as u32) << 16 | lo as u32) as i32 as i64)
        }
        WireType::Ascii8 => {
            let mut bytes = Vec::with_capacity(16);
            for word in &words[..8] {
                bytes.extend_from_slice(&word.to_be_bytes());
            }
            let trimmed = trim_ascii_trailer(&bytes);
            let text: String = trimmed
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect();
            RawValue::Text(text)
        }
        WireType::Code | WireType::Bitfield | WireType::Hex => RawValue::Int(words[0] as i64),
    };

    match value {
        RawValue::Int(i) if desc.should_scale() => Ok(RawValue::Float(i as f64 * desc.scale)),
        other => Ok(other),
    }
}

/// Encode a value back into registers. The inverse of [`decode_register`];
/// exercised by the codec round-trip tests and the simulated device used
/// in plugin tests.
pub fn encode_register(
    desc: &RegisterDescriptor,
    value: &RawValue,
    order: WordOrder,
) -> Result<Vec<u16>> {
    let unscaled: i64 = match value {
        RawValue::Float(f) if desc.should_scale() => (f / desc.scale).round() as i64,
        RawValue::Float(f) => f.round() as i64,
        RawValue::Int(i) => *i,
        RawValue::Text(text) => {
            if !matches!(desc.wire, WireType::Ascii8) {
                return Err(ProtocolError::Decode(format!(
                    "{}: text value for non-ascii register",
                    desc.key
                )));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(16, 0);
            return Ok(bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect());
        }
    };

    let words = match desc.wire {
        WireType::U16 | WireType::Code | WireType::Bitfield | WireType::Hex => {
            vec![unscaled as u16]
        }
        WireType::I16 => vec![unscaled as i16 as u16],
        WireType::U32 | WireType::I32 => {
            let raw = unscaled as u32;
            let (hi, lo) = ((raw >> 16) as u16, raw as u16);
            match order {
                WordOrder::BigEndian => vec![hi, lo],
                WordOrder::LittleEndian => vec![lo, hi],
            }
        }
        WireType::Ascii8 => {
            return Err(ProtocolError::Decode(format!(
                "{}: numeric value for ascii register",
                desc.key
            )))
        }
    };
    Ok(words)
}

fn order_words(first: u16, second: u16, order: WordOrder) -> (u16, u16) {
    match order {
        WordOrder::BigEndian => (first, second),
        WordOrder::LittleEndian => (second, first),
    }
}

fn trim_ascii_trailer(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], 0 | b' ' | b'\t' | b'\r' | b'\n') {
        end -= 1;
    }
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn desc(wire: WireType) -> RegisterDescriptor {
        RegisterDescriptor::new("test", 0, wire)
    }

    #[test]
    fn u32_big_endian_words() {
        let d = desc(WireType::U32);
        let value = decode_register(&d, &[0x1234, 0x5678], WordOrder::BigEndian).unwrap();
        assert_eq!(value, RawValue::Int(0x1234_5678));
    }

    #[test]
    fn u32_little_endian_words() {
        let d = desc(WireType::U32);
        let value = decode_register(&d, &[0x5678, 0x1234], WordOrder::LittleEndian).unwrap();
        assert_eq!(value, RawValue::Int(0x1234_5678));
    }

    #[test]
    fn i16_two_complement() {
        let d = desc(WireType::I16);
        assert_eq!(
            decode_register(&d, &[0xFFFF], WordOrder::BigEndian).unwrap(),
            RawValue::Int(-1)
        );
    }

    #[test]
    fn i32_negative() {
        let d = desc(WireType::I32);
        let words = encode_register(&d, &RawValue::Int(-2500), WordOrder::BigEndian).unwrap();
        assert_eq!(
            decode_register(&d, &words, WordOrder::BigEndian).unwrap(),
            RawValue::Int(-2500)
        );
    }

    #[test]
    fn scaling_applies_to_numeric_units_only() {
        let scaled = RegisterDescriptor::new("v", 0, WireType::U16).scale(0.1).unit("V");
        assert_eq!(
            decode_register(&scaled, &[235], WordOrder::BigEndian).unwrap(),
            RawValue::Float(23.5)
        );

        // A code register keeps the raw word even with a scale configured.
        let code = RegisterDescriptor::new("c", 0, WireType::Code).scale(0.1).unit("code");
        assert_eq!(
            decode_register(&code, &[235], WordOrder::BigEndian).unwrap(),
            RawValue::Int(235)
        );
    }

    #[test]
    fn ascii8_strips_trailer() {
        let d = desc(WireType::Ascii8);
        let words = encode_register(&d, &RawValue::Text("SN1234".into()), WordOrder::BigEndian)
            .unwrap();
        assert_eq!(words.len(), 8);
        assert_eq!(
            decode_register(&d, &words, WordOrder::BigEndian).unwrap(),
            RawValue::Text("SN1234".into())
        );
    }

    #[test]
    fn ascii8_replaces_non_ascii() {
        let d = desc(WireType::Ascii8);
        let mut words = vec![0u16; 8];
        words[0] = u16::from_be_bytes([b'A', 0xFF]);
        let RawValue::Text(text) = decode_register(&d, &words, WordOrder::BigEndian).unwrap()
        else {
            panic!("expected text");
        };
        assert_eq!(text, format!("A{}", char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn round_trip_all_numeric_types() {
        for (wire, value) in [
            (WireType::U16, RawValue::Int(65535)),
            (WireType::I16, RawValue::Int(-32768)),
            (WireType::U32, RawValue::Int(305419896)),
            (WireType::I32, RawValue::Int(-305419896)),
            (WireType::Code, RawValue::Int(42)),
            (WireType::Bitfield, RawValue::Int(0b1010)),
            (WireType::Hex, RawValue::Int(0xBEEF)),
        ] {
            for order in [WordOrder::BigEndian, WordOrder::LittleEndian] {
                let d = desc(wire);
                let words = encode_register(&d, &value, order).unwrap();
                assert_eq!(decode_register(&d, &words, order).unwrap(), value, "{wire:?}");
            }
        }
    }

    #[test]
    fn short_word_slice_is_a_decode_error() {
        let d = desc(WireType::U32);
        assert!(decode_register(&d, &[1], WordOrder::BigEndian).is_err());
    }
}
