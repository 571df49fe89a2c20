//! Register codec
//!
//! Pure translation between raw register words and engineering values.
//! No state, no locking: safe to call from any number of tasks.
//!
//! Decoding runs in three steps:
//! 1. concatenate the words into their natural big-endian bytes
//! 2. re-order the bytes per the mapping's `WordOrder`
//! 3. interpret per `DataType`, then apply `raw * scale + offset`
//!
//! Encoding runs the same steps backwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

use crate::bytes::{bytes_to_words, get_bit, words_to_bytes};
use crate::error::{DevLinkError, Result};
use crate::mapping::{DataType, RegisterMapping};

// ============================================================================
// Register Value
// ============================================================================

/// Decoded engineering value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<f64> for RegisterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for RegisterValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for RegisterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for RegisterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for RegisterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl RegisterValue {
    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::Text(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "on" => Some(true),
                "false" | "0" | "off" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// ============================================================================
// Decode
// ============================================================================

/// Decode raw register words into an engineering value.
///
/// `words` must hold exactly `mapping.register_count()` registers. For coil
/// and discrete-input spaces the caller passes one word per bit (0 or 1).
pub fn decode(words: &[u16], mapping: &RegisterMapping) -> Result<RegisterValue> {
    mapping.validate()?;

    let expected = mapping.register_count() as usize;
    if words.len() != expected {
        return Err(DevLinkError::decode(format!(
            "{}: expected {} word(s) for {}, got {}",
            mapping.name,
            expected,
            mapping.data_type,
            words.len()
        )));
    }

    let mut bytes = words_to_bytes(words);
    mapping.word_order.apply(&mut bytes);

    let value = match mapping.data_type {
        DataType::Bool => {
            // Bits are addressed within the register as read, no re-ordering
            let word = words[0];
            let on = match mapping.bit {
                Some(bit) => get_bit(word, bit),
                None => word != 0,
            };
            RegisterValue::Bool(on)
        },
        DataType::String => RegisterValue::Text(decode_text(&bytes, mapping)?),
        DataType::Uint16 => scale_integer(i128::from(u16::from_be_bytes(take(&bytes))), mapping),
        DataType::Int16 => scale_integer(i128::from(i16::from_be_bytes(take(&bytes))), mapping),
        DataType::Uint32 => scale_integer(i128::from(u32::from_be_bytes(take(&bytes))), mapping),
        DataType::Int32 => scale_integer(i128::from(i32::from_be_bytes(take(&bytes))), mapping),
        DataType::Uint64 => scale_integer(i128::from(u64::from_be_bytes(take(&bytes))), mapping),
        DataType::Int64 => scale_integer(i128::from(i64::from_be_bytes(take(&bytes))), mapping),
        DataType::Float32 => {
            let raw = f64::from(f32::from_be_bytes(take(&bytes)));
            RegisterValue::Float(raw * mapping.scale + mapping.offset)
        },
        DataType::Float64 => {
            let raw = f64::from_be_bytes(take(&bytes));
            RegisterValue::Float(raw * mapping.scale + mapping.offset)
        },
    };

    trace!(
        "Decoded {}: words={:04X?}, order={:?}, value={}",
        mapping.name,
        words,
        mapping.word_order,
        value
    );

    Ok(value)
}

/// Copy the leading `N` bytes; callers have already checked the length
fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn scale_integer(raw: i128, mapping: &RegisterMapping) -> RegisterValue {
    if mapping.is_identity() {
        if let Ok(value) = i64::try_from(raw) {
            return RegisterValue::Integer(value);
        }
    }
    RegisterValue::Float(raw as f64 * mapping.scale + mapping.offset)
}

fn decode_text(bytes: &[u8], mapping: &RegisterMapping) -> Result<String> {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let text = &bytes[..end];

    if !text.is_ascii() {
        return Err(DevLinkError::decode(format!(
            "{}: non-ASCII bytes in string register {:02X?}",
            mapping.name, text
        )));
    }

    Ok(text.iter().map(|&b| b as char).collect())
}

// ============================================================================
// Encode
// ============================================================================

/// Encode an engineering value into register words for a write.
///
/// Rejects values outside the mapping's `min`/`max` or outside the raw
/// range of the data type.
pub fn encode(value: &RegisterValue, mapping: &RegisterMapping) -> Result<Vec<u16>> {
    mapping.validate()?;

    let mut bytes = match mapping.data_type {
        DataType::String => encode_text(value, mapping)?,
        DataType::Bool => {
            if mapping.bit.is_some() {
                return Err(DevLinkError::invalid_value(format!(
                    "{}: bit-mapped bool needs a read-modify-write",
                    mapping.name
                )));
            }
            let on = value.as_bool().ok_or_else(|| {
                DevLinkError::invalid_value(format!("{}: {} is not a bool", mapping.name, value))
            })?;
            u16::from(on).to_be_bytes().to_vec()
        },
        data_type => match value {
            // 64-bit integers do not survive a trip through f64
            RegisterValue::Integer(raw) if mapping.is_identity() && !data_type.is_float() => {
                check_bounds(*raw as f64, mapping)?;
                encode_integer(i128::from(*raw), data_type, mapping)?
            },
            _ => {
                let engineering = value.as_f64().ok_or_else(|| {
                    DevLinkError::invalid_value(format!(
                        "{}: {} is not numeric",
                        mapping.name, value
                    ))
                })?;
                check_bounds(engineering, mapping)?;
                let raw = (engineering - mapping.offset) / mapping.scale;
                encode_number(raw, data_type, mapping)?
            },
        },
    };

    mapping.word_order.apply(&mut bytes);
    Ok(bytes_to_words(&bytes))
}

/// Exact integer encoding for unscaled mappings
fn encode_integer(raw: i128, data_type: DataType, mapping: &RegisterMapping) -> Result<Vec<u8>> {
    let out_of_range = |_| {
        DevLinkError::invalid_value(format!(
            "{}: raw value {} does not fit {}",
            mapping.name, raw, data_type
        ))
    };

    let bytes = match data_type {
        DataType::Uint16 => u16::try_from(raw).map_err(out_of_range)?.to_be_bytes().to_vec(),
        DataType::Int16 => i16::try_from(raw).map_err(out_of_range)?.to_be_bytes().to_vec(),
        DataType::Uint32 => u32::try_from(raw).map_err(out_of_range)?.to_be_bytes().to_vec(),
        DataType::Int32 => i32::try_from(raw).map_err(out_of_range)?.to_be_bytes().to_vec(),
        DataType::Uint64 => u64::try_from(raw).map_err(out_of_range)?.to_be_bytes().to_vec(),
        DataType::Int64 => i64::try_from(raw).map_err(out_of_range)?.to_be_bytes().to_vec(),
        _ => return encode_number(raw as f64, data_type, mapping),
    };
    Ok(bytes)
}

fn check_bounds(value: f64, mapping: &RegisterMapping) -> Result<()> {
    if !value.is_finite() {
        return Err(DevLinkError::invalid_value(format!(
            "{}: {} is not finite",
            mapping.name, value
        )));
    }
    if let Some(min) = mapping.min {
        if value < min {
            return Err(DevLinkError::invalid_value(format!(
                "{}: {} below minimum {}",
                mapping.name, value, min
            )));
        }
    }
    if let Some(max) = mapping.max {
        if value > max {
            return Err(DevLinkError::invalid_value(format!(
                "{}: {} above maximum {}",
                mapping.name, value, max
            )));
        }
    }
    Ok(())
}

fn encode_number(raw: f64, data_type: DataType, mapping: &RegisterMapping) -> Result<Vec<u8>> {
    let raw = if data_type.is_float() { raw } else { raw.round() };

    if let Some((lo, hi)) = data_type.raw_range() {
        if raw < lo || raw > hi {
            return Err(DevLinkError::invalid_value(format!(
                "{}: raw value {} does not fit {}",
                mapping.name, raw, data_type
            )));
        }
    }

    let bytes = match data_type {
        DataType::Uint16 => (raw as u16).to_be_bytes().to_vec(),
        DataType::Int16 => (raw as i16).to_be_bytes().to_vec(),
        DataType::Uint32 => (raw as u32).to_be_bytes().to_vec(),
        DataType::Int32 => (raw as i32).to_be_bytes().to_vec(),
        DataType::Uint64 => (raw as u64).to_be_bytes().to_vec(),
        DataType::Int64 => (raw as i64).to_be_bytes().to_vec(),
        DataType::Float32 => (raw as f32).to_be_bytes().to_vec(),
        DataType::Float64 => raw.to_be_bytes().to_vec(),
        DataType::String | DataType::Bool => {
            return Err(DevLinkError::invalid_value(format!(
                "{}: {} is not numeric",
                mapping.name, data_type
            )));
        },
    };
    Ok(bytes)
}

fn encode_text(value: &RegisterValue, mapping: &RegisterMapping) -> Result<Vec<u8>> {
    let text = value.as_str().ok_or_else(|| {
        DevLinkError::invalid_value(format!("{}: {} is not text", mapping.name, value))
    })?;
    let capacity = mapping.register_count() as usize * 2;

    if !text.is_ascii() {
        return Err(DevLinkError::invalid_value(format!(
            "{}: text must be ASCII",
            mapping.name
        )));
    }
    if text.len() > capacity {
        return Err(DevLinkError::invalid_value(format!(
            "{}: {} bytes do not fit {} register(s)",
            mapping.name,
            text.len(),
            mapping.register_count()
        )));
    }

    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(capacity, 0);
    Ok(bytes)
}
