//! Register mapping definitions
//!
//! A `RegisterMapping` describes where a value lives on a device and how the
//! raw register words are turned into an engineering value. Mappings are
//! owned by configuration and only borrowed by the connection manager.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bytes::WordOrder;
use crate::error::{DevLinkError, Result};
use crate::transport::frame::FunctionCode;

/// Longest text value a single read can carry (registers)
pub const MAX_TEXT_REGISTERS: u16 = 125;

// ============================================================================
// Register Kind
// ============================================================================

/// Register access class (address space) on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Read/write single bit
    #[serde(alias = "coils")]
    Coil,
    /// Read-only single bit
    #[serde(alias = "discrete")]
    DiscreteInput,
    /// Read/write 16-bit register
    #[default]
    #[serde(alias = "holding_register")]
    Holding,
    /// Read-only 16-bit register
    #[serde(alias = "input_register")]
    Input,
}

impl RegisterKind {
    /// Function code used to read this address space
    pub fn read_function(&self) -> FunctionCode {
        match self {
            RegisterKind::Coil => FunctionCode::ReadCoils,
            RegisterKind::DiscreteInput => FunctionCode::ReadDiscreteInputs,
            RegisterKind::Holding => FunctionCode::ReadHoldingRegisters,
            RegisterKind::Input => FunctionCode::ReadInputRegisters,
        }
    }

    /// Bit-addressed spaces (coils, discrete inputs)
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Whether the device accepts writes in this space
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Holding)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterKind::Coil => write!(f, "coil"),
            RegisterKind::DiscreteInput => write!(f, "discrete_input"),
            RegisterKind::Holding => write!(f, "holding"),
            RegisterKind::Input => write!(f, "input"),
        }
    }
}

// ============================================================================
// Data Type
// ============================================================================

/// Data width and interpretation of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "u16")]
    Uint16,
    #[serde(alias = "i16")]
    Int16,
    #[serde(alias = "u32")]
    Uint32,
    #[serde(alias = "i32")]
    Int32,
    #[serde(alias = "u64")]
    Uint64,
    #[serde(alias = "i64")]
    Int64,
    #[serde(alias = "f32", alias = "float")]
    Float32,
    #[serde(alias = "f64", alias = "double")]
    Float64,
    /// Fixed-length ASCII text, NUL padded
    #[serde(alias = "text", alias = "ascii")]
    String,
    #[serde(alias = "boolean")]
    Bool,
}

impl DataType {
    /// Number of registers the type spans, `None` for variable-length text
    pub fn fixed_width(&self) -> Option<u16> {
        match self {
            DataType::Uint16 | DataType::Int16 | DataType::Bool => Some(1),
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => Some(2),
            DataType::Uint64 | DataType::Int64 | DataType::Float64 => Some(4),
            DataType::String => None,
        }
    }

    /// Numeric types get scale/offset applied
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String | DataType::Bool)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Inclusive raw range representable by the type
    pub fn raw_range(&self) -> Option<(f64, f64)> {
        match self {
            DataType::Uint16 => Some((0.0, f64::from(u16::MAX))),
            DataType::Int16 => Some((f64::from(i16::MIN), f64::from(i16::MAX))),
            DataType::Uint32 => Some((0.0, f64::from(u32::MAX))),
            DataType::Int32 => Some((f64::from(i32::MIN), f64::from(i32::MAX))),
            DataType::Uint64 => Some((0.0, u64::MAX as f64)),
            DataType::Int64 => Some((i64::MIN as f64, i64::MAX as f64)),
            DataType::Float32 => Some((f64::from(f32::MIN), f64::from(f32::MAX))),
            DataType::Float64 => Some((f64::MIN, f64::MAX)),
            DataType::String | DataType::Bool => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Uint64 => "uint64",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Register Mapping
// ============================================================================

fn default_scale() -> f64 {
    1.0
}

/// How to read and interpret one value on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMapping {
    /// Human name, key of the poll result
    pub name: String,
    /// Protocol address (0-based)
    pub address: u16,
    /// Access class / address space
    #[serde(default)]
    pub kind: RegisterKind,
    pub data_type: DataType,
    /// Consecutive words the value spans; derived from `data_type` if absent
    #[serde(default)]
    pub register_count: Option<u16>,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    /// Bit position (0 = LSB) for `bool` values held in a 16-bit register
    #[serde(default)]
    pub bit: Option<u8>,
    /// Engineering-value bounds enforced on write
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl RegisterMapping {
    /// Holding-register mapping with identity scaling
    pub fn new(name: impl Into<String>, address: u16, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            address,
            kind: RegisterKind::Holding,
            data_type,
            register_count: None,
            word_order: WordOrder::BigEndian,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            bit: None,
            min: None,
            max: None,
        }
    }

    pub fn with_kind(mut self, kind: RegisterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_word_order(mut self, order: WordOrder) -> Self {
        self.word_order = order;
        self
    }

    pub fn with_scale(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_register_count(mut self, count: u16) -> Self {
        self.register_count = Some(count);
        self
    }

    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit = Some(bit);
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Effective register count (explicit value, else the type width)
    pub fn register_count(&self) -> u16 {
        self.register_count
            .or_else(|| self.data_type.fixed_width())
            .unwrap_or(0)
    }

    /// Quantity sent in the read request (bits for coil spaces, words otherwise)
    pub fn read_quantity(&self) -> u16 {
        if self.kind.is_bit() {
            1
        } else {
            self.register_count()
        }
    }

    /// Whether decode applies no scaling at all
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    /// Check the mapping invariants.
    ///
    /// A failure here is a configuration bug, reported as `Decode`.
    pub fn validate(&self) -> Result<()> {
        let count = self.register_count();
        match self.data_type.fixed_width() {
            Some(width) if count != width => {
                return Err(DevLinkError::decode(format!(
                    "{}: {} requires {} register(s), got {}",
                    self.name, self.data_type, width, count
                )));
            },
            None if count == 0 || count > MAX_TEXT_REGISTERS => {
                return Err(DevLinkError::decode(format!(
                    "{}: string register_count must be 1..={}, got {}",
                    self.name, MAX_TEXT_REGISTERS, count
                )));
            },
            _ => {},
        }

        if self.kind.is_bit() && self.data_type != DataType::Bool {
            return Err(DevLinkError::decode(format!(
                "{}: {} space only holds bool values, got {}",
                self.name, self.kind, self.data_type
            )));
        }

        if let Some(bit) = self.bit {
            if self.data_type != DataType::Bool || self.kind.is_bit() || bit > 15 {
                return Err(DevLinkError::decode(format!(
                    "{}: bit {} only valid for bool in a 16-bit register",
                    self.name, bit
                )));
            }
        }

        if !self.scale.is_finite() || self.scale == 0.0 || !self.offset.is_finite() {
            return Err(DevLinkError::decode(format!(
                "{}: scale must be finite and non-zero, offset finite",
                self.name
            )));
        }

        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(DevLinkError::decode(format!(
                    "{}: min {} greater than max {}",
                    self.name, min, max
                )));
            }
        }

        Ok(())
    }
}
