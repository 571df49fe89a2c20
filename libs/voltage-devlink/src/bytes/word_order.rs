//! Word order representation for multi-register values
//!
//! Devices disagree on how a 32/64-bit quantity is laid out across 16-bit
//! registers. Register words always arrive big-endian on the wire; the
//! `WordOrder` of a mapping says how to re-order those natural bytes before
//! they are interpreted as a big-endian value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Word/byte order of a register value
///
/// # Naming Convention
/// Uses ABCD notation where:
/// - A = Most significant byte (MSB)
/// - D = Least significant byte (LSB)
///
/// For a 32-bit value `0x12345678` the registers read from the device are:
/// - `BigEndian (ABCD)`: [0x1234, 0x5678]
/// - `LittleEndian (DCBA)`: [0x7856, 0x3412]
/// - `BigEndianSwap (CDAB)`: [0x5678, 0x1234] (common on meters and PLCs)
/// - `LittleEndianSwap (BADC)`: [0x3412, 0x7856]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// ABCD: natural register order, no change
    #[default]
    #[serde(alias = "ABCD", alias = "be")]
    BigEndian,

    /// DCBA: the whole byte sequence is reversed
    #[serde(alias = "DCBA", alias = "le")]
    LittleEndian,

    /// CDAB: the two 16-bit halves of every 4-byte group are swapped
    #[serde(alias = "CDAB")]
    BigEndianSwap,

    /// BADC: every 4-byte group is reversed, then its halves are swapped
    #[serde(alias = "BADC")]
    LittleEndianSwap,
}

impl WordOrder {
    /// Get descriptive name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD (Big-Endian)",
            Self::LittleEndian => "DCBA (Little-Endian)",
            Self::BigEndianSwap => "CDAB (Big-Endian Swap)",
            Self::LittleEndianSwap => "BADC (Little-Endian Swap)",
        }
    }

    /// Check if words are swapped within 4-byte groups
    pub fn has_word_swap(&self) -> bool {
        matches!(self, Self::BigEndianSwap | Self::LittleEndianSwap)
    }

    /// Re-order natural (big-endian) register bytes in place.
    ///
    /// The transform is an involution: applying it twice restores the
    /// original sequence, so the same call serves decoding and encoding.
    ///
    /// Word-swap variants work on 4-byte groups, so a 64-bit value is
    /// handled as two independently swapped 32-bit halves. A trailing
    /// 2-byte group (single register) is left alone by `BigEndianSwap`
    /// and byte-swapped by `LittleEndianSwap`.
    pub fn apply(&self, bytes: &mut [u8]) {
        match self {
            Self::BigEndian => {},
            Self::LittleEndian => bytes.reverse(),
            Self::BigEndianSwap => {
                for group in bytes.chunks_mut(4) {
                    if group.len() == 4 {
                        group.swap(0, 2);
                        group.swap(1, 3);
                    }
                }
            },
            Self::LittleEndianSwap => {
                for group in bytes.chunks_mut(4) {
                    if group.len() == 4 {
                        group.reverse();
                        group.swap(0, 2);
                        group.swap(1, 3);
                    } else {
                        group.reverse();
                    }
                }
            },
        }
    }
}

impl FromStr for WordOrder {
    type Err = String;

    /// Parse from configuration strings
    ///
    /// - "ABCD", "AB-CD", "BE", "BIG_ENDIAN" → BigEndian
    /// - "DCBA", "LE", "LITTLE_ENDIAN" → LittleEndian
    /// - "CDAB", "BIG_ENDIAN_SWAP" → BigEndianSwap
    /// - "BADC", "LITTLE_ENDIAN_SWAP" → LittleEndianSwap
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIG_ENDIAN" | "BIGENDIAN" | "ABCDEFGH" => Ok(Self::BigEndian),
            "DCBA" | "LE" | "LITTLE_ENDIAN" | "LITTLEENDIAN" | "HGFEDCBA" => {
                Ok(Self::LittleEndian)
            },
            "CDAB" | "BIG_ENDIAN_SWAP" | "BIGENDIANSWAP" => Ok(Self::BigEndianSwap),
            "BADC" | "LITTLE_ENDIAN_SWAP" | "LITTLEENDIANSWAP" => Ok(Self::LittleEndianSwap),
            _ => Err(format!("unknown word order: {s}")),
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
