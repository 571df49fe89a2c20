//! Register ↔ byte conversions
//!
//! Provides functions for converting between:
//! - Register arrays (u16[]) ↔ natural big-endian byte sequences
//! - Packed coil bytes ↔ one-word-per-bit register arrays
//! - Single bits inside a register

// ============================================================================
// Register ↔ Bytes
// ============================================================================

/// Concatenate registers into their natural (big-endian) byte sequence
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// Split a byte sequence back into big-endian registers.
///
/// An odd trailing byte is padded with zero in the low half.
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| match *pair {
            [hi, lo] => u16::from_be_bytes([hi, lo]),
            [hi] => u16::from_be_bytes([hi, 0]),
            _ => 0,
        })
        .collect()
}

// ============================================================================
// Bit Operations
// ============================================================================

/// Extract a single bit (0 = LSB) from a register
pub fn get_bit(word: u16, bit: u8) -> bool {
    bit < 16 && (word >> bit) & 0x01 == 1
}

/// Unpack coil/discrete-input status bytes into one word per bit.
///
/// Bits are packed LSB first; only the first `count` bits are returned.
pub fn unpack_bits(packed: &[u8], count: usize) -> Vec<u16> {
    (0..count)
        .map(|i| {
            let byte = packed.get(i / 8).copied().unwrap_or(0);
            u16::from((byte >> (i % 8)) & 0x01)
        })
        .collect()
}
