//! Wire framing
//!
//! Request/response PDUs plus the two envelopes a PDU travels in:
//!
//! - TCP: MBAP header `[tid:2][proto:2][len:2][unit:1]` followed by the PDU
//! - Serial: `[unit:1]` + PDU + CRC-16/MODBUS (little-endian)
//!
//! Exception responses carry `function | 0x80` followed by one exception
//! byte. They are device answers, not transport failures.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::Serialize;
use std::fmt;

use crate::bytes::unpack_bits;
use crate::error::{DevLinkError, Result};

/// MBAP header length including the unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU the protocol allows
pub const MAX_PDU_LEN: usize = 253;

/// Register limit of a single read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Bit limit of a single coil/discrete read
pub const MAX_READ_BITS: u16 = 2000;

/// Register limit of a single write-multiple request
pub const MAX_WRITE_REGISTERS: u16 = 123;

const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// ============================================================================
// Function / Exception Codes
// ============================================================================

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Reads answer with a byte count followed by data
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    pub fn is_bit_read(self) -> bool {
        matches!(self, Self::ReadCoils | Self::ReadDiscreteInputs)
    }
}

impl fmt::UpperHex for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.as_u8(), f)
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02X}", self.as_u8())
    }
}

/// Exception codes a device may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetFailed => 0x0B,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("illegal function"),
            Self::IllegalDataAddress => f.write_str("illegal data address"),
            Self::IllegalDataValue => f.write_str("illegal data value"),
            Self::ServerDeviceFailure => f.write_str("server device failure"),
            Self::Acknowledge => f.write_str("acknowledge"),
            Self::ServerDeviceBusy => f.write_str("server device busy"),
            Self::GatewayPathUnavailable => f.write_str("gateway path unavailable"),
            Self::GatewayTargetFailed => f.write_str("gateway target failed to respond"),
            Self::Unknown(code) => write!(f, "exception 0x{code:02X}"),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A request PDU
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Read {
        function: FunctionCode,
        address: u16,
        quantity: u16,
    },
    WriteSingleRegister {
        address: u16,
        value: u16,
    },
    WriteSingleCoil {
        address: u16,
        on: bool,
    },
    WriteMultipleRegisters {
        address: u16,
        values: Vec<u16>,
    },
}

impl Request {
    /// Build a read request, checking the per-request quantity limits
    pub fn read(function: FunctionCode, address: u16, quantity: u16) -> Result<Self> {
        if !function.is_read() {
            return Err(DevLinkError::config(format!("{function} is not a read")));
        }
        let limit = if function.is_bit_read() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        };
        if quantity == 0 || quantity > limit {
            return Err(DevLinkError::config(format!(
                "{function} quantity must be 1..={limit}, got {quantity}"
            )));
        }
        Ok(Self::Read {
            function,
            address,
            quantity,
        })
    }

    pub fn write_multiple(address: u16, values: Vec<u16>) -> Result<Self> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(DevLinkError::config(format!(
                "write quantity must be 1..={MAX_WRITE_REGISTERS}, got {}",
                values.len()
            )));
        }
        Ok(Self::WriteMultipleRegisters { address, values })
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Self::Read { function, .. } => *function,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Append the PDU bytes to `buf`
    pub fn encode_pdu(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function().as_u8());
        match self {
            Self::Read {
                address, quantity, ..
            } => {
                buf.put_u16(*address);
                buf.put_u16(*quantity);
            },
            Self::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            },
            Self::WriteSingleCoil { address, on } => {
                buf.put_u16(*address);
                buf.put_u16(if *on { 0xFF00 } else { 0x0000 });
            },
            Self::WriteMultipleRegisters { address, values } => {
                buf.put_u16(*address);
                buf.put_u16(values.len() as u16);
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            },
        }
    }

    pub fn pdu_len(&self) -> usize {
        match self {
            Self::WriteMultipleRegisters { values, .. } => 6 + values.len() * 2,
            _ => 5,
        }
    }

    /// Validate a response PDU against this request.
    ///
    /// Reads return one word per register (or per bit for coil spaces);
    /// writes return an empty vector once the echo checks out.
    pub fn parse_response(&self, pdu: &[u8]) -> Result<Vec<u16>> {
        let function = self.function();
        let Some(&code) = pdu.first() else {
            return Err(DevLinkError::invalid_response("empty PDU"));
        };

        if code == function.as_u8() | EXCEPTION_FLAG {
            let exception = pdu.get(1).copied().ok_or_else(|| {
                DevLinkError::invalid_response("exception response without code")
            })?;
            return Err(DevLinkError::Protocol {
                function,
                exception: ExceptionCode::from_u8(exception),
            });
        }
        if code != function.as_u8() {
            return Err(DevLinkError::invalid_response(format!(
                "function mismatch: sent {function}, got 0x{code:02X}"
            )));
        }

        match self {
            Self::Read { quantity, .. } => {
                let byte_count = *pdu
                    .get(1)
                    .ok_or_else(|| DevLinkError::invalid_response("missing byte count"))?
                    as usize;
                let data = &pdu[2..];
                if data.len() != byte_count {
                    return Err(DevLinkError::invalid_response(format!(
                        "byte count {} but {} data bytes",
                        byte_count,
                        data.len()
                    )));
                }

                let quantity = *quantity as usize;
                if function.is_bit_read() {
                    if byte_count != quantity.div_ceil(8) {
                        return Err(DevLinkError::invalid_response(format!(
                            "expected {} status bytes for {} bits, got {}",
                            quantity.div_ceil(8),
                            quantity,
                            byte_count
                        )));
                    }
                    Ok(unpack_bits(data, quantity))
                } else {
                    if byte_count != quantity * 2 {
                        return Err(DevLinkError::invalid_response(format!(
                            "expected {} bytes for {} registers, got {}",
                            quantity * 2,
                            quantity,
                            byte_count
                        )));
                    }
                    Ok(data
                        .chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect())
                }
            },
            _ => {
                let mut expected = BytesMut::with_capacity(self.pdu_len());
                self.encode_pdu(&mut expected);
                // Writes echo function, address and value/quantity
                if pdu.len() != 5 || pdu[..5] != expected[..5] {
                    return Err(DevLinkError::invalid_response(format!(
                        "write echo mismatch: sent {:02X?}, got {:02X?}",
                        &expected[..5],
                        pdu
                    )));
                }
                Ok(Vec::new())
            },
        }
    }
}

// ============================================================================
// TCP (MBAP)
// ============================================================================

/// MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn decode(raw: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
            protocol_id: u16::from_be_bytes([raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
            unit_id: raw[6],
        }
    }

    /// Length of the PDU that follows the header
    pub fn pdu_len(&self) -> Result<usize> {
        if self.protocol_id != 0 {
            return Err(DevLinkError::invalid_response(format!(
                "invalid protocol id {}",
                self.protocol_id
            )));
        }
        let len = self.length as usize;
        if len < 2 || len - 1 > MAX_PDU_LEN {
            return Err(DevLinkError::invalid_response(format!(
                "invalid MBAP length {len}"
            )));
        }
        Ok(len - 1)
    }
}

/// Build a complete TCP frame
pub fn encode_tcp(transaction_id: u16, unit_id: u8, request: &Request) -> BytesMut {
    let pdu_len = request.pdu_len();
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu_len);
    buf.put_u16(transaction_id);
    buf.put_u16(0);
    buf.put_u16((pdu_len + 1) as u16);
    buf.put_u8(unit_id);
    request.encode_pdu(&mut buf);
    buf
}

// ============================================================================
// Serial (RTU)
// ============================================================================

/// Build a complete serial frame
pub fn encode_rtu(unit_id: u8, request: &Request) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + request.pdu_len() + 2);
    buf.put_u8(unit_id);
    request.encode_pdu(&mut buf);
    let crc = CRC_MODBUS.checksum(&buf);
    buf.put_u16_le(crc);
    buf
}

/// Check the CRC of a serial frame and split it into unit id and PDU
pub fn decode_rtu(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < 4 {
        return Err(DevLinkError::invalid_response("RTU frame too short"));
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    let calculated = CRC_MODBUS.checksum(body);
    if received != calculated {
        return Err(DevLinkError::invalid_response(format!(
            "CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
        )));
    }
    Ok((body[0], &body[1..]))
}

/// Bytes still to read after the first three of a serial response
/// (`unit`, `function`, and the byte count or first data byte)
pub fn rtu_remaining_len(head: [u8; 3]) -> usize {
    let [_, function, third] = head;
    if function & EXCEPTION_FLAG != 0 {
        // exception code already read, CRC left
        return 2;
    }
    match FunctionCode::from_u8(function) {
        Some(fc) if fc.is_read() => third as usize + 2,
        // write echo: 4 bytes after the function code, plus CRC
        _ => 3 + 2,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_tcp_read() {
        let request = Request::read(FunctionCode::ReadHoldingRegisters, 0x006B, 3).unwrap();
        let frame = encode_tcp(0x0001, 0x11, &request);
        assert_eq!(
            &frame[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_encode_write_multiple() {
        let request = Request::write_multiple(0x0001, vec![0x000A, 0x0102]).unwrap();
        let frame = encode_tcp(7, 1, &request);
        assert_eq!(
            &frame[..],
            &[
                0x00, 0x07, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04,
                0x00, 0x0A, 0x01, 0x02
            ]
        );
    }

    #[test]
    fn test_rtu_crc_known_frame() {
        // Read holding 0x0000 x1 from unit 1: CRC 0x0A84 sent as 84 0A
        let request = Request::read(FunctionCode::ReadHoldingRegisters, 0, 1).unwrap();
        let frame = encode_rtu(1, &request);
        assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);

        let (unit, pdu) = decode_rtu(&frame).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(pdu, &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_rtu_crc_mismatch() {
        let bad = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0B];
        assert!(matches!(
            decode_rtu(&bad),
            Err(DevLinkError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_register_response() {
        let request = Request::read(FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();
        let words = request
            .parse_response(&[0x03, 0x04, 0x43, 0x66, 0xC0, 0x00])
            .unwrap();
        assert_eq!(words, vec![0x4366, 0xC000]);
    }

    #[test]
    fn test_parse_coil_response() {
        let request = Request::read(FunctionCode::ReadCoils, 0, 3).unwrap();
        let bits = request.parse_response(&[0x01, 0x01, 0x05]).unwrap();
        assert_eq!(bits, vec![1, 0, 1]);
    }

    #[test]
    fn test_parse_exception() {
        let request = Request::read(FunctionCode::ReadInputRegisters, 500, 1).unwrap();
        let err = request.parse_response(&[0x84, 0x02]).unwrap_err();
        assert_eq!(
            err,
            DevLinkError::Protocol {
                function: FunctionCode::ReadInputRegisters,
                exception: ExceptionCode::IllegalDataAddress,
            }
        );
    }

    #[test]
    fn test_parse_mismatches() {
        let request = Request::read(FunctionCode::ReadHoldingRegisters, 0, 2).unwrap();
        // wrong function
        assert!(request.parse_response(&[0x04, 0x04, 0, 0, 0, 0]).is_err());
        // short data
        assert!(request.parse_response(&[0x03, 0x04, 0, 0]).is_err());
        // quantity mismatch
        assert!(request.parse_response(&[0x03, 0x02, 0, 0]).is_err());
    }

    #[test]
    fn test_parse_write_echo() {
        let request = Request::WriteSingleRegister {
            address: 10,
            value: 0x1234,
        };
        assert!(request
            .parse_response(&[0x06, 0x00, 0x0A, 0x12, 0x34])
            .unwrap()
            .is_empty());
        assert!(request.parse_response(&[0x06, 0x00, 0x0A, 0x00, 0x00]).is_err());

        let request = Request::write_multiple(10, vec![1, 2, 3]).unwrap();
        assert!(request.parse_response(&[0x10, 0x00, 0x0A, 0x00, 0x03]).is_ok());
    }

    #[test]
    fn test_request_limits() {
        assert!(Request::read(FunctionCode::ReadHoldingRegisters, 0, 0).is_err());
        assert!(Request::read(FunctionCode::ReadHoldingRegisters, 0, 126).is_err());
        assert!(Request::read(FunctionCode::ReadCoils, 0, 2000).is_ok());
        assert!(Request::read(FunctionCode::WriteSingleRegister, 0, 1).is_err());
        assert!(Request::write_multiple(0, vec![]).is_err());
    }

    #[test]
    fn test_mbap_header() {
        let header = MbapHeader::decode(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x01]);
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.pdu_len().unwrap(), 4);

        let bad = MbapHeader::decode(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x05, 0x01]);
        assert!(bad.pdu_len().is_err());
    }

    #[test]
    fn test_rtu_remaining_len() {
        assert_eq!(rtu_remaining_len([0x01, 0x03, 0x04]), 6);
        assert_eq!(rtu_remaining_len([0x01, 0x83, 0x02]), 2);
        assert_eq!(rtu_remaining_len([0x01, 0x06, 0x00]), 5);
    }
}
