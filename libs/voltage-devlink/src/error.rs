//! Device Link Error Types
//!
//! Error taxonomy for the device communication layer. Transport and protocol
//! failures are device problems and are recovered inside the connection
//! manager; decode, capacity and unknown-connection errors are caller or
//! configuration problems and are returned to the immediate caller.

use thiserror::Error;

use crate::transport::frame::{ExceptionCode, FunctionCode};

/// Result type for voltage-devlink operations
pub type Result<T> = std::result::Result<T, DevLinkError>;

/// Device link errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DevLinkError {
    /// Dial/read/write failed at the network or serial layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O did not complete within the connection timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device answered with an exception response
    #[error("Protocol error: FC{function:02X} answered {exception}")]
    Protocol {
        function: FunctionCode,
        exception: ExceptionCode,
    },

    /// Device answered with a malformed or mismatched frame
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Register words could not be interpreted with the given mapping
    #[error("Decode error: {0}")]
    Decode(String),

    /// Value cannot be written with the given mapping
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Connection pool is full
    #[error("Connection pool full (capacity {capacity})")]
    Capacity { capacity: usize },

    /// Operation referenced an id not present in the pool
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Connection id already registered
    #[error("Duplicate connection: {0}")]
    DuplicateConnection(String),

    /// Invalid configuration (pool, connection or mapping)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation abandoned because its connection was removed
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl From<std::io::Error> for DevLinkError {
    fn from(err: std::io::Error) -> Self {
        DevLinkError::Transport(err.to_string())
    }
}

impl From<figment::Error> for DevLinkError {
    fn from(err: figment::Error) -> Self {
        DevLinkError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl DevLinkError {
    pub fn transport(msg: impl Into<String>) -> Self {
        DevLinkError::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        DevLinkError::Timeout(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        DevLinkError::InvalidResponse(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        DevLinkError::Decode(msg.into())
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        DevLinkError::InvalidValue(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DevLinkError::Config(msg.into())
    }

    pub fn unknown(id: impl Into<String>) -> Self {
        DevLinkError::UnknownConnection(id.into())
    }

    /// Network/serial layer failure (including timeouts)
    pub fn is_transport(&self) -> bool {
        matches!(self, DevLinkError::Transport(_) | DevLinkError::Timeout(_))
    }

    /// Failure caused by the device or the link to it.
    ///
    /// These feed the circuit breaker and the retry scheduler.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            DevLinkError::Transport(_)
                | DevLinkError::Timeout(_)
                | DevLinkError::Protocol { .. }
                | DevLinkError::InvalidResponse(_)
        )
    }

    /// Misconfiguration or misuse by the caller, never a device problem
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            DevLinkError::Decode(_)
                | DevLinkError::InvalidValue(_)
                | DevLinkError::Capacity { .. }
                | DevLinkError::UnknownConnection(_)
                | DevLinkError::DuplicateConnection(_)
                | DevLinkError::Config(_)
        )
    }

    /// Check if this error leaves the link in an unknown state.
    ///
    /// An exception response keeps the stream in sync. A timed-out read may
    /// have stopped mid-frame and a malformed response means the framing
    /// was lost, so neither stream can be trusted for the next exchange.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            DevLinkError::Transport(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("closed")
                    || msg.contains("early eof")
            },
            DevLinkError::Timeout(_) | DevLinkError::InvalidResponse(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(DevLinkError::transport("refused").is_device_failure());
        assert!(DevLinkError::timeout("read").is_transport());

        let protocol = DevLinkError::Protocol {
            function: FunctionCode::ReadHoldingRegisters,
            exception: ExceptionCode::IllegalDataAddress,
        };
        assert!(protocol.is_device_failure());
        assert!(!protocol.is_transport());
        assert!(!protocol.is_caller_error());

        assert!(DevLinkError::decode("bad words").is_caller_error());
        assert!(!DevLinkError::decode("bad words").is_device_failure());
        assert!(DevLinkError::Capacity { capacity: 4 }.is_caller_error());
        assert!(DevLinkError::unknown("meter-1").is_caller_error());
    }

    #[test]
    fn test_protocol_message() {
        let err = DevLinkError::Protocol {
            function: FunctionCode::ReadHoldingRegisters,
            exception: ExceptionCode::IllegalDataAddress,
        };
        let text = err.to_string();
        assert!(text.contains("FC03"), "{text}");
        assert!(text.contains("illegal data address"), "{text}");
    }

    #[test]
    fn test_needs_reconnect() {
        assert!(DevLinkError::transport("Connection reset by peer").needs_reconnect());
        assert!(DevLinkError::timeout("TCP header read timeout").needs_reconnect());
        assert!(DevLinkError::invalid_response("invalid protocol id 1281").needs_reconnect());
        assert!(!DevLinkError::Protocol {
            function: FunctionCode::ReadHoldingRegisters,
            exception: ExceptionCode::IllegalDataAddress,
        }
        .needs_reconnect());
    }
}
