//! Connection definitions
//!
//! `ConnectionConfig` is the static description of a device link as it
//! appears in configuration. `ConnectionRecord` is the mutable runtime state
//! the manager keeps next to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{DevLinkError, Result};

/// Default per-operation timeout (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Physical transport of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Stream-oriented (MBAP framing)
    Tcp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    /// Addressed serial line (CRC framing)
    Rtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        parity: Parity,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

impl TransportConfig {
    pub fn protocol(&self) -> &'static str {
        match self {
            TransportConfig::Tcp { .. } => "tcp",
            TransportConfig::Rtu { .. } => "rtu",
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Tcp { host, port } => write!(f, "{host}:{port}"),
            TransportConfig::Rtu {
                device, baud_rate, ..
            } => write!(f, "{device}@{baud_rate}"),
        }
    }
}

/// Static description of one device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub transport: TransportConfig,
    /// Unit (slave) id addressed on the link
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn tcp(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Tcp {
                host: host.into(),
                port,
            },
            unit_id: default_unit_id(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn rtu(id: impl Into<String>, device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Rtu {
                device: device.into(),
                baud_rate,
                parity: Parity::None,
                data_bits: default_data_bits(),
                stop_bits: default_stop_bits(),
            },
            unit_id: default_unit_id(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DevLinkError::config("connection id is empty"));
        }
        if self.timeout_ms == 0 {
            return Err(DevLinkError::config(format!(
                "{}: timeout_ms must be > 0",
                self.id
            )));
        }
        match &self.transport {
            TransportConfig::Tcp { host, port } => {
                if host.trim().is_empty() || *port == 0 {
                    return Err(DevLinkError::config(format!(
                        "{}: invalid TCP address {host}:{port}",
                        self.id
                    )));
                }
            },
            TransportConfig::Rtu {
                device,
                baud_rate,
                data_bits,
                stop_bits,
                ..
            } => {
                if device.trim().is_empty() || *baud_rate == 0 {
                    return Err(DevLinkError::config(format!(
                        "{}: invalid serial device {device}@{baud_rate}",
                        self.id
                    )));
                }
                if !(5..=8).contains(data_bits) || !(1..=2).contains(stop_bits) {
                    return Err(DevLinkError::config(format!(
                        "{}: unsupported framing {data_bits} data / {stop_bits} stop bits",
                        self.id
                    )));
                }
            },
        }
        Ok(())
    }
}

/// Runtime state of a connection, owned by the manager
#[derive(Debug)]
pub struct ConnectionRecord {
    pub connected: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Cumulative failures (connect, read and write)
    pub error_count: u64,
    /// Read/connect failures since the last success
    pub consecutive_failures: u32,
    pub breaker: CircuitBreaker,
    /// Set once the connection has been removed from the pool
    pub retired: bool,
}

impl ConnectionRecord {
    pub fn new(breaker: BreakerConfig) -> Self {
        Self {
            connected: false,
            last_poll: None,
            last_error: None,
            error_count: 0,
            consecutive_failures: 0,
            breaker: CircuitBreaker::new(breaker),
            retired: false,
        }
    }

    /// Store a failure as data
    pub fn note_error(&mut self, error: &DevLinkError) {
        self.last_error = Some(error.to_string());
        self.error_count = self.error_count.saturating_add(1);
    }
}
