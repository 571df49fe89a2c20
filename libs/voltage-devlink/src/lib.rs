//! Voltage Device Link Library
//!
//! Device communication and resilience layer for VoltageEMS: opens and
//! maintains register-protocol links to meters, inverters and batteries,
//! decodes raw register words into engineering values, and recovers from
//! device failures without operator action.
//!
//! # Architecture
//!
//! - **Register Mapping** (`mapping`): where a value lives and how to read it
//! - **Register Codec** (`codec`, `bytes`): pure word ↔ value translation
//! - **Circuit Breaker** (`breaker`): per-connection failure guard
//! - **Connection Manager** (`manager`): pool of links, connect/read/write/poll
//! - **Retry Scheduler** (`retry`): exponential backoff per device
//!
//! # Features
//!
//! - `rtu` - serial transport via `tokio-serial` (off by default)
//!
//! # Example
//!
//! ```no_run
//! use voltage_devlink::{ConnectionConfig, ConnectionManager, DataType, PoolConfig, RegisterMapping};
//!
//! # async fn run() -> voltage_devlink::Result<()> {
//! let manager = ConnectionManager::new(PoolConfig::default())?;
//! manager.add_connection(ConnectionConfig::tcp("meter-1", "192.168.1.10", 502));
//!
//! let voltage = RegisterMapping::new("voltage", 0, DataType::Float32).with_unit("V");
//! let values = manager.poll_device("meter-1", &[voltage]).await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod bytes;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod manager;
pub mod mapping;
pub mod retry;
pub mod status;
pub mod transport;

// Re-export core types
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use bytes::WordOrder;
pub use codec::{decode, encode, RegisterValue};
pub use config::{DevLinkConfig, DeviceConfig};
pub use connection::{ConnectionConfig, Parity, TransportConfig};
pub use error::{DevLinkError, Result};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use manager::{ConnectionManager, PoolConfig, READ_FAILURE_THRESHOLD};
pub use mapping::{DataType, RegisterKind, RegisterMapping};
pub use retry::{DeviceStatus, RetryPolicy, RetryScheduler, RetryState};
pub use status::{ConnectionStatus, ConnectionTestResult, ManagerStatus, PolledValue};
