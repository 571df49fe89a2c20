//! Status and result types reported by the connection manager

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::breaker::BreakerState;
use crate::codec::RegisterValue;

/// One decoded value from a poll, keyed by mapping name in the result map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolledValue {
    pub value: RegisterValue,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of an interactive connection test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub error: Option<String>,
}

/// Breaker view inside a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
}

/// Per-connection view inside a status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub protocol: &'static str,
    pub address: String,
    pub unit_id: u8,
    pub connected: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub breaker: BreakerSnapshot,
}

/// Point-in-time report of the whole pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub capacity: usize,
    pub active_connections: usize,
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    /// Sorted by id
    pub connections: Vec<ConnectionStatus>,
}

/// Aggregate poll counters shared by all connections
#[derive(Debug, Default)]
pub struct PollStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

impl PollStats {
    pub fn record_success(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// (total, successful, failed)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.successful.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
