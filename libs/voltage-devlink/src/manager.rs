//! Connection Manager
//!
//! Owns every device connection in the process and is the only code that
//! mutates their state. One manager is created per process and handed to
//! collaborators explicitly.
//!
//! # Locking
//!
//! - The pool map sits behind a `parking_lot::RwLock` that is only held to
//!   look up, insert or remove a slot, never across an `.await`.
//! - Each slot serialises its I/O through a `tokio::sync::Mutex`. Waiters
//!   are served in FIFO order, so operations on one connection run in the
//!   order they were submitted while different connections proceed in
//!   parallel.
//! - The runtime record (connected flag, counters, breaker) sits behind a
//!   `parking_lot::Mutex` taken for short, synchronous updates.
//!
//! # Removal
//!
//! `remove_connection` cancels the slot's token and sets `retired` on its
//! record. In-flight operations observe the token at their next await point;
//! every record update checks `retired` first, so an abandoned poll never
//! writes into a removed connection.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerConfig, BreakerState};
use crate::codec::{self, RegisterValue};
use crate::connection::{ConnectionConfig, ConnectionRecord, TransportConfig};
use crate::error::{DevLinkError, Result};
use crate::mapping::{DataType, RegisterKind, RegisterMapping};
use crate::status::{
    BreakerSnapshot, ConnectionStatus, ConnectionTestResult, ManagerStatus, PollStats,
    PolledValue,
};
use crate::transport::{DeviceLink, Request};

/// Consecutive read failures after which the link is dropped proactively
pub const READ_FAILURE_THRESHOLD: u32 = 3;

/// Default pool capacity
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

/// Pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            breaker: BreakerConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(DevLinkError::config("pool max_connections must be > 0"));
        }
        self.breaker.validate()
    }
}

/// I/O side of a slot, guarded by the FIFO mutex
#[derive(Debug)]
struct LinkIo {
    link: Option<DeviceLink>,
    next_tid: u16,
    /// The stream lost framing and must be reopened before the next exchange
    stale: bool,
}

impl LinkIo {
    fn next_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }
}

#[derive(Debug)]
struct ConnectionSlot {
    config: ConnectionConfig,
    io: tokio::sync::Mutex<LinkIo>,
    record: Mutex<ConnectionRecord>,
    cancel: CancellationToken,
}

impl ConnectionSlot {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn cancelled(&self) -> DevLinkError {
        DevLinkError::Cancelled(format!("{} was removed", self.config.id))
    }

    /// Apply `f` to the record unless the connection has been removed
    fn update<R>(&self, f: impl FnOnce(&mut ConnectionRecord) -> R) -> Option<R> {
        let mut record = self.record.lock();
        if record.retired {
            None
        } else {
            Some(f(&mut record))
        }
    }

    async fn lock_io(&self) -> Result<tokio::sync::MutexGuard<'_, LinkIo>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            guard = self.io.lock() => Ok(guard),
        }
    }
}

/// Result of a dial attempt
enum Dial {
    Ready,
    /// Breaker denied the attempt, no I/O was made
    Blocked,
    Failed(DevLinkError),
}

/// Pool of device connections
#[derive(Debug)]
pub struct ConnectionManager {
    capacity: usize,
    breaker: BreakerConfig,
    slots: RwLock<HashMap<String, Arc<ConnectionSlot>>>,
    stats: PollStats,
    active: AtomicUsize,
}

impl ConnectionManager {
    /// Create a manager; a zero capacity is a configuration error
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.max_connections,
            breaker: config.breaker,
            slots: RwLock::new(HashMap::new()),
            stats: PollStats::default(),
            active: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().contains_key(id)
    }

    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    // ========================================================================
    // Pool membership
    // ========================================================================

    /// Register a connection, reporting why it was rejected
    pub fn try_add_connection(&self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;

        let mut slots = self.slots.write();
        if slots.contains_key(&config.id) {
            return Err(DevLinkError::DuplicateConnection(config.id));
        }
        if slots.len() >= self.capacity {
            return Err(DevLinkError::Capacity {
                capacity: self.capacity,
            });
        }

        info!(conn = %config.id, "Connection added: {}", config.transport);
        let slot = ConnectionSlot {
            record: Mutex::new(ConnectionRecord::new(self.breaker)),
            io: tokio::sync::Mutex::new(LinkIo {
                link: None,
                next_tid: 1,
                stale: false,
            }),
            cancel: CancellationToken::new(),
            config,
        };
        slots.insert(slot.config.id.clone(), Arc::new(slot));
        Ok(())
    }

    /// Register a connection; false when the pool is full or the id is taken
    pub fn add_connection(&self, config: ConnectionConfig) -> bool {
        let id = config.id.clone();
        match self.try_add_connection(config) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %id, "Connection rejected: {}", e);
                false
            },
        }
    }

    /// Remove a connection, abandoning in-flight work and closing its link
    pub async fn remove_connection(&self, id: &str) -> Result<()> {
        let slot = self
            .slots
            .write()
            .remove(id)
            .ok_or_else(|| DevLinkError::unknown(id))?;

        slot.cancel.cancel();
        {
            let mut record = slot.record.lock();
            record.retired = true;
            self.mark_disconnected(&mut record);
        }

        // In-flight operations bail out on the token, queued ones never start
        let link = slot.io.lock().await.link.take();
        if let Some(link) = link {
            link.close().await;
        }
        info!(conn = %id, "Connection removed");
        Ok(())
    }

    fn slot(&self, id: &str) -> Result<Arc<ConnectionSlot>> {
        self.slots
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DevLinkError::unknown(id))
    }

    fn mark_connected(&self, record: &mut ConnectionRecord) {
        if !record.connected {
            record.connected = true;
            self.active.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn mark_disconnected(&self, record: &mut ConnectionRecord) {
        if record.connected {
            record.connected = false;
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    // ========================================================================
    // Connect / Disconnect
    // ========================================================================

    /// Establish the link if the breaker allows it.
    ///
    /// Device failures are stored on the connection and reported as `false`.
    pub async fn connect(&self, id: &str) -> Result<bool> {
        let slot = self.slot(id)?;
        let mut io = slot.lock_io().await?;
        match self.dial(&slot, &mut io).await? {
            Dial::Ready => Ok(true),
            Dial::Blocked | Dial::Failed(_) => Ok(false),
        }
    }

    async fn dial(&self, slot: &ConnectionSlot, io: &mut LinkIo) -> Result<Dial> {
        // A stale stream is replaced without going through the breaker and
        // without clearing the failure counters of the connection
        let resync = match (&io.link, io.stale) {
            (Some(_), false) => return Ok(Dial::Ready),
            (Some(_), true) => true,
            (None, _) => false,
        };

        if resync {
            io.stale = false;
            if let Some(link) = io.link.take() {
                link.close().await;
            }
            debug!(conn = %slot.id(), "Reopening link after lost framing");
        } else {
            let admitted = slot
                .update(|record| record.breaker.can_attempt())
                .ok_or_else(|| slot.cancelled())?;
            if !admitted {
                debug!(conn = %slot.id(), "Circuit open, connect skipped");
                return Ok(Dial::Blocked);
            }
        }

        let result = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => return Err(slot.cancelled()),
            result = DeviceLink::open(&slot.config) => result,
        };

        match result {
            Ok(link) => {
                let kept = slot.update(|record| {
                    self.mark_connected(record);
                    if !resync {
                        record.consecutive_failures = 0;
                        record.breaker.record_success();
                    }
                });
                if kept.is_none() {
                    link.close().await;
                    return Err(slot.cancelled());
                }
                io.link = Some(link);
                Ok(Dial::Ready)
            },
            Err(e) => {
                warn!(conn = %slot.id(), "Connect failed: {}", e);
                slot.update(|record| {
                    self.mark_disconnected(record);
                    record.note_error(&e);
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                    record.breaker.record_failure();
                })
                .ok_or_else(|| slot.cancelled())?;
                Ok(Dial::Failed(e))
            },
        }
    }

    /// Close the link; always leaves the connection marked disconnected
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut io = slot.lock_io().await?;
        self.drop_link(&slot, &mut io).await;
        Ok(())
    }

    async fn drop_link(&self, slot: &ConnectionSlot, io: &mut LinkIo) {
        io.stale = false;
        slot.update(|record| self.mark_disconnected(record));
        if let Some(link) = io.link.take() {
            link.close().await;
            debug!(conn = %slot.id(), "Disconnected");
        }
    }

    // ========================================================================
    // Read / Write
    // ========================================================================

    /// Read and decode one mapping.
    ///
    /// `Ok(None)` means the device could not be read; the failure is stored
    /// on the connection. Mapping problems are returned as `Decode` errors
    /// and leave the breaker untouched.
    pub async fn read_registers(
        &self,
        id: &str,
        mapping: &RegisterMapping,
    ) -> Result<Option<RegisterValue>> {
        mapping.validate()?;
        let slot = self.slot(id)?;
        let mut io = slot.lock_io().await?;

        match self.dial(&slot, &mut io).await? {
            Dial::Ready => {},
            Dial::Blocked | Dial::Failed(_) => {
                self.stats.record_failure();
                return Ok(None);
            },
        }

        let request = Request::read(
            mapping.kind.read_function(),
            mapping.address,
            mapping.read_quantity(),
        )?;

        match self.exchange(&slot, &mut io, &request, None).await? {
            Ok(words) => {
                slot.update(|record| {
                    record.consecutive_failures = 0;
                    record.last_poll = Some(Utc::now());
                })
                .ok_or_else(|| slot.cancelled())?;

                match codec::decode(&words, mapping) {
                    Ok(value) => {
                        self.stats.record_success();
                        Ok(Some(value))
                    },
                    Err(e) => {
                        self.stats.record_failure();
                        Err(e)
                    },
                }
            },
            Err(e) => {
                self.stats.record_failure();
                debug!(conn = %slot.id(), addr = mapping.address, "Read {} failed: {}", mapping.name, e);

                let threshold_hit = slot
                    .update(|record| {
                        record.note_error(&e);
                        record.consecutive_failures =
                            record.consecutive_failures.saturating_add(1);
                        if record.consecutive_failures >= READ_FAILURE_THRESHOLD {
                            record.consecutive_failures = 0;
                            record.breaker.record_failure();
                            true
                        } else {
                            false
                        }
                    })
                    .ok_or_else(|| slot.cancelled())?;

                if threshold_hit {
                    warn!(
                        conn = %slot.id(),
                        "{} consecutive read failures, dropping link", READ_FAILURE_THRESHOLD
                    );
                    self.drop_link(&slot, &mut io).await;
                } else if e.needs_reconnect() {
                    io.stale = true;
                }
                Ok(None)
            },
        }
    }

    /// Run one request on the open link.
    ///
    /// The outer `Result` carries cancellation, the inner one the device
    /// outcome.
    async fn exchange(
        &self,
        slot: &ConnectionSlot,
        io: &mut LinkIo,
        request: &Request,
        unit_id: Option<u8>,
    ) -> Result<Result<Vec<u16>>> {
        let tid = io.next_tid();
        let unit = unit_id.unwrap_or(slot.config.unit_id);
        let Some(link) = io.link.as_mut() else {
            return Ok(Err(DevLinkError::transport("link not open")));
        };

        let outcome = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => None,
            result = link.exchange(tid, unit, request, slot.config.timeout()) => Some(result),
        };

        match outcome {
            Some(result) => Ok(result),
            None => {
                // Abandoned mid-frame, the stream is no longer in sync
                io.link = None;
                io.stale = false;
                Err(slot.cancelled())
            },
        }
    }

    /// Write one holding register (function 0x06).
    ///
    /// Returns false when the device did not confirm the write; the error is
    /// stored on the connection. Writes do not feed the read failure counter.
    pub async fn write_register(
        &self,
        id: &str,
        address: u16,
        value: u16,
        unit_id: Option<u8>,
    ) -> Result<bool> {
        let request = Request::WriteSingleRegister { address, value };
        self.write_request(id, &request, unit_id).await
    }

    /// Encode and write an engineering value through its mapping.
    ///
    /// Coils use function 0x05, single registers 0x06 and wider values 0x10.
    pub async fn write_value(
        &self,
        id: &str,
        mapping: &RegisterMapping,
        value: &RegisterValue,
    ) -> Result<bool> {
        if !mapping.kind.is_writable() {
            return Err(DevLinkError::invalid_value(format!(
                "{}: {} registers are read-only",
                mapping.name, mapping.kind
            )));
        }

        let request = if mapping.kind == RegisterKind::Coil {
            let on = value.as_bool().ok_or_else(|| {
                DevLinkError::invalid_value(format!("{}: {} is not a bool", mapping.name, value))
            })?;
            Request::WriteSingleCoil {
                address: mapping.address,
                on,
            }
        } else {
            let words = codec::encode(value, mapping)?;
            match words.as_slice() {
                [word] if mapping.data_type != DataType::String => Request::WriteSingleRegister {
                    address: mapping.address,
                    value: *word,
                },
                _ => Request::write_multiple(mapping.address, words)?,
            }
        };

        self.write_request(id, &request, None).await
    }

    async fn write_request(
        &self,
        id: &str,
        request: &Request,
        unit_id: Option<u8>,
    ) -> Result<bool> {
        let slot = self.slot(id)?;
        let mut io = slot.lock_io().await?;

        match self.dial(&slot, &mut io).await? {
            Dial::Ready => {},
            Dial::Blocked => {
                warn!(conn = %id, "Write skipped, circuit open");
                return Ok(false);
            },
            Dial::Failed(_) => return Ok(false),
        }

        match self.exchange(&slot, &mut io, request, unit_id).await? {
            Ok(_) => {
                debug!(conn = %id, "{} confirmed", request.function());
                Ok(true)
            },
            Err(e) => {
                warn!(conn = %id, "{} failed: {}", request.function(), e);
                slot.update(|record| record.note_error(&e))
                    .ok_or_else(|| slot.cancelled())?;
                if e.needs_reconnect() {
                    io.stale = true;
                }
                Ok(false)
            },
        }
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Read every mapping in order; failed mappings are left out of the result
    pub async fn poll_device(
        &self,
        id: &str,
        mappings: &[RegisterMapping],
    ) -> Result<HashMap<String, PolledValue>> {
        // Unknown ids are a caller error even with an empty mapping list
        self.slot(id)?;

        let mut values = HashMap::with_capacity(mappings.len());
        for mapping in mappings {
            match self.read_registers(id, mapping).await {
                Ok(Some(value)) => {
                    values.insert(
                        mapping.name.clone(),
                        PolledValue {
                            value,
                            unit: mapping.unit.clone(),
                            timestamp: Utc::now(),
                        },
                    );
                },
                Ok(None) => {},
                Err(DevLinkError::UnknownConnection(_)) => {
                    return Err(DevLinkError::Cancelled(format!("{id} was removed")));
                },
                Err(e @ DevLinkError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    debug!(conn = %id, "Skipping {}: {}", mapping.name, e);
                },
            }
        }

        debug!(conn = %id, "Polled {}/{} values", values.len(), mappings.len());
        Ok(values)
    }

    /// Poll several connections concurrently, one task per connection
    pub async fn poll_many(
        self: &Arc<Self>,
        jobs: Vec<(String, Vec<RegisterMapping>)>,
    ) -> HashMap<String, Result<HashMap<String, PolledValue>>> {
        let mut tasks = JoinSet::new();
        for (id, mappings) in jobs {
            let manager = Arc::clone(self);
            tasks.spawn(async move {
                let result = manager.poll_device(&id, &mappings).await;
                (id, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    results.insert(id, result);
                },
                Err(e) => error!("Poll task failed: {}", e),
            }
        }
        results
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Dial the device once and measure how long it takes.
    ///
    /// A healthy TCP link is left in place and measured with a separate
    /// dial that is closed right after. Serial ports cannot be opened twice,
    /// so an open serial link is reopened instead.
    pub async fn test_connection(&self, id: &str) -> Result<ConnectionTestResult> {
        let slot = self.slot(id)?;
        let mut io = slot.lock_io().await?;

        let live_tcp = io.link.is_some()
            && !io.stale
            && matches!(slot.config.transport, TransportConfig::Tcp { .. });

        let (dial, latency) = if live_tcp {
            let started = Instant::now();
            let opened = tokio::select! {
                biased;
                _ = slot.cancel.cancelled() => return Err(slot.cancelled()),
                opened = DeviceLink::open(&slot.config) => opened,
            };
            let latency = started.elapsed();
            match opened {
                Ok(link) => {
                    link.close().await;
                    (Dial::Ready, latency)
                },
                Err(e) => {
                    warn!(conn = %id, "Test dial failed, live link kept: {}", e);
                    (Dial::Failed(e), latency)
                },
            }
        } else {
            self.drop_link(&slot, &mut io).await;
            let started = Instant::now();
            let dial = self.dial(&slot, &mut io).await?;
            (dial, started.elapsed())
        };

        let result = match dial {
            Dial::Ready => ConnectionTestResult {
                success: true,
                latency,
                error: None,
            },
            Dial::Blocked => ConnectionTestResult {
                success: false,
                latency,
                error: Some("circuit breaker open".to_string()),
            },
            Dial::Failed(e) => ConnectionTestResult {
                success: false,
                latency,
                error: Some(e.to_string()),
            },
        };
        info!(
            conn = %id,
            "Connection test: success={}, latency={}ms",
            result.success,
            latency.as_millis()
        );
        Ok(result)
    }

    /// Snapshot of every connection plus the aggregate counters.
    ///
    /// Never fails and never waits on device I/O.
    pub fn get_status(&self) -> ManagerStatus {
        let slots: Vec<Arc<ConnectionSlot>> = self.slots.read().values().cloned().collect();

        let mut connections: Vec<ConnectionStatus> = slots
            .iter()
            .map(|slot| {
                let record = slot.record.lock();
                ConnectionStatus {
                    id: slot.config.id.clone(),
                    protocol: slot.config.transport.protocol(),
                    address: slot.config.transport.to_string(),
                    unit_id: slot.config.unit_id,
                    connected: record.connected,
                    last_poll: record.last_poll,
                    last_error: record.last_error.clone(),
                    error_count: record.error_count,
                    consecutive_failures: record.consecutive_failures,
                    breaker: BreakerSnapshot {
                        state: record.breaker.state(),
                        failure_count: record.breaker.failure_count(),
                    },
                }
            })
            .collect();
        connections.sort_by(|a, b| a.id.cmp(&b.id));

        let (total_polls, successful_polls, failed_polls) = self.stats.snapshot();
        ManagerStatus {
            capacity: self.capacity,
            active_connections: self.active_connections(),
            total_polls,
            successful_polls,
            failed_polls,
            connections,
        }
    }

    /// Breaker state of one connection
    pub fn breaker_state(&self, id: &str) -> Result<BreakerState> {
        Ok(self.slot(id)?.record.lock().breaker.state())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn manager(capacity: usize) -> ConnectionManager {
        ConnectionManager::new(PoolConfig::with_capacity(capacity)).unwrap()
    }

    /// Port with nothing listening on it
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            ConnectionManager::new(PoolConfig::with_capacity(0)),
            Err(DevLinkError::Config(_))
        ));
    }

    #[test]
    fn test_capacity_enforced() {
        let manager = manager(2);
        assert!(manager.add_connection(ConnectionConfig::tcp("a", "127.0.0.1", 502)));
        assert!(manager.add_connection(ConnectionConfig::tcp("b", "127.0.0.1", 502)));
        assert!(!manager.add_connection(ConnectionConfig::tcp("c", "127.0.0.1", 502)));
        assert_eq!(manager.len(), 2);
        assert!(!manager.contains("c"));

        assert!(matches!(
            manager.try_add_connection(ConnectionConfig::tcp("c", "127.0.0.1", 502)),
            Err(DevLinkError::Capacity { capacity: 2 })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let manager = manager(4);
        assert!(manager.add_connection(ConnectionConfig::tcp("a", "127.0.0.1", 502)));
        assert!(matches!(
            manager.try_add_connection(ConnectionConfig::tcp("a", "127.0.0.1", 503)),
            Err(DevLinkError::DuplicateConnection(_))
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_caller_error() {
        let manager = manager(1);
        let mapping = RegisterMapping::new("v", 0, DataType::Uint16);

        assert!(matches!(
            manager.read_registers("ghost", &mapping).await,
            Err(DevLinkError::UnknownConnection(_))
        ));
        assert!(matches!(
            manager.write_register("ghost", 0, 1, None).await,
            Err(DevLinkError::UnknownConnection(_))
        ));
        assert!(manager.poll_device("ghost", &[]).await.is_err());
        assert!(manager.remove_connection("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_data() {
        let manager = manager(1);
        let port = closed_port().await;
        manager.add_connection(
            ConnectionConfig::tcp("dead", "127.0.0.1", port).with_timeout(Duration::from_millis(200)),
        );

        assert!(!manager.connect("dead").await.unwrap());

        let status = manager.get_status();
        let conn = &status.connections[0];
        assert!(!conn.connected);
        assert_eq!(conn.error_count, 1);
        assert_eq!(conn.breaker.failure_count, 1);
        assert!(conn.last_error.is_some());
        assert_eq!(status.active_connections, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_failure_is_logged() {
        let manager = manager(1);
        let port = closed_port().await;
        manager.add_connection(ConnectionConfig::tcp("dead", "127.0.0.1", port));

        assert!(!manager.connect("dead").await.unwrap());
        assert!(logs_contain("Connect failed"));
    }

    #[tokio::test]
    async fn test_read_when_unreachable_counts_failed_poll() {
        let manager = manager(1);
        let port = closed_port().await;
        manager.add_connection(ConnectionConfig::tcp("dead", "127.0.0.1", port));

        let mapping = RegisterMapping::new("v", 0, DataType::Uint16);
        assert_eq!(manager.read_registers("dead", &mapping).await.unwrap(), None);

        let status = manager.get_status();
        assert_eq!(status.total_polls, 1);
        assert_eq!(status.failed_polls, 1);
    }

    #[tokio::test]
    async fn test_bad_mapping_does_not_touch_breaker() {
        let manager = manager(1);
        manager.add_connection(ConnectionConfig::tcp("m", "127.0.0.1", 502));

        let bad = RegisterMapping::new("p", 0, DataType::Float32).with_register_count(1);
        assert!(matches!(
            manager.read_registers("m", &bad).await,
            Err(DevLinkError::Decode(_))
        ));

        let status = manager.get_status();
        assert_eq!(status.connections[0].breaker.failure_count, 0);
        assert_eq!(status.connections[0].error_count, 0);
        assert_eq!(status.total_polls, 0);
    }

    #[tokio::test]
    async fn test_write_value_rejects_read_only_space() {
        let manager = manager(1);
        manager.add_connection(ConnectionConfig::tcp("m", "127.0.0.1", 502));

        let input = RegisterMapping::new("v", 0, DataType::Uint16).with_kind(RegisterKind::Input);
        assert!(matches!(
            manager.write_value("m", &input, &RegisterValue::Integer(1)).await,
            Err(DevLinkError::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_never_underflows_gauge() {
        let manager = manager(1);
        manager.add_connection(ConnectionConfig::tcp("m", "127.0.0.1", 502));
        manager.disconnect("m").await.unwrap();
        manager.disconnect("m").await.unwrap();
        assert_eq!(manager.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_remove_discards_state() {
        let manager = manager(1);
        manager.add_connection(ConnectionConfig::tcp("m", "127.0.0.1", 502));
        manager.remove_connection("m").await.unwrap();

        assert!(manager.is_empty());
        assert!(manager.get_status().connections.is_empty());
        // Slot freed for a new registration
        assert!(manager.add_connection(ConnectionConfig::tcp("n", "127.0.0.1", 502)));
    }
}
