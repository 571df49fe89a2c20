//! Retry scheduling with exponential backoff
//!
//! Protocol-agnostic: nothing here performs I/O or sleeps. The owner of a
//! polling loop reports outcomes through `on_failure` / `on_success` and asks
//! `is_due` (or `RetryScheduler::due`) which devices to try next.
//!
//! Delay after the n-th consecutive failure is `base_delay * multiplier^(n-1)`,
//! optionally capped by `max_delay`. Once the count exceeds `max_retries` the
//! device is parked in `Error` until an operator calls `force_reset`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{DevLinkError, Result};

/// Upper bound for a computed delay, guards the float to duration conversion
const MAX_BACKOFF_SECS: f64 = 7.0 * 24.0 * 3600.0;

// ============================================================================
// Policy
// ============================================================================

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

/// Per-device backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before the device is declared in error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay after the first failure
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Growth factor per additional failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Optional cap on a single delay
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_secs: u64, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay_secs,
            multiplier,
            max_delay_secs: None,
        }
    }

    pub fn with_max_delay(mut self, secs: u64) -> Self {
        self.max_delay_secs = Some(secs);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(DevLinkError::config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay before the next attempt after `count` consecutive failures
    pub fn delay_for(&self, count: u32) -> chrono::Duration {
        let exponent = i32::try_from(count.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut secs = self.base_delay_secs as f64 * self.multiplier.powi(exponent);
        if let Some(cap) = self.max_delay_secs {
            secs = secs.min(cap as f64);
        }
        if !secs.is_finite() {
            secs = MAX_BACKOFF_SECS;
        }
        let millis = (secs.clamp(0.0, MAX_BACKOFF_SECS) * 1000.0).round() as i64;
        chrono::Duration::milliseconds(millis)
    }
}

// ============================================================================
// State
// ============================================================================

/// Device health as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Never polled, or reset by an operator
    Unknown,
    Online,
    /// Failing, next attempt scheduled
    Retrying,
    /// Gave up after `max_retries`, needs `force_reset`
    Error,
    /// Disabled by an operator
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Retrying => "retrying",
            DeviceStatus::Error => "error",
            DeviceStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Resilience record of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryState {
    pub status: DeviceStatus,
    pub current_retry_count: u32,
    pub policy: RetryPolicy,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_successful_attempt: Option<DateTime<Utc>>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            status: DeviceStatus::Unknown,
            current_retry_count: 0,
            policy,
            next_retry_at: None,
            last_error: None,
            last_attempt: None,
            last_successful_attempt: None,
        }
    }

    /// Record a failed attempt at `now`.
    ///
    /// An offline device keeps its status: only the operator brings it back.
    pub fn on_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.last_attempt = Some(now);
        if self.status == DeviceStatus::Offline {
            return;
        }
        self.current_retry_count = self.current_retry_count.saturating_add(1);

        if self.current_retry_count > self.policy.max_retries {
            self.status = DeviceStatus::Error;
            self.next_retry_at = None;
            return;
        }

        let delay = self.policy.delay_for(self.current_retry_count);
        self.status = DeviceStatus::Retrying;
        self.next_retry_at = Some(now + delay);
    }

    /// Record a successful attempt at `now`
    pub fn on_success(&mut self, now: DateTime<Utc>) {
        self.current_retry_count = 0;
        self.status = DeviceStatus::Online;
        self.next_retry_at = None;
        self.last_error = None;
        self.last_attempt = Some(now);
        self.last_successful_attempt = Some(now);
    }

    /// True only while retrying and the backoff has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeviceStatus::Retrying
            && self.next_retry_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Whether a polling loop should contact the device at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeviceStatus::Unknown | DeviceStatus::Online => true,
            DeviceStatus::Retrying => self.is_due(now),
            DeviceStatus::Error | DeviceStatus::Offline => false,
        }
    }

    /// Operator override: clear the backoff without claiming success
    pub fn force_reset(&mut self) {
        self.current_retry_count = 0;
        self.status = DeviceStatus::Unknown;
        self.next_retry_at = None;
    }

    /// Operator disable: never due until reset
    pub fn mark_offline(&mut self) {
        self.status = DeviceStatus::Offline;
        self.next_retry_at = None;
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Tracks a `RetryState` per device id
#[derive(Debug, Default)]
pub struct RetryScheduler {
    states: HashMap<String, RetryState>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a device; an existing record is kept
    pub fn track(&mut self, id: impl Into<String>, policy: RetryPolicy) {
        self.states
            .entry(id.into())
            .or_insert_with(|| RetryState::new(policy));
    }

    pub fn untrack(&mut self, id: &str) -> Option<RetryState> {
        self.states.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&RetryState> {
        self.states.get(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn record_failure(
        &mut self,
        id: &str,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<DeviceStatus> {
        let state = self.state_mut(id)?;
        state.on_failure(error, now);

        match state.status {
            DeviceStatus::Error => warn!(
                "Device {} gave up after {} failures: {}",
                id,
                state.current_retry_count,
                state.last_error.as_deref().unwrap_or("")
            ),
            _ => debug!(
                "Device {} retry {}/{} at {:?}",
                id, state.current_retry_count, state.policy.max_retries, state.next_retry_at
            ),
        }
        Ok(state.status)
    }

    pub fn record_success(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let state = self.state_mut(id)?;
        if state.status != DeviceStatus::Online {
            info!("Device {} online", id);
        }
        state.on_success(now);
        Ok(())
    }

    pub fn force_reset(&mut self, id: &str) -> Result<()> {
        info!("Device {} retry state reset", id);
        self.state_mut(id)?.force_reset();
        Ok(())
    }

    pub fn mark_offline(&mut self, id: &str) -> Result<()> {
        info!("Device {} marked offline", id);
        self.state_mut(id)?.mark_offline();
        Ok(())
    }

    /// Ids in backoff whose next attempt time has passed, sorted
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.collect(|state| state.is_due(now))
    }

    /// Ids a polling loop should contact now (healthy, unknown or due), sorted
    pub fn eligible(&self, now: DateTime<Utc>) -> Vec<String> {
        self.collect(|state| state.is_eligible(now))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RetryState)> {
        self.states.iter()
    }

    fn collect(&self, keep: impl Fn(&RetryState) -> bool) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| keep(state))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn state_mut(&mut self, id: &str) -> Result<&mut RetryState> {
        self.states
            .get_mut(id)
            .ok_or_else(|| DevLinkError::unknown(id))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_backoff_sequence() {
        let mut state = RetryState::new(RetryPolicy::new(5, 30, 2.0));
        let now = t0();

        state.on_failure("timeout", now);
        assert_eq!(state.next_retry_at, Some(now + chrono::Duration::seconds(30)));
        state.on_failure("timeout", now);
        assert_eq!(state.next_retry_at, Some(now + chrono::Duration::seconds(60)));
        state.on_failure("timeout", now);
        assert_eq!(state.status, DeviceStatus::Retrying);
        assert_eq!(state.next_retry_at, Some(now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let mut state = RetryState::new(RetryPolicy::new(5, 30, 2.0));
        for _ in 0..5 {
            state.on_failure("refused", t0());
            assert_eq!(state.status, DeviceStatus::Retrying);
        }
        state.on_failure("refused", t0());
        assert_eq!(state.status, DeviceStatus::Error);
        assert_eq!(state.current_retry_count, 6);
        assert!(state.next_retry_at.is_none());
        assert!(!state.is_due(t0() + chrono::Duration::days(1)));
    }

    #[test]
    fn test_next_retry_increases_monotonically() {
        let mut state = RetryState::new(RetryPolicy::new(10, 1, 1.5));
        let now = t0();
        let mut previous = None;
        for _ in 0..10 {
            state.on_failure("err", now);
            let next = state.next_retry_at.unwrap();
            if let Some(prev) = previous {
                assert!(next > prev);
            }
            previous = Some(next);
        }
    }

    #[test]
    fn test_max_delay_caps_backoff() {
        let policy = RetryPolicy::new(10, 30, 2.0).with_max_delay(100);
        assert_eq!(policy.delay_for(1), chrono::Duration::seconds(30));
        assert_eq!(policy.delay_for(3), chrono::Duration::seconds(100));
        assert_eq!(policy.delay_for(8), chrono::Duration::seconds(100));
    }

    #[test]
    fn test_success_resets() {
        let mut state = RetryState::new(RetryPolicy::default());
        state.on_failure("timeout", t0());
        state.on_failure("timeout", t0());

        let later = t0() + chrono::Duration::minutes(5);
        state.on_success(later);
        assert_eq!(state.status, DeviceStatus::Online);
        assert_eq!(state.current_retry_count, 0);
        assert!(state.next_retry_at.is_none());
        assert!(state.last_error.is_none());
        assert_eq!(state.last_successful_attempt, Some(later));
    }

    #[test]
    fn test_is_due() {
        let mut state = RetryState::new(RetryPolicy::new(3, 10, 2.0));
        assert!(!state.is_due(t0()));

        state.on_failure("timeout", t0());
        assert!(!state.is_due(t0() + chrono::Duration::seconds(9)));
        assert!(state.is_due(t0() + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_force_reset_from_error() {
        let mut state = RetryState::new(RetryPolicy::new(0, 10, 2.0));
        state.on_failure("refused", t0());
        assert_eq!(state.status, DeviceStatus::Error);

        state.force_reset();
        assert_eq!(state.status, DeviceStatus::Unknown);
        assert_eq!(state.current_retry_count, 0);
        assert!(state.next_retry_at.is_none());
        assert!(state.is_eligible(t0()));
        // Reset does not claim success
        assert!(state.last_successful_attempt.is_none());
    }

    #[test]
    fn test_failure_keeps_offline_device_offline() {
        let now = Utc::now();
        let mut state = RetryState::new(RetryPolicy::default());
        state.mark_offline();
        state.on_failure("link down", now);

        assert_eq!(state.status, DeviceStatus::Offline);
        assert_eq!(state.current_retry_count, 0);
        assert!(state.next_retry_at.is_none());
        assert_eq!(state.last_error.as_deref(), Some("link down"));
        assert_eq!(state.last_attempt, Some(now));
        assert!(!state.is_eligible(now + chrono::Duration::days(1)));

        state.force_reset();
        assert!(state.is_eligible(now));
    }

    #[test]
    fn test_scheduler_due_and_eligible() {
        let mut scheduler = RetryScheduler::new();
        let policy = RetryPolicy::new(3, 10, 2.0);
        scheduler.track("meter-1", policy.clone());
        scheduler.track("meter-2", policy.clone());
        scheduler.track("inverter", policy);

        let now = t0();
        scheduler.record_success("meter-1", now).unwrap();
        scheduler.record_failure("meter-2", "timeout", now).unwrap();
        scheduler.mark_offline("inverter").unwrap();

        assert!(scheduler.due(now).is_empty());
        assert_eq!(scheduler.eligible(now), vec!["meter-1".to_string()]);

        let later = now + chrono::Duration::seconds(10);
        assert_eq!(scheduler.due(later), vec!["meter-2".to_string()]);
        assert_eq!(
            scheduler.eligible(later),
            vec!["meter-1".to_string(), "meter-2".to_string()]
        );
    }

    #[test]
    fn test_scheduler_unknown_id() {
        let mut scheduler = RetryScheduler::new();
        assert!(matches!(
            scheduler.record_success("ghost", t0()),
            Err(DevLinkError::UnknownConnection(_))
        ));
        scheduler.track("meter-1", RetryPolicy::default());
        assert!(scheduler.untrack("meter-1").is_some());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_policy_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(3, 10, 0.5).validate().is_err());
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_retries: 2").unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay_secs, 30);
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.max_delay_secs.is_none());
    }
}
