//! Per-connection circuit breaker
//!
//! Stops the manager from hammering a device that keeps failing. The breaker
//! itself is plain data mutated under the connection's record lock; it never
//! sleeps and never touches I/O.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open
//! Open --(recovery timeout elapsed)--> HalfOpen (one trial admitted)
//! HalfOpen --success--> Closed
//! HalfOpen --failure--> Open
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of recorded failures before the breaker opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open breaker waits before admitting a trial
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the recovery timeout elapses
    Open,
    /// A single trial request is in flight
    HalfOpen,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_timeout() -> Duration {
    DEFAULT_RECOVERY_TIMEOUT
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(
        rename = "recovery_timeout_secs",
        with = "duration_secs",
        default = "default_recovery_timeout"
    )]
    pub recovery_timeout: Duration,
}

impl BreakerConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.failure_threshold == 0 {
            return Err(crate::error::DevLinkError::config(
                "breaker failure_threshold must be > 0",
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    /// When the last failure was recorded
    last_failure: Option<Instant>,
    /// When the outstanding half-open trial was admitted
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_started: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Record a device failure
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);
        self.trial_started = None;

        match self.state {
            BreakerState::HalfOpen => {
                warn!("Circuit breaker trial failed, reopening");
                self.state = BreakerState::Open;
            },
            BreakerState::Closed if self.failure_count >= self.config.failure_threshold => {
                warn!(
                    "Circuit breaker opened after {} failures",
                    self.failure_count
                );
                self.state = BreakerState::Open;
            },
            _ => {},
        }
    }

    /// Record a successful operation; closes the breaker from any state
    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("Circuit breaker closed");
        }
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
        self.trial_started = None;
    }

    /// Whether an operation may be attempted now.
    ///
    /// May move Open to HalfOpen and admit the caller as the trial.
    pub fn can_attempt(&mut self) -> bool {
        self.can_attempt_at(Instant::now())
    }

    pub fn can_attempt_at(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    info!("Circuit breaker half-open, admitting trial");
                    self.state = BreakerState::HalfOpen;
                    self.trial_started = Some(now);
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen => {
                // A trial that never reported back is replaced after another
                // recovery timeout
                let stale = self
                    .trial_started
                    .map(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if stale {
                    debug!("Circuit breaker trial expired, admitting another");
                    self.trial_started = Some(now);
                }
                stale
            },
        }
    }

    /// Time until an open breaker admits a trial
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        if self.state != BreakerState::Open {
            return None;
        }
        let at = self.last_failure?;
        Some(
            self.config
                .recovery_timeout
                .saturating_sub(at.elapsed()),
        )
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = breaker(3, 60);
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.can_attempt_at(now));

        cb.record_failure_at(now);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.failure_count(), 3);
        assert!(!cb.can_attempt_at(now + Duration::from_secs(59)));
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let mut cb = breaker(1, 10);
        let start = Instant::now();
        cb.record_failure_at(start);

        let later = start + Duration::from_secs(10);
        assert!(cb.can_attempt_at(later));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        // Second caller while the trial is outstanding
        assert!(!cb.can_attempt_at(later + Duration::from_secs(1)));

        // Trial never reported, another one is allowed after a full timeout
        assert!(cb.can_attempt_at(later + Duration::from_secs(10)));
    }

    #[test]
    fn test_half_open_success_closes() {
        let mut cb = breaker(1, 5);
        let start = Instant::now();
        cb.record_failure_at(start);
        assert!(cb.can_attempt_at(start + Duration::from_secs(5)));

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.can_attempt_at(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = breaker(2, 5);
        let start = Instant::now();
        cb.record_failure_at(start);
        cb.record_failure_at(start);

        let trial = start + Duration::from_secs(5);
        assert!(cb.can_attempt_at(trial));
        cb.record_failure_at(trial);
        assert_eq!(cb.state(), BreakerState::Open);

        // Cooldown restarts from the failed trial
        assert!(!cb.can_attempt_at(trial + Duration::from_secs(4)));
        assert!(cb.can_attempt_at(trial + Duration::from_secs(5)));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: BreakerConfig =
            serde_yaml::from_str("failure_threshold: 2\nrecovery_timeout_secs: 15").unwrap();
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.recovery_timeout, Duration::from_secs(15));

        let defaults: BreakerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(defaults, BreakerConfig::default());
        assert!(BreakerConfig {
            failure_threshold: 0,
            ..defaults
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let mut cb = breaker(3, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failure_count(), 1);
        assert!(cb.remaining_cooldown().is_none());
    }
}
