//! Tunables for the notification pipeline
//!
//! Every bound the pipeline enforces (stall timeout, send timeout, lag
//! thresholds, queue warning depth) lives here so the binary can expose them
//! on the command line and tests can shrink them.

use std::time::Duration;
use thiserror::Error;

/// Slowest supported simulation rate.
pub const MIN_TURNS_PER_SECOND: f64 = 0.001;
/// Fastest supported simulation rate.
pub const MAX_TURNS_PER_SECOND: f64 = 1000.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("turns per second must be between 0.001 and 1000, got {0}")]
    InvalidTurnRate(f64),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("max send failures must be at least 1")]
    ZeroSendFailures,
    #[error("disconnect threshold ({disconnect}) must exceed lag threshold ({lag})")]
    ThresholdOrder { lag: usize, disconnect: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Target simulation rate; the driver closes one turn per period.
    pub turns_per_second: f64,
    /// Longest the driver waits on outstanding producers before forcing the turn closed.
    pub stall_timeout: Duration,
    /// Upper bound on a single client send.
    pub send_timeout: Duration,
    /// Consecutive failed sends after which a session is disconnected.
    pub max_send_failures: u32,
    /// Unacknowledged records after which a session is demoted to lagging.
    pub lag_threshold: usize,
    /// Unacknowledged records after which a session is disconnected.
    pub disconnect_threshold: usize,
    /// When false, a successful send counts as an acknowledgment.
    pub require_acks: bool,
    /// Hold each turn open until its records have been broadcast.
    pub wait_for_dispatch: bool,
    /// Queue depth that triggers a pressure warning.
    pub queue_warn_depth: usize,
    /// Turns the slowest active client may trail before the driver holds back.
    pub max_client_turn_lag: Option<u64>,
    /// Longest the driver holds back for a slow client.
    pub backpressure_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            turns_per_second: 1.4,
            stall_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(250),
            max_send_failures: 5,
            lag_threshold: 256,
            disconnect_threshold: 4096,
            require_acks: false,
            wait_for_dispatch: true,
            queue_warn_depth: 10_000,
            max_client_turn_lag: None,
            backpressure_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TURNS_PER_SECOND..=MAX_TURNS_PER_SECOND).contains(&self.turns_per_second) {
            return Err(ConfigError::InvalidTurnRate(self.turns_per_second));
        }
        if self.stall_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("stall timeout"));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("send timeout"));
        }
        if self.max_send_failures == 0 {
            return Err(ConfigError::ZeroSendFailures);
        }
        if self.disconnect_threshold <= self.lag_threshold {
            return Err(ConfigError::ThresholdOrder {
                lag: self.lag_threshold,
                disconnect: self.disconnect_threshold,
            });
        }
        Ok(())
    }

    /// Wall-clock length of one turn.
    pub fn turn_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.turns_per_second)
    }

    pub fn with_turns_per_second(mut self, turns_per_second: f64) -> Self {
        self.turns_per_second = turns_per_second;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_send_failures(mut self, failures: u32) -> Self {
        self.max_send_failures = failures;
        self
    }

    pub fn with_lag_thresholds(mut self, lag: usize, disconnect: usize) -> Self {
        self.lag_threshold = lag;
        self.disconnect_threshold = disconnect;
        self
    }

    pub fn with_require_acks(mut self, require_acks: bool) -> Self {
        self.require_acks = require_acks;
        self
    }

    pub fn with_wait_for_dispatch(mut self, wait: bool) -> Self {
        self.wait_for_dispatch = wait;
        self
    }

    pub fn with_max_client_turn_lag(mut self, lag: Option<u64>, timeout: Duration) -> Self {
        self.max_client_turn_lag = lag;
        self.backpressure_timeout = timeout;
        self
    }
}
