//! Connection manager configuration.
//!
//! Retry tuning for the start/stop commands has no single correct value:
//! the device firmware answers anywhere from a few milliseconds to most of a
//! second after a write, depending on what it is doing. The defaults below
//! favour reliability over latency and can be changed per manager.

use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::retry::RetryPolicy;

/// Default number of transmissions per command.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default wait for an acknowledgment after each transmission.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(200);
/// Default time allowed from `connect()` to a ready link.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Retry budget for start/stop commands.
    pub retry: RetryPolicy,
    /// Time allowed for connect, discovery and notification setup.
    pub connect_timeout: Duration,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Set the command retry policy.
    pub fn with_retry(mut self, max_attempts: u32, attempt_timeout: Duration) -> Self {
        self.retry = RetryPolicy::new(max_attempts, attempt_timeout);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-subscriber event buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check that every value is usable.
    ///
    /// Timeouts must be non-zero and small enough to add to the current
    /// instant.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", self.retry.max_attempts));
        }
        if !is_usable_timeout(self.retry.attempt_timeout) {
            return Err(invalid(
                "retry.attempt_timeout",
                format!("{:?}", self.retry.attempt_timeout),
            ));
        }
        if !is_usable_timeout(self.connect_timeout) {
            return Err(invalid(
                "connect_timeout",
                format!("{:?}", self.connect_timeout),
            ));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", self.event_capacity));
        }
        Ok(())
    }
}

fn is_usable_timeout(timeout: Duration) -> bool {
    !timeout.is_zero() && Instant::now().checked_add(timeout).is_some()
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
