//! Client-side reconnection policy
//!
//! Pure state: the client asks it what to do after each close and sleeps
//! for whatever delay it returns.

use crate::config::UpstreamConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`. `attempt` counts from 1.
    Retry { attempt: u32, delay: Duration },
    /// Attempts used up; no further automatic reconnects.
    Exhausted,
    /// A manual disconnect is in force.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    manually_disconnected: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
            max_delay,
            manually_disconnected: false,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(
            config.max_reconnect_attempts,
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
        )
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_manually_disconnected(&self) -> bool {
        self.manually_disconnected
    }

    /// `min(base * 2^attempt, cap)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// A connection was established.
    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    /// The connection dropped or could not be opened.
    pub fn on_unexpected_close(&mut self) -> ReconnectDecision {
        if self.manually_disconnected {
            return ReconnectDecision::Stopped;
        }
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }

        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.delay_for(self.attempts),
        }
    }

    /// Sticky until the next [`ReconnectPolicy::connect`].
    pub fn manual_disconnect(&mut self) {
        self.manually_disconnected = true;
    }

    /// A manual connect clears the stop flag and restarts the attempt budget.
    pub fn connect(&mut self) {
        self.manually_disconnected = false;
        self.attempts = 0;
    }
}
