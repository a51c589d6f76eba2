//! Admission Gate
//!
//! Per-connection policing in front of the dispatcher: message size cap,
//! request rate limit (governor), and a sliding window of protocol
//! violations that escalates to a connection close once the threshold is
//! crossed. The gate never inspects payloads; it decides accept / drop /
//! close purely from sizes, rates and the violations reported by the
//! validator.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::network::protocol::{close_code, MAX_MESSAGE_BYTES};

/// Direct (single-key) rate limiter.
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Gate policy knobs.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Messages allowed per second per connection.
    pub max_requests_per_second: u32,
    /// Largest accepted transport message.
    pub max_message_bytes: usize,
    /// Violations inside the window that close the connection.
    pub max_violations: u32,
    /// Sliding violation window.
    pub violation_window: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 100,
            max_message_bytes: MAX_MESSAGE_BYTES,
            max_violations: 10,
            violation_window: Duration::from_secs(10),
        }
    }
}

/// What to do with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Dispatch the message.
    Accept,
    /// Drop the message silently.
    Drop(DropReason),
    /// Close the connection with this close code.
    Close(u16),
}

/// Why a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Exceeded the size cap.
    Oversized,
    /// Exceeded the rate limit.
    RateLimited,
}

/// Per-connection admission state.
pub struct ConnectionGate {
    limiter: Arc<Limiter>,
    violations: VecDeque<Instant>,
    config: GateConfig,
}

impl ConnectionGate {
    /// Create a gate with the given policy.
    pub fn new(config: GateConfig) -> Self {
        let per_second =
            NonZeroU32::new(config.max_requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            violations: VecDeque::new(),
            config,
        }
    }

    /// Gate one incoming message of the given length.
    pub fn check_message(&mut self, len: usize) -> GateDecision {
        if len > self.config.max_message_bytes {
            if self.record_violation() {
                return GateDecision::Close(close_code::POLICY_VIOLATION);
            }
            return GateDecision::Drop(DropReason::Oversized);
        }

        if self.limiter.check().is_err() {
            if self.record_violation() {
                return GateDecision::Close(close_code::RATE_LIMITED);
            }
            return GateDecision::Drop(DropReason::RateLimited);
        }

        GateDecision::Accept
    }

    /// Record a protocol violation (invalid input, oversize, sustained
    /// rate breach). Returns true once the window threshold is crossed
    /// and the connection should close.
    pub fn record_violation(&mut self) -> bool {
        let now = Instant::now();
        self.violations.push_back(now);

        while self
            .violations
            .front()
            .is_some_and(|&stamp| now.duration_since(stamp) > self.config.violation_window)
        {
            self.violations.pop_front();
        }

        self.violations.len() as u32 >= self.config.max_violations
    }

    /// Violations currently inside the window.
    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }
}
