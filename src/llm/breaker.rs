//! Circuit breaker for the completion endpoint.
//!
//! Three states: closed (normal), open (failing fast), half-open
//! (probing recovery). While open, no call reaches the remote; callers
//! fail immediately, which bounds cost and latency during provider
//! outages.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Failing fast; the remote is not called.
    Open,
    /// One probe call allowed through.
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    pub fn gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

/// Shared per-process circuit breaker.
///
/// State transitions:
/// - closed → open when consecutive failures reach the threshold
/// - open → half-open once the cooldown has elapsed since the last
///   recorded failure
/// - half-open → closed on the next success
/// - half-open → open on any failure
///
/// An unset failure timestamp while open is treated as not-yet-elapsed:
/// the breaker stays open rather than computing an elapsed time from
/// nothing. A threshold of zero therefore constructs a breaker that is
/// open forever (documented edge case, not normal operation).
pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
    consecutive_failures: AtomicU32,
    last_failure: RwLock<Option<Instant>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive
    /// failures and probes again after `cooldown`.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        let initial = if failure_threshold == 0 {
            BreakerState::Open
        } else {
            BreakerState::Closed
        };
        Self {
            state: RwLock::new(initial),
            consecutive_failures: AtomicU32::new(0),
            last_failure: RwLock::new(None),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether a call may proceed to the remote. May transition an open
    /// breaker to half-open when the cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = match *self.last_failure.read() {
                    Some(at) => at.elapsed(),
                    // Unset timestamp: stay open.
                    None => return false,
                };
                if elapsed >= self.cooldown {
                    self.transition_to(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Resets the failure count; closes a
    /// half-open breaker.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if *self.state.read() == BreakerState::HalfOpen {
            self.transition_to(BreakerState::Closed);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        *self.last_failure.write() = Some(Instant::now());
        let state = *self.state.read();
        match state {
            BreakerState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // The probe failed.
                self.transition_to(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        *self.state.read()
    }

    /// Current consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn transition_to(&self, new_state: BreakerState) {
        let mut state = self.state.write();
        if *state != new_state {
            *state = new_state;
            if new_state == BreakerState::Closed {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
        }
    }
}
