//! Circuit breaker guarding calls to an unreliable dependency.
//!
//! One instance per dependency: each weather provider gets its own, and the
//! database pool wraps every acquisition in one. The state machine is the
//! classic CLOSED / OPEN / HALF_OPEN triple with an optional adaptive
//! recovery timeout that backs off as consecutive failures accumulate.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Backpressure;

// ---

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally; failures are counted.
    Closed,
    /// Calls are refused until the recovery timeout elapses.
    Open,
    /// Probing: calls flow, consecutive successes close the breaker.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Maximum adaptive recovery timeout.
const MAX_RECOVERY: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Per-dependency circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    adaptive: bool,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker with a fixed recovery timeout.
    pub fn new(
        name: &'static str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        // ---
        Self {
            name,
            failure_threshold,
            recovery_timeout,
            success_threshold,
            adaptive: false,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Breaker whose recovery timeout stretches as failures accumulate:
    /// x1.5 after 5 consecutive failures, x2 after 10, capped at 5 minutes.
    pub fn adaptive(
        name: &'static str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        // ---
        let mut b = Self::new(name, failure_threshold, recovery_timeout, success_threshold);
        b.adaptive = true;
        b
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Gate a call. `Ok` means proceed; an OPEN breaker whose recovery
    /// timeout has elapsed transitions to HALF_OPEN and lets the call
    /// through as a probe.
    pub fn check(&self) -> Result<(), Backpressure> {
        // ---
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.effective_recovery(&inner) {
                    tracing::info!("breaker {} entering half-open probe", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(Backpressure::CircuitOpen(self.name))
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        // ---
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    tracing::info!("breaker {} closed after probe", self.name);
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            // A success racing the open transition changes nothing.
            BreakerState::Open => {}
        }
    }

    /// Record a failed call. Any failure in HALF_OPEN reopens immediately.
    pub fn record_failure(&self) {
        // ---
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        "breaker {} opened after {} consecutive failures",
                        self.name,
                        inner.consecutive_failures
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!("breaker {} reopened: probe failed", self.name);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn effective_recovery(&self, inner: &Inner) -> Duration {
        // ---
        if !self.adaptive {
            return self.recovery_timeout;
        }
        let scaled = if inner.consecutive_failures >= 10 {
            self.recovery_timeout * 2
        } else if inner.consecutive_failures >= 5 {
            self.recovery_timeout.mul_f64(1.5)
        } else {
            self.recovery_timeout
        };
        scaled.min(MAX_RECOVERY)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // ---
        // Lock poisoning only happens if a holder panicked; the counters
        // are still coherent, so continue with the inner value.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        // ---
        CircuitBreaker::new("test", 2, Duration::from_millis(30), 2)
    }

    #[test]
    fn opens_after_threshold_failures() {
        // ---
        let b = fast_breaker();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        // ---
        let b = fast_breaker();
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_then_close() {
        // ---
        let b = fast_breaker();
        b.record_failure();
        b.record_failure();
        assert!(b.check().is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        // ---
        let b = fast_breaker();
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.check().is_ok());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());
    }

    #[test]
    fn adaptive_recovery_stretches() {
        // ---
        let b = CircuitBreaker::adaptive("test", 2, Duration::from_millis(40), 1);
        for _ in 0..6 {
            b.record_failure();
        }
        // Six consecutive failures: recovery is 40ms * 1.5 = 60ms.
        std::thread::sleep(Duration::from_millis(45));
        assert!(b.check().is_err());
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.check().is_ok());
    }
}
