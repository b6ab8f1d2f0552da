//! Circuit breaker driven by a rolling failure ratio.
//!
//! - CLOSED: calls flow through; outcomes are sampled over `sampling_window`.
//!   Once at least `minimum_throughput` samples exist and the failure ratio
//!   reaches `failure_ratio`, the circuit opens.
//! - OPEN: calls are rejected without touching the network for `break_duration`.
//! - HALF_OPEN: exactly one trial call is admitted. Success closes the circuit,
//!   failure reopens it.

use crate::config::NetworkConfig;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0.0..=1.0) at which the circuit opens.
    pub failure_ratio: f64,
    /// Minimum samples in the window before the ratio is evaluated.
    pub minimum_throughput: u32,
    /// Rolling window over which outcomes are sampled.
    pub sampling_window: Duration,
    /// How long the circuit stays open before admitting a trial call.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: NetworkConfig::BREAKER_FAILURE_RATIO,
            minimum_throughput: NetworkConfig::BREAKER_MINIMUM_THROUGHPUT,
            sampling_window: NetworkConfig::BREAKER_SAMPLING_WINDOW,
            break_duration: NetworkConfig::BREAKER_BREAK_DURATION,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// (timestamp, failed) pairs inside the sampling window.
    samples: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    rejected: u64,
}

/// Circuit breaker guarding one upstream source.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    /// Source this circuit breaker protects.
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                samples: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                rejected: 0,
            }),
            name: name.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // The state is plain counters; a panic mid-update leaves it usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, moving OPEN to HALF_OPEN once the break has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Check whether a call may proceed. In HALF_OPEN only the first caller
    /// gets through until the trial's outcome is recorded.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);

        let allowed = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    debug!("Circuit breaker for {} admitting trial call", self.name);
                    true
                }
            }
        };
        if !allowed {
            inner.rejected += 1;
        }
        allowed
    }

    /// Record a successful logical call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::HalfOpen => self.close(&mut inner),
            CircuitState::Closed => {
                let now = Instant::now();
                inner.samples.push_back((now, false));
                self.prune(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed logical call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("Circuit breaker for {} trial call failed, reopening", self.name);
                self.open(&mut inner);
            }
            CircuitState::Closed => {
                let now = Instant::now();
                inner.samples.push_back((now, true));
                self.prune(&mut inner, now);

                let total = inner.samples.len();
                let failures = inner.samples.iter().filter(|(_, failed)| *failed).count();
                if total >= self.config.minimum_throughput.max(1) as usize
                    && failures as f64 / total as f64 >= self.config.failure_ratio
                {
                    warn!(
                        "Circuit breaker for {} opened after {}/{} failed calls",
                        self.name, failures, total
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Release an admitted call that produced no verdict (e.g. it was cancelled).
    pub fn record_abandoned(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        let now = Instant::now();
        self.prune(&mut inner, now);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            window_samples: inner.samples.len() as u32,
            window_failures: inner.samples.iter().filter(|(_, f)| *f).count() as u32,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            rejected: inner.rejected,
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.close(&mut inner);
        info!("Circuit breaker for {} reset to CLOSED", self.name);
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        inner.samples.clear();
    }

    fn close(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker for {} recovered to CLOSED", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.samples.clear();
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened) = inner.opened_at {
            if opened.elapsed() >= self.config.break_duration {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = false;
                debug!("Circuit breaker for {} entering HALF_OPEN", self.name);
            }
        }
    }

    fn prune(&self, inner: &mut BreakerState, now: Instant) {
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > self.config.sampling_window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Point-in-time view of a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub window_samples: u32,
    pub window_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ratio: f64, min: u32, break_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_ratio: ratio,
            minimum_throughput: min,
            sampling_window: Duration::from_secs(60),
            break_duration: Duration::from_millis(break_ms),
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("models");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_ratio_below_minimum_throughput_stays_closed() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 4, 1000));
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_ratio_below_threshold_stays_closed() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 4, 1000));
        cb.record_success();
        cb.record_success();
        cb.record_success();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_failures, 1);
    }

    #[test]
    fn test_open_rejects_without_calling() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 2, 60_000));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());
        assert_eq!(cb.stats().rejected, 2);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 2, 10));
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 2, 10));
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_abandoned_trial_frees_slot() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 1, 10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.allow_request());
        cb.record_abandoned();
        assert!(cb.allow_request());
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::with_config("models", config(0.5, 1, 60_000));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
