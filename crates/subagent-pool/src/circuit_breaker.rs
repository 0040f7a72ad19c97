//! Lock-free three-state circuit breaker (component C2).
//!
//! All state lives in atomics so `allow`/`record_success`/`record_failure`
//! never block on a mutex — the breaker sits directly on the executor's hot
//! path (spec §4.6 step 1).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The outcome of [`CircuitBreaker::allow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitDecision {
    pub permitted: bool,
    pub retry_after: Duration,
}

pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    last_fail_nanos: AtomicU64,
    half_open_attempts: AtomicU8,
    threshold: u32,
    timeout: Duration,
    epoch: Instant,
}

impl CircuitBreaker {
    /// `threshold` and `timeout` of zero fall back to the spec defaults (5
    /// failures, 30 s).
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            last_fail_nanos: AtomicU64::new(0),
            half_open_attempts: AtomicU8::new(0),
            threshold: if threshold == 0 { DEFAULT_THRESHOLD } else { threshold },
            timeout: if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout },
            epoch: Instant::now(),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Requests permission to call through the breaker, tagged `name` for
    /// log correlation (usually the pool's image name).
    pub fn allow(&self, name: &str) -> CircuitDecision {
        match self.state.load(Ordering::Acquire) {
            CLOSED => CircuitDecision {
                permitted: true,
                retry_after: Duration::ZERO,
            },
            OPEN => {
                let last_fail = self.last_fail_nanos.load(Ordering::Acquire);
                let elapsed = Duration::from_nanos(self.now_nanos().saturating_sub(last_fail));
                if elapsed <= self.timeout {
                    CircuitDecision {
                        permitted: false,
                        retry_after: self.timeout.saturating_sub(elapsed),
                    }
                } else {
                    // Timeout elapsed: whoever wins the CAS moves Open -> HalfOpen.
                    // Callers that lose the race simply observe the state we
                    // already transitioned to.
                    let _ = self.state.compare_exchange(
                        OPEN,
                        HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    let got_probe = self
                        .half_open_attempts
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                    if got_probe {
                        warn!(breaker = name, "circuit half-open, admitting probe");
                    }
                    CircuitDecision {
                        permitted: got_probe,
                        retry_after: Duration::ZERO,
                    }
                }
            }
            HALF_OPEN => {
                let got_probe = self
                    .half_open_attempts
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                CircuitDecision {
                    permitted: got_probe,
                    retry_after: Duration::ZERO,
                }
            }
            other => unreachable!("invalid circuit breaker state {other}"),
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.half_open_attempts.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
    }

    pub fn record_failure(&self, name: &str) {
        self.failures.fetch_add(1, Ordering::AcqRel);
        self.last_fail_nanos.store(self.now_nanos(), Ordering::Release);

        if self.state.load(Ordering::Acquire) == HALF_OPEN {
            self.half_open_attempts.store(0, Ordering::Release);
            self.state.store(OPEN, Ordering::Release);
            return;
        }

        if self.failures.load(Ordering::Acquire) >= self.threshold {
            let tripped = self
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if tripped {
                warn!(breaker = name, failures = self.threshold, "circuit tripped open");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_state_always_permits() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        assert!(breaker.allow("img").permitted);
    }

    #[test]
    fn trips_open_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure("img");
        breaker.record_failure("img");
        assert!(breaker.is_closed());
        breaker.record_failure("img");
        assert!(!breaker.is_closed());
        let decision = breaker.allow("img");
        assert!(!decision.permitted);
        assert!(decision.retry_after > Duration::ZERO);
    }

    #[test]
    fn exactly_one_probe_admitted_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        breaker.record_failure("img");
        assert!(!breaker.is_closed());
        std::thread::sleep(Duration::from_millis(30));

        let first = breaker.allow("img");
        let second = breaker.allow("img");
        assert!(first.permitted);
        assert!(!second.permitted);
    }

    #[test]
    fn success_after_probe_closes_circuit() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure("img");
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow("img").permitted);
        breaker.record_success();
        assert!(breaker.is_closed());
        assert!(breaker.allow("img").permitted);
    }

    #[test]
    fn failure_during_half_open_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure("img");
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.allow("img").permitted);
        breaker.record_failure("img");
        let decision = breaker.allow("img");
        assert!(!decision.permitted);
    }

    #[test]
    fn zero_threshold_and_timeout_fall_back_to_defaults() {
        let breaker = CircuitBreaker::new(0, Duration::ZERO);
        for _ in 0..4 {
            breaker.record_failure("img");
            assert!(breaker.is_closed());
        }
        breaker.record_failure("img");
        assert!(!breaker.is_closed());
    }
}
