//! Fixed-window per-minute admission counter (component C1).

use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_LIMIT: u32 = 60;

struct State {
    window_start: Instant,
    count: u32,
}

/// A single-mutex fixed-window rate limiter. No bursting, no token refill —
/// exactly `limit` admissions per rolling 60 s window, reset in one shot
/// once the window elapses.
pub struct RateLimiter {
    limit: u32,
    state: Mutex<State>,
}

impl RateLimiter {
    /// Builds a limiter with the given per-minute limit. A `limit` of zero
    /// falls back to the default of 60/min, per spec §4.1.
    pub fn new(limit: u32) -> Self {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        Self {
            limit,
            state: Mutex::new(State {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Returns `(true, Duration::ZERO)` if admitted, else `(false,
    /// retry_after)` where `retry_after` is the time remaining in the
    /// current window.
    pub fn allow(&self) -> (bool, Duration) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();

        if now.duration_since(state.window_start) >= WINDOW {
            state.window_start = now;
            state.count = 0;
        }

        if state.count < self.limit {
            state.count += 1;
            (true, Duration::ZERO)
        } else {
            let window_end = state.window_start + WINDOW;
            let retry_after = window_end.saturating_duration_since(now);
            (false, retry_after)
        }
    }

    /// Diagnostic only — not part of the admission contract.
    pub fn current_count(&self) -> u32 {
        self.state.lock().expect("rate limiter mutex poisoned").count
    }

    /// Diagnostic only — not part of the admission contract.
    pub fn window_started_at(&self) -> Instant {
        self.state.lock().expect("rate limiter mutex poisoned").window_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit() {
        let limiter = RateLimiter::new(3);
        assert_eq!(limiter.allow(), (true, Duration::ZERO));
        assert_eq!(limiter.allow(), (true, Duration::ZERO));
        assert_eq!(limiter.allow(), (true, Duration::ZERO));
        let (ok, retry_after) = limiter.allow();
        assert!(!ok);
        assert!(retry_after > Duration::ZERO);
    }

    #[test]
    fn zero_limit_falls_back_to_default() {
        let limiter = RateLimiter::new(0);
        assert_eq!(limiter.current_count(), 0);
        for _ in 0..DEFAULT_LIMIT {
            assert!(limiter.allow().0);
        }
        assert!(!limiter.allow().0);
    }

    #[test]
    fn n_calls_in_one_window_admit_min_n_limit() {
        let limiter = RateLimiter::new(10);
        let admitted = (0..25).filter(|_| limiter.allow().0).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn current_count_tracks_admissions() {
        let limiter = RateLimiter::new(5);
        limiter.allow();
        limiter.allow();
        assert_eq!(limiter.current_count(), 2);
    }
}
