//! Preemptive rate limiting driven by upstream quota headers.
//!
//! The upstream API allows a fixed number of requests per minute and reports
//! the remaining quota on every response. The budget tracked here is a local
//! estimate owned by the client instance, not shared across processes;
//! aggregate throughput under many worker processes can still exceed the
//! upstream quota.

use std::time::{Duration, Instant};
use tracing::info;

/// Requests allowed per window on the free tier.
pub const WINDOW_CAP: u32 = 60;

/// Remaining-quota threshold below which we stop and wait out the window.
const LOW_WATER: u32 = 5;

/// Upstream quota window.
const WINDOW: Duration = Duration::from_secs(60);

/// Local estimate of the upstream request budget.
#[derive(Debug)]
pub struct RateBudget {
    remaining: u32,
    last_request: Instant,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl RateBudget {
    pub fn new() -> Self {
        Self {
            remaining: WINDOW_CAP,
            last_request: Instant::now(),
        }
    }

    /// Time to wait before the next request may be sent, if the budget is
    /// nearly exhausted. The window is assumed to reset one `WINDOW` after
    /// the last request.
    pub fn required_wait(&self, now: Instant) -> Option<Duration> {
        if self.remaining > LOW_WATER {
            return None;
        }
        let elapsed = now.duration_since(self.last_request);
        WINDOW.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Block until a request may be sent, then stamp the request time.
    ///
    /// When the budget is nearly exhausted this sleeps until the quota window
    /// is expected to reset and resets the local estimate to the cap.
    pub async fn acquire(&mut self) {
        if let Some(wait) = self.required_wait(Instant::now()) {
            info!(wait = ?wait, "Preemptive rate limit wait");
            tokio::time::sleep(wait).await;
            self.remaining = WINDOW_CAP;
        }
        self.last_request = Instant::now();
    }

    /// Refresh the estimate from the server-reported remaining-quota header.
    pub fn observe_remaining(&mut self, remaining: u32) {
        self.remaining = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_wait_with_headroom() {
        let budget = RateBudget::new();
        assert_eq!(budget.required_wait(Instant::now()), None);
    }

    #[test]
    fn waits_out_window_when_nearly_exhausted() {
        let mut budget = RateBudget::new();
        budget.observe_remaining(3);
        let elapsed = Duration::from_secs(10);
        let wait = budget
            .required_wait(budget.last_request + elapsed)
            .expect("should wait");
        // The wait must cover at least the time left in the current window.
        assert!(wait >= WINDOW - elapsed - Duration::from_millis(1));
        assert!(wait <= WINDOW);
    }

    #[test]
    fn no_wait_once_window_has_passed() {
        let mut budget = RateBudget::new();
        budget.observe_remaining(0);
        let later = budget.last_request + WINDOW + Duration::from_secs(1);
        assert_eq!(budget.required_wait(later), None);
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut budget = RateBudget::new();
        budget.observe_remaining(LOW_WATER);
        assert!(budget.required_wait(budget.last_request).is_some());
        budget.observe_remaining(LOW_WATER + 1);
        assert!(budget.required_wait(budget.last_request).is_none());
    }
}
