//! Bounded retry with randomized exponential backoff.
//!
//! Two failure domains retry in this worker: completion calls against the
//! LLM endpoint and job-store writes. Both share one policy shape: a fixed
//! attempt budget and a delay ceiling that doubles per failure, with the
//! actual sleep drawn uniformly below the ceiling so a stage's concurrent
//! analyzer tasks do not hammer a recovering dependency in lockstep.

use std::time::Duration;

use reqwest::StatusCode;

/// Retry budget and delay curve for one failure domain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackoffPolicy {
    /// Total tries allowed, the first one included.
    attempts: usize,
    /// Delay ceiling after the first failure.
    base: Duration,
    /// Upper bound the doubling ceiling never exceeds.
    cap: Duration,
}

impl BackoffPolicy {
    pub(crate) const fn new(attempts: usize, base: Duration, cap: Duration) -> Self {
        Self {
            attempts,
            base,
            cap,
        }
    }

    /// How long to sleep before the next try, or `None` once the attempt
    /// budget is spent. `failures` counts the tries that have already failed,
    /// so the first call after an error passes 1.
    pub(crate) fn next_delay(&self, failures: usize) -> Option<Duration> {
        if failures == 0 || failures >= self.attempts {
            return None;
        }
        // Ceiling: base * 2^(failures-1), clamped to the cap. The shift is
        // bounded well below overflow; past ~20 doublings the cap always
        // wins anyway.
        let shift = u32::try_from(failures - 1).unwrap_or(20).min(20);
        let ceiling = self.base.saturating_mul(1u32 << shift).min(self.cap);
        // Uniform draw below the ceiling.
        Some(ceiling.mul_f64(rand::random::<f64>()))
    }
}

/// Whether an HTTP-level failure is worth another try: connectivity and
/// timeout problems, plus throttled or server-side responses.
pub(crate) fn transient_http_error(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() {
        return true;
    }
    error.status().is_some_and(transient_status)
}

/// Status codes that signal a transient condition rather than a bad request.
pub(crate) fn transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(4, Duration::from_millis(100), Duration::from_millis(450))
    }

    #[test]
    fn attempt_budget_is_finite() {
        let policy = policy();
        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_some());
        assert!(policy.next_delay(4).is_none(), "budget of 4 tries is spent");
        assert!(policy.next_delay(0).is_none(), "no delay before any failure");
    }

    #[test]
    fn ceiling_doubles_until_the_cap_wins() {
        let policy = policy();
        assert!(policy.next_delay(1).unwrap() <= Duration::from_millis(100));
        assert!(policy.next_delay(2).unwrap() <= Duration::from_millis(200));
        // 100ms * 2^2 = 400ms, still under the 450ms cap.
        assert!(policy.next_delay(3).unwrap() <= Duration::from_millis(400));

        let generous = BackoffPolicy::new(32, Duration::from_millis(100), Duration::from_millis(450));
        for failures in 3..20 {
            assert!(generous.next_delay(failures).unwrap() <= Duration::from_millis(450));
        }
    }

    #[test]
    fn sleeps_are_randomized() {
        let generous = BackoffPolicy::new(8, Duration::from_millis(100), Duration::from_secs(10));
        let draws: Vec<Duration> = (0..16)
            .map(|_| generous.next_delay(3).unwrap())
            .collect();
        assert!(
            draws.iter().any(|d| *d != draws[0]),
            "16 draws should not all be identical"
        );
    }

    #[test]
    fn zero_base_policy_never_sleeps() {
        let instant = BackoffPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert_eq!(instant.next_delay(1), Some(Duration::ZERO));
        assert_eq!(instant.next_delay(2), Some(Duration::ZERO));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(transient_status(StatusCode::BAD_GATEWAY));
        assert!(transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!transient_status(StatusCode::BAD_REQUEST));
        assert!(!transient_status(StatusCode::UNAUTHORIZED));
        assert!(!transient_status(StatusCode::NOT_FOUND));
    }
}
