use chrono::Duration;
use rand::Rng;

/// The retry policy used to determine how long until a failed job runs again.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the time until the next retry for a job on its given attempt.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt) as i32;

        if let Some(max_interval) = self.maximum_interval {
            std::cmp::min(candidate_interval, max_interval)
        } else {
            candidate_interval
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::seconds(1),
            maximum_interval: None,
        }
    }
}

/// Delay before a task blocked on a per-user slot tries again.
/// Exponential in the number of waits so far, clamped to 64s, with jitter so
/// a burst of blocked tasks for one user does not thunder back in lockstep.
pub fn slot_backoff(waits: u32) -> Duration {
    let base = 2u64.pow(waits.clamp(1, 6)).min(64);
    let jitter: f64 = rand::thread_rng().gen_range(0.1..0.7);
    Duration::milliseconds(((base as f64 + jitter) * 1000.0) as i64)
}

/// Delay before a stage re-runs its retry set: (2^(attempt-1)) minutes.
pub fn stage_retry_countdown(attempt: i32) -> Duration {
    let exponent = (attempt - 1).clamp(0, 10) as u32;
    Duration::seconds(2i64.pow(exponent) * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_interval_grows_exponentially() {
        let policy = RetryPolicy::new(2, Duration::seconds(1), None);
        assert_eq!(policy.retry_interval(0), Duration::seconds(1));
        assert_eq!(policy.retry_interval(1), Duration::seconds(2));
        assert_eq!(policy.retry_interval(2), Duration::seconds(4));
        assert_eq!(policy.retry_interval(5), Duration::seconds(32));
    }

    #[test]
    fn test_retry_interval_respects_maximum() {
        let policy = RetryPolicy::new(2, Duration::seconds(1), Some(Duration::seconds(4)));
        assert_eq!(policy.retry_interval(10), Duration::seconds(4));
    }

    #[test]
    fn test_slot_backoff_bounds() {
        for waits in 0..12 {
            let delay = slot_backoff(waits);
            assert!(delay >= Duration::milliseconds(2100), "lower bound at waits={}", waits);
            assert!(delay <= Duration::milliseconds(64700), "upper bound at waits={}", waits);
        }
    }

    #[test]
    fn test_stage_retry_countdown() {
        assert_eq!(stage_retry_countdown(1), Duration::seconds(60));
        assert_eq!(stage_retry_countdown(2), Duration::seconds(120));
        assert_eq!(stage_retry_countdown(3), Duration::seconds(240));
    }
}
