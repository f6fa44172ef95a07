//! Retry timing for source startup, polling and reconnects.
//!
//! Waiting is expressed as a `RetryPolicy` (attempt budget plus delay curve)
//! executed against a `Sleeper`, so timeout behavior can be exercised in tests
//! without real sleeps.

use std::time::Duration;

/// Something that can pause the calling thread.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeper backed by `std::thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Attempt budget and delay curve.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts; `u32::MAX` means unbounded.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Growth factor applied per attempt (1.0 = fixed delay).
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    pub fn exponential(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Wait for the first frame: 10 polls, 1s apart.
    pub fn startup() -> Self {
        Self::fixed(10, Duration::from_secs(1))
    }

    /// Reconnect backoff: 1s doubling up to 30s, unbounded attempts.
    pub fn reconnect() -> Self {
        Self::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay preceding `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Sleep, then check `ready`, up to `max_attempts` times.
///
/// Returns `Ok(attempt)` for the attempt on which `ready` first held, or
/// `Err(attempts)` once the budget is exhausted.
pub fn poll_until<F>(policy: &RetryPolicy, sleeper: &dyn Sleeper, mut ready: F) -> Result<u32, u32>
where
    F: FnMut() -> bool,
{
    let mut attempt = 0;
    while attempt < policy.max_attempts {
        attempt += 1;
        sleeper.sleep(policy.delay_for(attempt));
        if ready() {
            return Ok(attempt);
        }
    }
    Err(attempt)
}

/// Stateful backoff cursor over a policy.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records requested sleeps instead of sleeping.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[test]
    fn startup_policy_gives_up_after_ten_one_second_polls() {
        let sleeper = RecordingSleeper::default();
        let result = poll_until(&RetryPolicy::startup(), &sleeper, || false);

        assert_eq!(result, Err(10));
        let slept = sleeper.slept.lock().unwrap();
        assert_eq!(slept.len(), 10);
        assert!(slept.iter().all(|d| *d == Duration::from_secs(1)));
    }

    #[test]
    fn poll_stops_on_first_success() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let result = poll_until(&RetryPolicy::startup(), &sleeper, || {
            calls += 1;
            calls == 3
        });

        assert_eq!(result, Ok(3));
        assert_eq!(sleeper.slept.lock().unwrap().len(), 3);
    }

    #[test]
    fn exponential_delays_are_capped() {
        let policy = RetryPolicy::reconnect();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(500), Duration::from_secs(30));
    }

    #[test]
    fn backoff_respects_attempt_budget_and_resets() {
        let mut backoff = Backoff::new(RetryPolicy::fixed(2, Duration::from_millis(5)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(5)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(5)));
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }
}
