//! Bounded re-registration after failures
//!
//! The engine reports `Failed` when a registrar rejects a REGISTER or cannot
//! be reached, and does not retry on its own. [`RegistrationRetry`] tracks the
//! retry budget of the default proxy and tells the controller when the next
//! REGISTER is due.
//!
//! # Backoff Strategy
//!
//! 1. Start with `initial_delay`
//! 2. Multiply by `backoff_multiplier` after each failure
//! 3. Cap at `max_delay`
//! 4. Optionally add ±10% jitter
//!
//! A successful registration restores the full budget. Once shutdown begins
//! the tracker is suspended and never schedules again.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of re-registration attempts
    pub max_attempts: u32,
    /// Delay before the first re-registration
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            let next_ms = (delay.as_millis() as f64 * self.backoff_multiplier) as u64;
            delay = Duration::from_millis(next_ms).min(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Outcome of reporting a failure to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// A re-registration is scheduled after `delay`
    Scheduled { attempt: u32, delay: Duration },
    /// The budget is spent
    GaveUp { attempts: u32 },
    /// Retries are suspended or one is already pending
    Ignored,
}

/// Retry state of one proxy registration
#[derive(Debug, Clone)]
pub struct RegistrationRetry {
    policy: RetryPolicy,
    attempts: u32,
    due_at: Option<Instant>,
    suspended: bool,
}

impl RegistrationRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            due_at: None,
            suspended: false,
        }
    }

    /// Attempts made since the last successful registration
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a `Failed` registration observed at `now`
    pub fn on_failed(&mut self, now: Instant) -> RetryDecision {
        if self.suspended || self.due_at.is_some() {
            return RetryDecision::Ignored;
        }
        if self.attempts >= self.policy.max_attempts {
            debug!(
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts,
                "Retry budget exhausted"
            );
            return RetryDecision::GaveUp {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        let delay = self.jittered(self.policy.delay_for(self.attempts));
        self.due_at = Some(now + delay);
        warn!(
            attempt = self.attempts,
            max_attempts = self.policy.max_attempts,
            next_delay_ms = delay.as_millis() as u64,
            "Registration failed, will retry"
        );
        RetryDecision::Scheduled {
            attempt: self.attempts,
            delay,
        }
    }

    /// Record a successful registration; restores the full budget
    pub fn on_registered(&mut self) {
        if self.attempts > 0 {
            debug!(attempts = self.attempts, "Registration succeeded after retries");
        }
        self.attempts = 0;
        self.due_at = None;
    }

    /// Whether a scheduled retry is due at `now`; consumes it if so
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.due_at {
            Some(due_at) if !self.suspended && now >= due_at => {
                self.due_at = None;
                true
            }
            _ => false,
        }
    }

    /// Stop scheduling retries for good
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.due_at = None;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.policy.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        Duration::from_millis((delay.as_millis() as f64 * (1.0 + jitter)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for(10), Duration::from_millis(250));
    }

    #[test]
    fn test_gives_up_after_budget() {
        let mut retry = RegistrationRetry::new(policy());
        let start = Instant::now();

        for attempt in 1..=3 {
            let decision = retry.on_failed(start);
            assert_eq!(
                decision,
                RetryDecision::Scheduled {
                    attempt,
                    delay: policy().delay_for(attempt)
                }
            );
            assert!(!retry.take_due(start));
            assert!(retry.take_due(start + Duration::from_secs(1)));
        }

        assert_eq!(retry.on_failed(start), RetryDecision::GaveUp { attempts: 3 });
        assert!(!retry.take_due(start + Duration::from_secs(60)));
    }

    #[test]
    fn test_success_restores_budget() {
        let mut retry = RegistrationRetry::new(policy());
        let now = Instant::now();

        retry.on_failed(now);
        assert!(retry.take_due(now + Duration::from_millis(100)));
        retry.on_registered();
        assert_eq!(retry.attempts(), 0);

        assert_eq!(
            retry.on_failed(now),
            RetryDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_pending_retry_ignores_repeated_failures() {
        let mut retry = RegistrationRetry::new(policy());
        let now = Instant::now();

        assert!(matches!(retry.on_failed(now), RetryDecision::Scheduled { .. }));
        assert_eq!(retry.on_failed(now), RetryDecision::Ignored);
        assert_eq!(retry.attempts(), 1);
    }

    #[test]
    fn test_suspend_cancels_pending_retry() {
        let mut retry = RegistrationRetry::new(policy());
        let now = Instant::now();

        retry.on_failed(now);
        retry.suspend();
        assert!(!retry.take_due(now + Duration::from_secs(10)));
        assert_eq!(retry.on_failed(now), RetryDecision::Ignored);
    }

    #[test]
    fn test_zero_attempts_gives_up_immediately() {
        let mut retry = RegistrationRetry::new(RetryPolicy {
            max_attempts: 0,
            ..policy()
        });
        assert_eq!(
            retry.on_failed(Instant::now()),
            RetryDecision::GaveUp { attempts: 0 }
        );
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let mut retry = RegistrationRetry::new(RetryPolicy {
            use_jitter: true,
            initial_delay: Duration::from_millis(1000),
            ..policy()
        });
        match retry.on_failed(Instant::now()) {
            RetryDecision::Scheduled { delay, .. } => {
                assert!(delay >= Duration::from_millis(900));
                assert!(delay <= Duration::from_millis(1100));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }
}
