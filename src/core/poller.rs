// Retry bookkeeping for status queries

use crate::error::PollError;
use std::time::Duration;
use tokio::time::Instant;

/// Bounded exponential backoff applied to failing status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before a job is escalated to failed.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next query after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Per-job poll state shared by all executors.
///
/// The poller never sleeps. After a failed query it records when the next
/// attempt is due, and the executor reports the job as still running until
/// then, so one flaky job never stalls the manager's loop.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    policy: RetryPolicy,
    failures: u32,
    retry_at: Option<Instant>,
}

impl StatusPoller {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            retry_at: None,
        }
    }

    /// Whether a query should be issued now.
    pub fn is_due(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// A query answered; reset the failure streak.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }

    /// A query failed. Returns `PollError::Exhausted` once the policy's
    /// attempt budget is spent, otherwise schedules the next attempt.
    pub fn record_failure(&mut self, now: Instant, error: &PollError) -> Result<(), PollError> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.retry_at = None;
            return Err(PollError::Exhausted {
                attempts: self.failures,
                last: error.to_string(),
            });
        }

        let delay = self.policy.backoff(self.failures);
        tracing::warn!(
            "Status query failed ({}/{}), retrying in {:?}: {}",
            self.failures,
            self.policy.max_attempts,
            delay,
            error
        );
        self.retry_at = Some(now + delay);
        Ok(())
    }
}
