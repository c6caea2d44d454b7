//! Retry policy: who gets another chance, when, and who goes to the
//! dead-letter lane.

use std::time::Duration;

/// Exponential backoff never waits longer than this.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// How a failed step is classified for retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connectivity, timeout: short exponential backoff applies.
    Transient,
    /// A downstream provider is shedding load. Short retries are certain
    /// to fail again, so one long fixed delay applies instead.
    Overloaded,
    /// The workflow determined the task cannot be completed as specified.
    /// Never retried.
    Business,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Overloaded => "overloaded",
            FailureKind::Business => "business",
        }
    }
}

/// What to do with a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue { delay: Duration },
    DeadLetter,
}

/// Bounded-backoff policy over dispatch attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first delivery; attempt max_retries + 1 is the
    /// last one executed.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub overload_backoff: Duration,
}

impl RetryPolicy {
    /// Decide the fate of attempt `attempt` (1-based) that failed with
    /// `kind`.
    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        match kind {
            FailureKind::Business => RetryDecision::DeadLetter,
            _ if attempt > self.max_retries => RetryDecision::DeadLetter,
            FailureKind::Overloaded => RetryDecision::Requeue {
                delay: self.overload_backoff,
            },
            FailureKind::Transient => RetryDecision::Requeue {
                delay: self.backoff_delay(attempt),
            },
        }
    }

    /// base × 2^(attempt−1), capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}
