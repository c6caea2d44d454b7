//! Retry policy boundaries: who retries, with what delay, and when the
//! dead-letter lane takes over.

use conductor_rs::dispatch::retry::{FailureKind, RetryDecision, RetryPolicy};
use std::time::Duration;

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_backoff: Duration::from_secs(30),
        overload_backoff: Duration::from_secs(900),
    }
}

#[test]
fn business_failures_never_retry() {
    let policy = policy();
    assert_eq!(
        policy.decide(FailureKind::Business, 1),
        RetryDecision::DeadLetter
    );
}

#[test]
fn transient_failures_back_off_exponentially() {
    let policy = policy();

    let delays: Vec<Duration> = (1..=3)
        .map(|attempt| match policy.decide(FailureKind::Transient, attempt) {
            RetryDecision::Requeue { delay } => delay,
            RetryDecision::DeadLetter => panic!("attempt {attempt} should requeue"),
        })
        .collect();

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(120),
        ]
    );
}

#[test]
fn transient_budget_is_max_retries_plus_one_attempts() {
    // Exactly max_retries + 1 failures: the first max_retries requeue, the
    // final one dead-letters, and nothing after it would run.
    let policy = policy();
    let mut dead_letters = 0;
    let mut requeues = 0;

    for attempt in 1..=policy.max_retries + 1 {
        match policy.decide(FailureKind::Transient, attempt) {
            RetryDecision::Requeue { .. } => requeues += 1,
            RetryDecision::DeadLetter => dead_letters += 1,
        }
    }

    assert_eq!(requeues, 3);
    assert_eq!(dead_letters, 1);
}

#[test]
fn overload_uses_one_long_fixed_delay() {
    let policy = policy();

    for attempt in 1..=3 {
        match policy.decide(FailureKind::Overloaded, attempt) {
            RetryDecision::Requeue { delay } => {
                assert_eq!(delay, Duration::from_secs(900), "attempt {attempt}");
            }
            RetryDecision::DeadLetter => panic!("attempt {attempt} should requeue"),
        }
    }
    // The budget still bounds it.
    assert_eq!(
        policy.decide(FailureKind::Overloaded, 4),
        RetryDecision::DeadLetter
    );
}

#[test]
fn backoff_is_capped() {
    let policy = RetryPolicy {
        max_retries: 40,
        base_backoff: Duration::from_secs(30),
        overload_backoff: Duration::from_secs(900),
    };

    match policy.decide(FailureKind::Transient, 20) {
        RetryDecision::Requeue { delay } => assert_eq!(delay, Duration::from_secs(3600)),
        RetryDecision::DeadLetter => panic!("within budget, should requeue"),
    }
}
