//! Bounded retry loops for suspend requests that lost a race.

use std::{
    fmt,
    time::{Duration, Instant},
};

use smallvec::SmallVec;

use crate::fatal;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RetryReason {
    /// Another suspend-all is in flight. The attempt already waited for it to finish.
    SuspendAllInProgress,
    /// Somebody is suspending the requester; continuing risks a suspend cycle.
    SelfSuspended,
    /// A root flip has not finished on some thread.
    FlipInProgress,
    /// The target of a targeted suspend is running its flip function.
    TargetFlipping,
    /// The thread to unregister is still suspended.
    StillSuspended,
}

impl RetryReason {
    /// Whether the loop should back off before the next attempt.
    pub fn needs_sleep(self) -> bool {
        !matches!(self, RetryReason::SuspendAllInProgress)
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryReason::SuspendAllInProgress => "suspend-all in progress",
            RetryReason::SelfSuspended => "requester suspended",
            RetryReason::FlipInProgress => "thread flip in progress",
            RetryReason::TargetFlipping => "target running flip function",
            RetryReason::StillSuspended => "thread still suspended",
        })
    }
}

pub enum Attempt<T> {
    Done(T),
    Retry(RetryReason),
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub sleep: Duration,
    /// Wall clock bound, checked in addition to `max_attempts`.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, sleep: Duration) -> Self {
        Self {
            max_attempts,
            sleep,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Run `body` until it returns [`Attempt::Done`].
///
/// Exhausting the policy is fatal; the message lists how often each reason was hit.
pub fn retry_with_backoff<T>(policy: RetryPolicy, what: &str, mut body: impl FnMut(usize) -> Attempt<T>) -> T {
    let start = Instant::now();
    let mut reasons: SmallVec<[(RetryReason, usize); 4]> = SmallVec::new();

    for attempt in 0..policy.max_attempts {
        let reason = match body(attempt) {
            Attempt::Done(value) => return value,
            Attempt::Retry(reason) => reason,
        };

        match reasons.iter_mut().find(|(seen, _)| *seen == reason) {
            Some((_, count)) => *count += 1,
            None => reasons.push((reason, 1)),
        }

        if policy
            .timeout
            .is_some_and(|timeout| start.elapsed() >= timeout)
        {
            break;
        }

        if reason.needs_sleep() && !policy.sleep.is_zero() {
            std::thread::sleep(policy.sleep);
        }
    }

    let summary = reasons
        .iter()
        .map(|(reason, count)| format!("{reason}: {count}"))
        .collect::<Vec<_>>()
        .join(", ");
    fatal!(
        "{what}: retries exhausted after {:?} ({summary})",
        start.elapsed()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_after_retries() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let value = retry_with_backoff(policy, "test", |attempt| {
            if attempt < 3 {
                Attempt::Retry(RetryReason::SelfSuspended)
            } else {
                Attempt::Done(attempt)
            }
        });
        assert_eq!(value, 3);
    }

    #[test]
    #[should_panic(expected = "requester suspended: 2, thread flip in progress: 1")]
    fn exhausted_budget_is_fatal() {
        let policy = RetryPolicy::new(3, Duration::from_micros(1));
        retry_with_backoff::<()>(policy, "test", |attempt| {
            if attempt == 1 {
                Attempt::Retry(RetryReason::FlipInProgress)
            } else {
                Attempt::Retry(RetryReason::SelfSuspended)
            }
        });
    }

    #[test]
    #[should_panic(expected = "retries exhausted")]
    fn timeout_is_fatal() {
        let policy = RetryPolicy::new(usize::MAX, Duration::from_millis(1))
            .with_timeout(Duration::from_millis(10));
        retry_with_backoff::<()>(policy, "test", |_| Attempt::Retry(RetryReason::StillSuspended));
    }
}
