//! Retry policy shapes: a small trait with `reset`/`next_backoff`, an
//! `ExponentialBackoff` implementation wrapping the `exponential_backoff`
//! crate, and a `NoRetry` for call sites that must not retry (e.g.
//! argument-validation failures).

use crate::error::Retryable;
use std::fmt::Debug;
use std::time::Duration;

pub use exponential_backoff::Backoff;

/// Determines which errors to retry and how long to wait before doing so.
pub trait Retry<E>: Debug + Clone {
    /// Reset internal state. Called after every successful call so that a
    /// dynamic backoff returns to its minimum on the next failure streak.
    fn reset(&mut self);

    /// Returns `None` to abort and surface `error` to the caller, or
    /// `Some(duration)` to retry after `duration` elapses.
    fn next_backoff(&mut self, error: &E) -> Option<Duration>;
}

/// A `Retry` that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl<E> Retry<E> for NoRetry {
    fn reset(&mut self) {}

    fn next_backoff(&mut self, _error: &E) -> Option<Duration> {
        None
    }
}

/// Exponential backoff with jitter and a bounded maximum interval, but an
/// unbounded attempt count. Non-retryable errors such as `PreconditionFailed`
/// and validation failures terminate the retry loop immediately rather than
/// consuming a backoff step.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    attempt: u32,
    backoff: Backoff,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            backoff: Backoff::new(u32::MAX, Duration::from_millis(100), Some(Duration::from_secs(30))),
        }
    }

    pub fn with_min(mut self, min: Duration) -> Self {
        self.backoff.set_min(min);
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.backoff.set_max(Some(max));
        self
    }

    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.backoff.set_jitter(jitter);
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new().with_jitter(0.3)
    }
}

impl<E: Retryable> Retry<E> for ExponentialBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self, error: &E) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        self.attempt += 1;
        self.backoff.next(self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn non_retryable_errors_abort_immediately() {
        let mut retry = ExponentialBackoff::new();
        let err = Error::precondition_failed("x");
        assert_eq!(retry.next_backoff(&err), None);
    }

    #[test]
    fn retryable_errors_get_increasing_backoff() {
        let mut retry = ExponentialBackoff::new().with_jitter(0.0);
        let err = Error::transient(std::io::Error::new(std::io::ErrorKind::TimedOut, "x"));

        let first = retry.next_backoff(&err).unwrap();
        let second = retry.next_backoff(&err).unwrap();
        assert!(second >= first);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut retry = ExponentialBackoff::new().with_jitter(0.0);
        let err = Error::transient(std::io::Error::new(std::io::ErrorKind::TimedOut, "x"));

        let first = retry.next_backoff(&err).unwrap();
        retry.next_backoff(&err).unwrap();
        retry.reset();
        let after_reset = retry.next_backoff(&err).unwrap();
        assert_eq!(first, after_reset);
    }
}
