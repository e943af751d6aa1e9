use std::fmt;

/// A type-erased source error, boxed so that `Error` stays `Send + Sync + 'static`
/// regardless of which SDK produced the underlying failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error taxonomy shared by every component of the core.
///
/// `PreconditionFailed` is never retried automatically, `Transient` is
/// retried by the policy in [`crate::retry`], and `Fatal`/`ExpiredIterator`
/// always propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A conditional KV write lost an optimistic-concurrency race.
    #[error("precondition failed for key {key}")]
    PreconditionFailed {
        key: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The requested item does not exist. Callers that have a domain-empty
    /// default (e.g. an empty tag set) should map this away rather than
    /// propagate it.
    #[error("not found: {0}")]
    NotFound(String),

    /// A transient I/O or throughput error, eligible for retry under the
    /// policy in [`crate::retry`].
    #[error("transient error")]
    Transient {
        #[source]
        source: BoxError,
        backtrace: CapturedBacktrace,
    },

    /// An error the retry policy must not retry: bad arguments, auth
    /// failures, malformed responses.
    #[error("fatal error")]
    Fatal {
        #[source]
        source: BoxError,
        backtrace: CapturedBacktrace,
    },

    /// The shard iterator backing a `get_records` call is no longer valid.
    /// The caller must reacquire a fresh iterator and must not advance its
    /// checkpoint on account of this response.
    #[error("shard iterator expired")]
    ExpiredIterator {
        #[source]
        source: BoxError,
    },

    /// A protocol invariant was violated by a remote response (e.g. a shard
    /// iterator response missing a field the contract guarantees).
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl Error {
    pub fn transient(source: impl Into<BoxError>) -> Self {
        Error::Transient {
            source: source.into(),
            backtrace: CapturedBacktrace::capture(),
        }
    }

    pub fn fatal(source: impl Into<BoxError>) -> Self {
        Error::Fatal {
            source: source.into(),
            backtrace: CapturedBacktrace::capture(),
        }
    }

    pub fn expired_iterator(source: impl Into<BoxError>) -> Self {
        Error::ExpiredIterator { source: source.into() }
    }

    pub fn precondition_failed(key: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            key: key.into(),
            source: None,
        }
    }
}

/// Classifies whether an [`Error`] should be retried by the bounded-jitter
/// backoff policy in [`crate::retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

/// A `std::backtrace::Backtrace` captured at the error's construction site,
/// so that diagnostics survive being held across an `.await` suspension
/// point.
pub struct CapturedBacktrace(std::backtrace::Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(std::backtrace::Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failure_is_not_retryable() {
        let err = Error::precondition_failed("shardId-000000000000");
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_is_retryable() {
        let err = Error::transient(std::io::Error::new(std::io::ErrorKind::TimedOut, "boom"));
        assert!(err.is_retryable());
    }

    #[test]
    fn fatal_is_not_retryable() {
        let err = Error::fatal(std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad arg"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn expired_iterator_is_not_retryable() {
        let err = Error::expired_iterator(std::io::Error::new(std::io::ErrorKind::Other, "expired"));
        assert!(!err.is_retryable());
    }
}
