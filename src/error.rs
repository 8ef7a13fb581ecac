//! Crate-wide error type.
//!
//! All fallible awaits resolve to `Result<T, Error>`. The variants mirror the
//! ways a suspended computation can fail to deliver a value: the producer was
//! dropped, the operation was cancelled, the platform reported an error code,
//! or the body panicked and the payload was captured at the executor boundary.

use std::any::Any;
use std::fmt;
use std::panic::resume_unwind;

#[derive(thiserror::Error)]
pub enum Error {
    /// The awaited computation was dropped before it produced a value.
    #[error("awaited a computation that was dropped before completing")]
    BrokenPromise,

    /// The operation was cancelled through a [`CancellationToken`](crate::cancel::CancellationToken).
    #[error("operation was cancelled")]
    Cancelled,

    /// A platform error code surfaced by the reactor.
    #[error("system error (code {0})")]
    System(i32),

    /// A panic captured from a spawned body. Re-raise it with
    /// [`Error::into_panic`] + [`resume_unwind`], or via [`Error::unwrap_panic`].
    #[error("task panicked")]
    Panic(Box<dyn Any + Send + 'static>),
}

impl Error {
    #[inline]
    pub fn is_broken_promise(&self) -> bool {
        matches!(self, Error::BrokenPromise)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panic(..))
    }

    /// Consumes the error, returning the captured panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error is not [`Error::Panic`].
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            Error::Panic(payload) => payload,
            other => panic!("into_panic() on non-panic error: {other}"),
        }
    }

    /// Resumes unwinding if this is a captured panic, otherwise returns self.
    pub fn unwrap_panic(self) -> Self {
        match self {
            Error::Panic(payload) => resume_unwind(payload),
            other => other,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BrokenPromise => f.write_str("BrokenPromise"),
            Error::Cancelled => f.write_str("Cancelled"),
            Error::System(code) => f.debug_tuple("System").field(code).finish(),
            Error::Panic(..) => f.write_str("Panic(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Display strings are stable enough to appear in logs
    #[test]
    fn test_display() {
        assert_eq!(
            Error::Cancelled.to_string(),
            "operation was cancelled"
        );
        assert_eq!(Error::System(11).to_string(), "system error (code 11)");
    }

    /// Panic payloads survive the round-trip through the error type
    #[test]
    fn test_panic_payload() {
        let err = Error::Panic(Box::new("boom"));
        assert!(err.is_panic());
        let payload = err.into_panic();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
    }
}
