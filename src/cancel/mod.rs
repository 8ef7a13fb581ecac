//! Cooperative cancellation.
//!
//! Three handle types share one refcounted state record:
//!
//! - [`CancellationSource`]: the write side; `request_cancellation()` latches
//!   the cancelled flag and synchronously runs every registered callback
//!   exactly once.
//! - [`CancellationToken`]: the read side; cheap to clone and to poll.
//! - [`CancellationRegistration`]: a scoped callback installation, released
//!   on every exit path.
//!
//! Callbacks must not block: they run inline on the requesting thread and are
//! a noexcept boundary (a panic aborts the process). The usual pattern is to
//! signal another primitive:
//!
//!```
//! use subito::cancel::CancellationSource;
//! use subito::sync::AsyncManualResetEvent;
//! use std::sync::Arc;
//!
//! let source = CancellationSource::new();
//! let done = Arc::new(AsyncManualResetEvent::new(false));
//!
//! let registration = {
//!     let done = done.clone();
//!     source.token().register(move || done.set())
//! };
//!
//! source.request_cancellation();
//! assert!(done.is_set());
//! drop(registration);
//!```

mod state;

use std::sync::Arc;

use crate::error::Error;
use state::{CallbackRecord, CancellationState};

/// Owns the right to request cancellation. Clones share it; dropping the last
/// clone makes the associated tokens permanently non-cancellable (unless a
/// request already happened).
pub struct CancellationSource {
    state: Arc<CancellationState>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            state: CancellationState::new(),
        }
    }

    /// A read-only handle observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(self.state.clone()),
        }
    }

    /// Latches the cancelled flag and synchronously invokes every registered
    /// callback exactly once. Thread-safe and idempotent; concurrent callers
    /// beyond the first return immediately, possibly before the callbacks
    /// have finished.
    pub fn request_cancellation(&self) {
        self.state.request_cancellation();
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.state.is_cancellation_requested()
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.state.can_be_cancelled()
    }
}

impl Clone for CancellationSource {
    fn clone(&self) -> Self {
        self.state.add_source_ref();
        Self {
            state: self.state.clone(),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        self.state.release_source_ref();
    }
}

/// Read-only cancellation handle.
#[derive(Clone, Default)]
pub struct CancellationToken {
    /// None for the detached token, which can never be cancelled.
    state: Option<Arc<CancellationState>>,
}

impl CancellationToken {
    /// A token with no associated source; never reports cancellation.
    pub fn none() -> Self {
        Self { state: None }
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(CancellationState::is_cancellation_requested)
    }

    /// True while a request is still possible (a source is alive) or has
    /// already happened.
    pub fn can_be_cancelled(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(CancellationState::can_be_cancelled)
    }

    /// Fails with [`Error::Cancelled`] if cancellation has been requested.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancellation_requested() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Installs `callback` to run when cancellation is requested.
    ///
    /// If cancellation was already requested the callback runs immediately on
    /// the calling thread. If the token can never be cancelled the callback
    /// is dropped unrun. Otherwise the callback runs exactly once, on the
    /// thread that calls `request_cancellation`.
    ///
    /// Dropping the returned registration uninstalls the callback; if the
    /// drop races with a request that already claimed the callback, the drop
    /// blocks until the callback has finished running (unless it would
    /// deadlock on the notifying thread itself).
    pub fn register<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &self.state else {
            return CancellationRegistration { inner: None };
        };
        if !state.can_be_cancelled() {
            return CancellationRegistration { inner: None };
        }

        let record = CallbackRecord::new(Box::new(callback));
        if state.try_register(&record) {
            CancellationRegistration {
                inner: Some((state.clone(), record)),
            }
        } else {
            // Cancellation won the race; run the callback here, exactly once.
            // SAFETY: try_register returning false leaves us the exclusive
            // claim on the record.
            if let Some(callback) = unsafe { record.take_callback() } {
                callback();
            }
            CancellationRegistration { inner: None }
        }
    }
}

/// Scoped installation of a cancellation callback.
///
/// Dropping it guarantees the callback is either uninstalled unrun or has
/// finished running.
#[must_use = "dropping the registration immediately uninstalls the callback"]
pub struct CancellationRegistration {
    inner: Option<(Arc<CancellationState>, Arc<CallbackRecord>)>,
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let Some((state, record)) = self.inner.take() {
            state.deregister(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Requesting cancellation flips the flag on every token
    #[test]
    fn test_request_visible_on_tokens() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancellation_requested());
        assert!(token.check().is_ok());

        source.request_cancellation();
        assert!(token.is_cancellation_requested());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    /// Dropping the last source makes tokens non-cancellable
    #[test]
    fn test_source_drop_disarms() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(token.can_be_cancelled());

        let clone = source.clone();
        drop(source);
        assert!(token.can_be_cancelled());
        drop(clone);
        assert!(!token.can_be_cancelled());
    }

    /// A request that already happened keeps tokens cancellable forever
    #[test]
    fn test_requested_stays_cancellable() {
        let source = CancellationSource::new();
        let token = source.token();
        source.request_cancellation();
        drop(source);
        assert!(token.can_be_cancelled());
        assert!(token.is_cancellation_requested());
    }

    /// Each registered callback runs exactly once despite repeated requests
    #[test]
    fn test_callbacks_run_once() {
        let source = CancellationSource::new();
        let token = source.token();
        let runs = Arc::new(AtomicUsize::new(0));

        let registrations: Vec<_> = (0..5)
            .map(|_| {
                let runs = runs.clone();
                token.register(move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        source.request_cancellation();
        source.request_cancellation();
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        drop(registrations);
    }

    /// Registering on an already cancelled token runs the callback inline
    #[test]
    fn test_late_registration_runs_inline() {
        let source = CancellationSource::new();
        source.request_cancellation();

        let ran = Arc::new(AtomicUsize::new(0));
        let registration = {
            let ran = ran.clone();
            source.token().register(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        drop(registration);
    }

    /// A deregistered callback never runs
    #[test]
    fn test_deregistered_callback_skipped() {
        let source = CancellationSource::new();
        let token = source.token();
        let runs = Arc::new(AtomicUsize::new(0));

        let registration = {
            let runs = runs.clone();
            token.register(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        drop(registration);

        source.request_cancellation();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    /// A detached token is inert
    #[test]
    fn test_none_token() {
        let token = CancellationToken::none();
        assert!(!token.can_be_cancelled());
        assert!(token.check().is_ok());
        let registration = token.register(|| panic!("must not run"));
        drop(registration);
    }

    /// Registration slots are reusable after deregistration
    #[test]
    fn test_slot_reuse() {
        let source = CancellationSource::new();
        let token = source.token();
        let runs = Arc::new(AtomicUsize::new(0));

        // Churn through far more registrations than one chunk holds.
        for _ in 0..200 {
            let runs = runs.clone();
            let registration = token.register(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            drop(registration);
        }

        let runs_final = runs.clone();
        let keep = token.register(move || {
            runs_final.fetch_add(1, Ordering::SeqCst);
        });
        source.request_cancellation();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        drop(keep);
    }

    /// Concurrent register/deregister churn races safely with a request
    #[test]
    fn test_concurrent_churn() {
        let source = CancellationSource::new();
        let observed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let token = source.token();
                let observed = observed.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let observed = observed.clone();
                        let registration = token.register(move || {
                            observed.fetch_add(1, Ordering::SeqCst);
                        });
                        std::hint::spin_loop();
                        drop(registration);
                        if token.is_cancellation_requested() {
                            break;
                        }
                    }
                })
            })
            .collect();

        let canceller = {
            let source = source.clone();
            thread::spawn(move || {
                std::thread::yield_now();
                source.request_cancellation();
            })
        };

        for w in workers {
            w.join().unwrap();
        }
        canceller.join().unwrap();
        // The test terminating at all is the main assertion; the callbacks
        // that did fire ran exactly once each by construction.
    }
}
