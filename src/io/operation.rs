//! Cancellable reactor operation base.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::cancel::{CancellationRegistration, CancellationToken};
use crate::error::Error;

use super::reactor::{CANCELLED_RESULT, Reactor};
use super::service::{IoInner, KEY_OP};

// Operation lifecycle. The cancellation callback and the submitting poll race
// through this word:
//
//   NotStarted ──────────────▶ Started ──────────▶ Completed
//       │       (submit done)     │   (completion
//       │                         │    dequeued)
//       │ (cancel before          │
//       ▼  submission finished)   ▼
//   CancellationRequested ──▶ Started + reactor cancel posted
const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLATION_REQUESTED: u8 = 2;
const COMPLETED: u8 = 3;

/// Shared control block of one reactor operation; the completion key is a
/// leaked reference to it.
pub struct OpHeader {
    state: AtomicU8,
    result: AtomicI32,
    bytes: AtomicUsize,
    waker: AtomicWaker,
}

impl OpHeader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(NOT_STARTED),
            result: AtomicI32::new(0),
            bytes: AtomicUsize::new(0),
            waker: AtomicWaker::new(),
        })
    }

    /// Called by the event loop when the operation's completion is dequeued.
    pub(super) fn complete(&self, result: i32, bytes: usize) {
        self.result.store(result, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        // Publishes the result fields to the awaiter's acquire load.
        self.state.store(COMPLETED, Ordering::Release);
        self.waker.wake();
    }

    fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }
}

/// What a submission closure reports back.
pub enum SubmitOutcome {
    /// The completion will arrive through the reactor queue.
    Pending,
    /// The operation completed synchronously; no completion will be posted.
    Completed { result: i32, bytes: usize },
}

/// An awaitable reactor operation with cooperative cancellation.
///
/// Created through [`IoService::submit`](super::IoService::submit). The
/// submission runs on first poll; the cancellation callback is registered
/// *before* the submission, so a cancellation request always either prevents
/// the start, or reaches the reactor as a `cancel` once the submission is in
/// flight. On completion the callback is torn down before the result is
/// returned, and a completion carrying the cancelled code resolves to
/// [`Error::Cancelled`].
#[must_use = "futures do nothing unless polled"]
pub struct IoOperation<R: Reactor, S> {
    service: Arc<IoInner<R>>,
    header: Arc<OpHeader>,
    submit: Option<S>,
    token: CancellationToken,
    registration: Option<CancellationRegistration>,
    submitted: bool,
}

impl<R, S> IoOperation<R, S>
where
    R: Reactor,
    S: FnOnce(&R, usize) -> Result<SubmitOutcome, Error>,
{
    pub(super) fn new(service: Arc<IoInner<R>>, submit: S, token: CancellationToken) -> Self {
        Self {
            service,
            header: OpHeader::new(),
            submit: Some(submit),
            token,
            registration: None,
            submitted: false,
        }
    }

    fn finish(&mut self) -> Result<usize, Error> {
        // Tear the cancellation callback down before handing control back;
        // a callback still running blocks here until it is done.
        self.registration = None;

        let result = self.header.result.load(Ordering::Relaxed);
        if result == CANCELLED_RESULT {
            Err(Error::Cancelled)
        } else if result < 0 {
            Err(Error::System(-result))
        } else {
            Ok(self.header.bytes.load(Ordering::Relaxed))
        }
    }
}

impl<R: Reactor, S> Unpin for IoOperation<R, S> {}

impl<R, S> Future for IoOperation<R, S>
where
    R: Reactor,
    S: FnOnce(&R, usize) -> Result<SubmitOutcome, Error>,
{
    type Output = Result<usize, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.submitted {
            this.header.waker.register(cx.waker());
            return if this.header.is_completed() {
                Poll::Ready(this.finish())
            } else {
                Poll::Pending
            };
        }

        // Fast-fail without touching the reactor.
        this.token.check()?;

        this.header.waker.register(cx.waker());

        // The completion key: one leaked header reference, reclaimed by the
        // event loop when it dequeues the completion.
        let key = Arc::into_raw(this.header.clone()) as usize | KEY_OP;

        // Install the cancellation hook before submitting, so the submission
        // path below can stay infallible with respect to cancellation.
        let callback = {
            let header = this.header.clone();
            let service = this.service.clone();
            move || {
                let mut state = header.state.load(Ordering::Acquire);
                loop {
                    match state {
                        NOT_STARTED => {
                            match header.state.compare_exchange(
                                NOT_STARTED,
                                CANCELLATION_REQUESTED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            ) {
                                // The submitting poll observes the marker
                                // after its submission and posts the cancel.
                                Ok(_) => return,
                                Err(current) => state = current,
                            }
                        }
                        STARTED => {
                            service.reactor.cancel(key & !0b11);
                            return;
                        }
                        // Completed (or a cancel already reached the
                        // reactor): nothing to do.
                        _ => return,
                    }
                }
            }
        };
        this.registration = Some(this.token.register(callback));

        let submit = this.submit.take().expect("operation submitted twice");
        match submit(&this.service.reactor, key) {
            Ok(SubmitOutcome::Pending) => {}
            Ok(SubmitOutcome::Completed { result, bytes }) => {
                // No completion will be posted; reclaim the key's reference
                // and resolve synchronously.
                drop(unsafe { Arc::from_raw((key & !0b11) as *const OpHeader) });
                this.header.complete(result, bytes);
                this.submitted = true;
                return Poll::Ready(this.finish());
            }
            Err(error) => {
                drop(unsafe { Arc::from_raw((key & !0b11) as *const OpHeader) });
                this.registration = None;
                return Poll::Ready(Err(error));
            }
        }
        this.submitted = true;

        // Submission done: either we are the first to move off NotStarted,
        // or a cancellation request slipped in while we were submitting and
        // left its marker for us to act on.
        match this.header.state.compare_exchange(
            NOT_STARTED,
            STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(CANCELLATION_REQUESTED) => {
                this.service.reactor.cancel(key & !0b11);
                // Late start so the callback path above stops retrying; a
                // failure means the completion already arrived.
                let _ = this.header.state.compare_exchange(
                    CANCELLATION_REQUESTED,
                    STARTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            Err(_) => {
                // Already completed; the waker has been or will be fired.
            }
        }

        if this.header.is_completed() {
            Poll::Ready(this.finish())
        } else {
            Poll::Pending
        }
    }
}
