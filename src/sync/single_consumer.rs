//! Single-consumer event variants.
//!
//! Cheaper cousins of the multi-waiter events for the common case where only
//! one computation ever waits: the whole waiter list collapses into a single
//! [`AtomicWaker`] plus a state byte.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

const NOT_SET: u8 = 0;
const SET: u8 = 1;

/// One-shot manual-reset event for a single waiter.
///
/// Unlike [`AsyncManualResetEvent`](crate::sync::AsyncManualResetEvent) at
/// most one computation may wait at a time; a second concurrent waiter would
/// displace the first one's waker.
pub struct SingleConsumerEvent {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl SingleConsumerEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: AtomicU8::new(if initially_set { SET } else { NOT_SET }),
            waker: AtomicWaker::new(),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == SET
    }

    pub fn set(&self) {
        self.state.store(SET, Ordering::Release);
        self.waker.wake();
    }

    pub fn reset(&self) {
        self.state.store(NOT_SET, Ordering::Relaxed);
    }

    pub fn wait(&self) -> SingleConsumerWait<'_> {
        SingleConsumerWait { event: self }
    }
}

impl Default for SingleConsumerEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct SingleConsumerWait<'a> {
    event: &'a SingleConsumerEvent,
}

impl Unpin for SingleConsumerWait<'_> {}

impl Future for SingleConsumerWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Register before checking so a concurrent set() either sees the
        // fresh waker or is seen by the check.
        self.event.waker.register(cx.waker());
        if self.event.is_set() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// One-shot auto-reset event for a single waiter: each `set()` releases at
/// most one wait, and waiting consumes the set.
pub struct SingleConsumerAutoResetEvent {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl SingleConsumerAutoResetEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: AtomicU8::new(if initially_set { SET } else { NOT_SET }),
            waker: AtomicWaker::new(),
        }
    }

    pub fn set(&self) {
        // A second set before the consumer runs is absorbed; the state is a
        // flag, not a counter.
        self.state.store(SET, Ordering::Release);
        self.waker.wake();
    }

    pub fn wait(&self) -> SingleConsumerAutoResetWait<'_> {
        SingleConsumerAutoResetWait { event: self }
    }
}

impl Default for SingleConsumerAutoResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct SingleConsumerAutoResetWait<'a> {
    event: &'a SingleConsumerAutoResetEvent,
}

impl Unpin for SingleConsumerAutoResetWait<'_> {}

impl Future for SingleConsumerAutoResetWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.event.waker.register(cx.waker());
        // Consume the set atomically; only one consumer exists but set() may
        // run concurrently.
        if self
            .event
            .state
            .compare_exchange(SET, NOT_SET, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use futures::task::noop_waker;
    use std::sync::Arc;
    use std::thread;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    /// Manual variant stays set across waits until reset
    #[test]
    fn test_manual_stays_set() {
        let event = SingleConsumerEvent::new(false);
        event.set();
        sync_wait(event.wait());
        sync_wait(event.wait());
        event.reset();
        assert!(poll_once(&mut event.wait()).is_pending());
    }

    /// Auto variant consumes the set on wait
    #[test]
    fn test_auto_consumes() {
        let event = SingleConsumerAutoResetEvent::new(true);
        sync_wait(event.wait());
        assert!(poll_once(&mut event.wait()).is_pending());
    }

    /// Cross-thread wake for the auto variant
    #[test]
    fn test_auto_cross_thread() {
        let event = Arc::new(SingleConsumerAutoResetEvent::new(false));
        let setter = {
            let event = event.clone();
            thread::spawn(move || event.set())
        };
        sync_wait(event.wait());
        setter.join().unwrap();
    }
}
