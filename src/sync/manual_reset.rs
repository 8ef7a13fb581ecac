//! Manually reset async event.

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crate::waiter::{self, Waiter};

type Node = Waiter<()>;

/// Sentinel head value meaning "event is set". Real nodes are heap
/// allocations with alignment > 1, so the value can never collide.
#[inline]
fn set_state() -> *mut Node {
    ptr::without_provenance_mut(1)
}

/// An async event that stays signalled until explicitly [`reset`](AsyncManualResetEvent::reset).
///
/// While set, [`wait`](AsyncManualResetEvent::wait) completes synchronously.
/// While unset, waiters queue on a lock-free stack; `set()` detaches the whole
/// stack with one exchange and resumes every waiter.
///
/// # Example
///
///```
/// use subito::sync::AsyncManualResetEvent;
/// use subito::combinator::sync_wait;
///
/// let event = AsyncManualResetEvent::new(false);
/// event.set();
/// sync_wait(event.wait()); // completes immediately
///```
pub struct AsyncManualResetEvent {
    /// Either the set sentinel, null (unset, no waiters), or the head of the
    /// waiter stack.
    state: AtomicPtr<Node>,
}

impl AsyncManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        let initial = if initially_set {
            set_state()
        } else {
            ptr::null_mut()
        };
        Self {
            state: AtomicPtr::new(initial),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == set_state()
    }

    /// Signals the event, resuming every queued waiter.
    ///
    /// The exchange needs release semantics so prior writes are visible to
    /// resumed waiters, and acquire semantics so we observe the queued nodes.
    pub fn set(&self) {
        let old = self.state.swap(set_state(), Ordering::AcqRel);
        if old != set_state() && !old.is_null() {
            for node in unsafe { waiter::drain(old) } {
                // Dropped waiters are simply skipped; a manual-reset wake
                // carries no token that could be lost.
                let _ = node.fire();
            }
        }
    }

    /// Returns the event to the unset state. No-op if not set.
    pub fn reset(&self) {
        let _ = self.state.compare_exchange(
            set_state(),
            ptr::null_mut(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    /// Waits until the event is set. Completes synchronously if it already is.
    pub fn wait(&self) -> ManualResetWaitFuture<'_> {
        ManualResetWaitFuture {
            event: self,
            node: None,
        }
    }
}

impl Default for AsyncManualResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Drop for AsyncManualResetEvent {
    fn drop(&mut self) {
        let head = *self.state.get_mut();
        if head != set_state() && !head.is_null() {
            // Release the leaked node references; the owning futures were
            // dropped or will observe abandonment.
            drop(unsafe { waiter::drain(head) });
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct ManualResetWaitFuture<'a> {
    event: &'a AsyncManualResetEvent,
    node: Option<Arc<Node>>,
}

/// Safe: the struct is not self-referential.
impl Unpin for ManualResetWaitFuture<'_> {}

impl Future for ManualResetWaitFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(node) = &self.node {
            node.register(cx.waker());
            return if node.is_fired() {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }

        let node = Waiter::new(());
        node.register(cx.waker());

        let mut head = self.event.state.load(Ordering::Acquire);
        loop {
            if head == set_state() {
                // Already set, no need to suspend.
                return Poll::Ready(());
            }

            // Push ourselves on top of the waiter stack.
            unsafe { node.set_next(head) };
            let ptr = Waiter::into_raw(node.clone());
            match self.event.state.compare_exchange_weak(
                head,
                ptr,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.node = Some(node);
                    return Poll::Pending;
                }
                Err(current) => {
                    // Undo the leak and retry with the fresh head.
                    unsafe { drop(Waiter::from_raw(ptr)) };
                    head = current;
                }
            }
        }
    }
}

impl Drop for ManualResetWaitFuture<'_> {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            let _ = node.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use std::thread;
    use std::time::Duration;

    /// An initially set event never suspends its waiters
    #[test]
    fn test_initially_set() {
        let event = AsyncManualResetEvent::new(true);
        assert!(event.is_set());
        sync_wait(event.wait());
    }

    /// reset() returns the event to the unset state
    #[test]
    fn test_reset() {
        let event = AsyncManualResetEvent::new(true);
        event.reset();
        assert!(!event.is_set());
        // Resetting an unset event is a no-op.
        event.reset();
        assert!(!event.is_set());
    }

    /// set() wakes all queued waiters, across threads
    #[test]
    fn test_broadcast() {
        let event = Arc::new(AsyncManualResetEvent::new(false));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || sync_wait(event.wait()))
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        event.set();

        for w in waiters {
            w.join().unwrap();
        }
    }

    /// A waiter dropped before set() does not disturb the others
    #[test]
    fn test_dropped_waiter() {
        let event = AsyncManualResetEvent::new(false);

        let mut dropped = Box::pin(event.wait());
        let noop = futures::task::noop_waker();
        let mut cx = Context::from_waker(&noop);
        assert!(dropped.as_mut().poll(&mut cx).is_pending());
        drop(dropped);

        event.set();
        sync_wait(event.wait());
    }
}
