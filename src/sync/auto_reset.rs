//! Auto-reset async event.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;

use crate::waiter::{self, Waiter};

type Node = Waiter<()>;

const SET_INC: u64 = 1;
const WAITER_INC: u64 = 1 << 32;

#[inline]
const fn set_count(state: u64) -> u32 {
    state as u32
}

#[inline]
const fn waiter_count(state: u64) -> u32 {
    (state >> 32) as u32
}

#[inline]
const fn resumable(state: u64) -> u32 {
    let sets = set_count(state);
    let waiters = waiter_count(state);
    if sets < waiters { sets } else { waiters }
}

/// An async event that releases exactly one waiter per `set()`.
///
/// ## State
///
/// One 64-bit word packs `(waiter_count << 32) | set_count`. The number of
/// waiters that may resume is always `min(set_count, waiter_count)`. Whichever
/// call (`set()` or a new waiter) transitions that minimum from zero takes the
/// resumer role: it exclusively drains waiters until the minimum returns to
/// zero, then publishes the updated counts.
///
/// ## Fairness
///
/// Waiters push onto a lock-free stack (`new_waiters`); the resumer reverses
/// that stack into a private FIFO list before dequeuing, so waiters queued
/// before a given batch of `set()` calls resume in FIFO order.
///
/// A waiter that was selected for resumption but dropped before observing it
/// re-posts its set token, preserving `resumed == min(sets, waiters)` for the
/// waiters still alive.
pub struct AsyncAutoResetEvent {
    /// Packed `(waiter_count, set_count)`.
    state: CachePadded<AtomicU64>,
    /// Lock-free stack of newly queued waiters.
    new_waiters: CachePadded<AtomicPtr<Node>>,
    /// FIFO remainder of a previous drain. Only the resumer touches this.
    waiters: UnsafeCell<*const Node>,
}

// `waiters` is guarded by the resumer role: only the thread that moved
// `resumable()` off zero dereferences it, and it hands the role off through
// the acq-rel counter update.
unsafe impl Send for AsyncAutoResetEvent {}
unsafe impl Sync for AsyncAutoResetEvent {}

impl AsyncAutoResetEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: CachePadded::new(AtomicU64::new(if initially_set { SET_INC } else { 0 })),
            new_waiters: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            waiters: UnsafeCell::new(ptr::null()),
        }
    }

    /// Signals the event, releasing one queued or future waiter.
    ///
    /// If the event is already set (more sets than waiters) this is a no-op:
    /// the set count never exceeds `waiter_count + 1`.
    pub fn set(&self) {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if set_count(state) > waiter_count(state) {
                // Already set.
                return;
            }
            match self.state.compare_exchange_weak(
                state,
                state + SET_INC,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => state = current,
            }
        }

        // Did we transition from waiters-but-no-sets to a non-zero resumable
        // count? Then we hold the resumer role.
        if state != 0 && set_count(state) == 0 {
            self.resume_waiters(state + SET_INC);
        }
    }

    /// Clears one pending set, if any.
    pub fn reset(&self) {
        let mut state = self.state.load(Ordering::Relaxed);
        while set_count(state) > waiter_count(state) {
            match self.state.compare_exchange_weak(
                state,
                state - SET_INC,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }
    }

    /// Waits for the event to be set, consuming the set.
    pub fn wait(&self) -> AutoResetWaitFuture<'_> {
        AutoResetWaitFuture {
            event: self,
            node: None,
        }
    }

    /// Drains `min(set_count, waiter_count)` waiters and fires them in FIFO
    /// order. Caller must hold the resumer role.
    fn resume_waiters(&self, initial_state: u64) {
        let mut resume_head: *const Node = ptr::null();
        let mut resume_tail: *const Node = ptr::null();

        let mut count = resumable(initial_state);
        debug_assert!(count > 0);

        while count > 0 {
            for _ in 0..count {
                // SAFETY: resumer role grants exclusive access to `waiters`.
                let mut front = unsafe { *self.waiters.get() };
                if front.is_null() {
                    // Out of privately held waiters; take the whole push
                    // stack and reverse it so dequeue order is FIFO. Waiters
                    // enqueue before incrementing the waiter count, so the
                    // stack cannot be empty here.
                    let fresh = self.new_waiters.swap(ptr::null_mut(), Ordering::Acquire);
                    debug_assert!(!fresh.is_null());
                    front = unsafe { waiter::reverse(fresh) };
                }

                unsafe {
                    *self.waiters.get() = (*front).next();
                    (*front).set_next(ptr::null());
                    if resume_head.is_null() {
                        resume_head = front;
                    } else {
                        (*resume_tail).set_next(front);
                    }
                }
                resume_tail = front;
            }

            // Release the role: decrement both counts by the number of
            // waiters we dequeued, then re-check in case sets or waiters
            // arrived concurrently.
            let delta = u64::from(count) | (u64::from(count) << 32);
            let new_state = self.state.fetch_sub(delta, Ordering::AcqRel) - delta;
            count = resumable(new_state);
        }

        let mut lost = 0u32;
        for node in unsafe { waiter::drain(resume_head) } {
            if !node.fire() {
                // Waiter was dropped after being counted; its set token must
                // not vanish.
                lost += 1;
            }
        }
        for _ in 0..lost {
            self.set();
        }
    }
}

impl Default for AsyncAutoResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Drop for AsyncAutoResetEvent {
    fn drop(&mut self) {
        let fresh = *self.new_waiters.get_mut();
        if !fresh.is_null() {
            drop(unsafe { waiter::drain(fresh) });
        }
        let held = *self.waiters.get_mut();
        if !held.is_null() {
            drop(unsafe { waiter::drain(held) });
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct AutoResetWaitFuture<'a> {
    event: &'a AsyncAutoResetEvent,
    node: Option<Arc<Node>>,
}

/// Safe: the struct is not self-referential.
impl Unpin for AutoResetWaitFuture<'_> {}

impl Future for AutoResetWaitFuture<'_> {
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

        // Fast path: consume an unclaimed set without suspending.
        let mut state = self.event.state.load(Ordering::Relaxed);
        while set_count(state) > waiter_count(state) {
            match self.event.state.compare_exchange_weak(
                state,
                state - SET_INC,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Poll::Ready(()),
                Err(current) => state = current,
            }
        }

        let node = Waiter::new(());
        node.register(cx.waker());

        // Queue first, then publish the waiter count; the resumer relies on
        // the stack never being behind the count.
        let ptr = Waiter::into_raw(node.clone());
        let mut head = self.event.new_waiters.load(Ordering::Relaxed);
        loop {
            unsafe { node.set_next(head) };
            match self.event.new_waiters.compare_exchange_weak(
                head,
                ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        let old = self.event.state.fetch_add(WAITER_INC, Ordering::AcqRel);
        if old != 0 && waiter_count(old) == 0 {
            // We moved the resumable count off zero: resume on behalf of the
            // pending sets, possibly including ourselves.
            self.event.resume_waiters(old + WAITER_INC);
        }

        self.node = Some(node.clone());
        if node.is_fired() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for AutoResetWaitFuture<'_> {
    fn drop(&mut self) {
        if let Some(node) = &self.node
            && !node.abandon()
        {
            // We were granted a set token between the last poll and the drop;
            // hand it to the next waiter.
            self.event.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use futures::task::noop_waker;
    use std::thread;
    use std::time::Duration;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    /// A set before any waiter completes the next wait synchronously
    #[test]
    fn test_set_then_wait() {
        let event = AsyncAutoResetEvent::new(false);
        event.set();
        sync_wait(event.wait());
    }

    /// The set count saturates: two sets with no waiters release only one wait
    #[test]
    fn test_set_saturates() {
        let event = AsyncAutoResetEvent::new(false);
        event.set();
        event.set();
        sync_wait(event.wait());
        let mut second = event.wait();
        assert!(poll_once(&mut second).is_pending());
    }

    /// k sets and m waiters resume exactly min(k, m) waiters
    #[test]
    fn test_batched_sets() {
        let event = AsyncAutoResetEvent::new(false);

        let mut waiters: Vec<_> = (0..5).map(|_| event.wait()).collect();
        for w in &mut waiters {
            assert!(poll_once(w).is_pending());
        }

        // Two then three sets, before any waiter is re-polled.
        event.set();
        event.set();
        event.set();
        event.set();
        event.set();

        for mut w in waiters {
            assert!(poll_once(&mut w).is_ready());
        }

        // A sixth wait must suspend: every set was consumed.
        let mut sixth = event.wait();
        assert!(poll_once(&mut sixth).is_pending());
    }

    /// FIFO order among waiters queued before the sets
    #[test]
    fn test_fifo() {
        let event = AsyncAutoResetEvent::new(false);

        let mut first = event.wait();
        let mut second = event.wait();
        assert!(poll_once(&mut first).is_pending());
        assert!(poll_once(&mut second).is_pending());

        event.set();
        assert!(poll_once(&mut first).is_ready());
        assert!(poll_once(&mut second).is_pending());

        event.set();
        assert!(poll_once(&mut second).is_ready());
    }

    /// A dropped waiter hands its token to the next one
    #[test]
    fn test_dropped_waiter_token_passes() {
        let event = AsyncAutoResetEvent::new(false);

        let mut doomed = event.wait();
        let mut survivor = event.wait();
        assert!(poll_once(&mut doomed).is_pending());
        assert!(poll_once(&mut survivor).is_pending());

        event.set();
        // `doomed` was selected; dropping it re-posts the set.
        drop(doomed);
        assert!(poll_once(&mut survivor).is_ready());
    }

    /// Cross-thread ping-pong does not lose tokens
    #[test]
    fn test_cross_thread() {
        let event = Arc::new(AsyncAutoResetEvent::new(false));
        let rounds = 100;

        let setter = {
            let event = event.clone();
            thread::spawn(move || {
                for _ in 0..rounds {
                    event.set();
                    thread::sleep(Duration::from_micros(50));
                }
            })
        };

        for _ in 0..rounds {
            sync_wait(event.wait());
        }
        setter.join().unwrap();
    }
}
