//! Single-writer published-cursor barrier.

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;

use crate::waiter::{self, Waiter};

use super::Sequence;

/// Per-waiter payload: the sequence it waits for, and the cursor value the
/// resumer observed when releasing it.
pub(super) struct SeqWait<S: Sequence> {
    pub(super) target: S,
    pub(super) last_known: S::Atomic,
}

pub(super) type SeqNode<S> = Waiter<SeqWait<S>>;

/// Links `[first, last]` (an owned chain) on top of a lock-free stack.
pub(super) unsafe fn push_chain<S: Sequence>(
    head: &AtomicPtr<SeqNode<S>>,
    first: *const SeqNode<S>,
    last: *const SeqNode<S>,
    success: Ordering,
) {
    let mut current = head.load(Ordering::Relaxed);
    loop {
        unsafe { (*last).set_next(current) };
        match head.compare_exchange_weak(
            current,
            first as *mut SeqNode<S>,
            success,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// A monotonically advancing cursor that one producer publishes and any
/// number of consumers await.
///
/// `last_published()` returning `n` guarantees every sequence number up to
/// and including `n` is published, so readers may touch the corresponding
/// ring slots without further synchronization.
///
/// # Example
///
///```
/// use subito::seq::SequenceBarrier;
/// use subito::combinator::sync_wait;
///
/// let barrier = SequenceBarrier::<u64>::new();
/// barrier.publish(0);
/// barrier.publish(1);
/// assert_eq!(sync_wait(barrier.wait_until_published(1)), 1);
///```
pub struct SequenceBarrier<S: Sequence = usize> {
    /// Written by the producer only.
    last_published: CachePadded<S::Atomic>,
    /// Written by producer and consumers.
    waiters: CachePadded<AtomicPtr<SeqNode<S>>>,
}

impl<S: Sequence> SequenceBarrier<S> {
    pub fn new() -> Self {
        Self::with_initial(S::INITIAL)
    }

    /// Starts the cursor at `initial`; the first published number is its
    /// successor.
    pub fn with_initial(initial: S) -> Self {
        Self {
            last_published: CachePadded::new(S::new_atomic(initial)),
            waiters: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// The most recently published sequence number. Monotonic.
    #[inline]
    pub fn last_published(&self) -> S {
        S::load(&self.last_published, Ordering::Acquire)
    }

    /// Publishes every sequence number up to and including `sequence`,
    /// resuming the waiters it satisfies.
    ///
    /// Must not precede the current cursor (single writer, monotonic).
    pub fn publish(&self, sequence: S) {
        // Seq-cst store pairs with the seq-cst re-check in the waiter path:
        // either the waiter sees this publish after enqueueing, or we see its
        // node below.
        S::store(&self.last_published, sequence, Ordering::SeqCst);

        if self.waiters.load(Ordering::SeqCst).is_null() {
            return;
        }
        let detached = self.waiters.swap(ptr::null_mut(), Ordering::Acquire);
        if detached.is_null() {
            // A concurrent waiter re-check acquired the list first.
            return;
        }
        self.split_and_resume(detached, sequence);
    }

    /// Waits until `target` has been published.
    ///
    /// Resolves to the cursor value observed on release, which never precedes
    /// `target` but may be later.
    pub fn wait_until_published(&self, target: S) -> BarrierWaitFuture<'_, S> {
        BarrierWaitFuture {
            barrier: self,
            target,
            node: None,
        }
    }

    /// Splits a detached waiter chain by `published`: satisfied waiters are
    /// fired, the rest are requeued. Requeueing re-checks the cursor in a
    /// loop so a publish racing with the requeue cannot strand a waiter.
    fn split_and_resume(&self, detached: *const SeqNode<S>, published: S) {
        let mut resume_head: *const SeqNode<S> = ptr::null();
        let mut pending = detached;
        let mut last_known = published;

        loop {
            // Partition the owned chain, tracking the earliest target among
            // the not-yet-satisfied waiters.
            let mut requeue_head: *const SeqNode<S> = ptr::null();
            let mut requeue_tail: *const SeqNode<S> = ptr::null();
            let mut min_diff = i64::MAX;

            while !pending.is_null() {
                let node = pending;
                unsafe {
                    pending = (*node).next();
                    let diff = (*node).payload.target.difference(last_known);
                    if diff > 0 {
                        (*node).set_next(requeue_head);
                        if requeue_head.is_null() {
                            requeue_tail = node;
                        }
                        requeue_head = node;
                        min_diff = min_diff.min(diff);
                    } else {
                        (*node).set_next(resume_head);
                        resume_head = node;
                    }
                }
            }

            if requeue_head.is_null() {
                break;
            }

            unsafe { push_chain(&self.waiters, requeue_head, requeue_tail, Ordering::SeqCst) };

            // A publish may have raced with the requeue. If it satisfied the
            // earliest requeued target, reclaim the list and go around;
            // otherwise the producer saw our requeue and will handle it.
            let earliest_target = last_known.add(min_diff as usize);
            last_known = S::load(&self.last_published, Ordering::SeqCst);
            if earliest_target.difference(last_known) > 0 {
                break;
            }

            let reclaimed = self.waiters.swap(ptr::null_mut(), Ordering::Acquire);
            if reclaimed.is_null() {
                // Another thread already took responsibility.
                break;
            }
            pending = reclaimed;
        }

        // Fire the satisfied waiters; each observes a cursor value that does
        // not precede its target.
        for node in unsafe { waiter::drain(resume_head) } {
            S::store(&node.payload.last_known, last_known, Ordering::Relaxed);
            let _ = node.fire();
        }
    }
}

impl<S: Sequence> Default for SequenceBarrier<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Sequence> Drop for SequenceBarrier<S> {
    fn drop(&mut self) {
        let head = *self.waiters.get_mut();
        if !head.is_null() {
            drop(unsafe { waiter::drain(head) });
        }
    }
}

unsafe impl<S: Sequence> Send for SequenceBarrier<S> {}
unsafe impl<S: Sequence> Sync for SequenceBarrier<S> {}

/// Future returned by [`SequenceBarrier::wait_until_published`].
#[must_use = "futures do nothing unless polled"]
pub struct BarrierWaitFuture<'a, S: Sequence> {
    barrier: &'a SequenceBarrier<S>,
    target: S,
    node: Option<Arc<SeqNode<S>>>,
}

impl<S: Sequence> Unpin for BarrierWaitFuture<'_, S> {}

impl<S: Sequence> Future for BarrierWaitFuture<'_, S> {
    type Output = S;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(node) = &self.node {
            node.register(cx.waker());
            return if node.is_fired() {
                Poll::Ready(S::load(&node.payload.last_known, Ordering::Relaxed))
            } else {
                Poll::Pending
            };
        }

        // Fast path: already published.
        let last = self.barrier.last_published();
        if !last.precedes(self.target) {
            return Poll::Ready(last);
        }

        let node = Waiter::new(SeqWait {
            target: self.target,
            last_known: S::new_atomic(last),
        });
        node.register(cx.waker());
        self.node = Some(node.clone());

        let raw = Waiter::into_raw(node.clone());
        unsafe { push_chain(&self.barrier.waiters, raw, raw, Ordering::SeqCst) };

        // Re-check with seq-cst: a publish that raced with the push must be
        // observed by one side.
        let last = S::load(&self.barrier.last_published, Ordering::SeqCst);
        if !last.precedes(self.target) {
            // Reclaim whatever is queued and run the producer's resume pass
            // on its behalf; our own node fires if it is still in the list.
            let detached = self.barrier.waiters.swap(ptr::null_mut(), Ordering::Acquire);
            if !detached.is_null() {
                self.barrier.split_and_resume(detached, last);
            }
        }

        if node.is_fired() {
            Poll::Ready(S::load(&node.payload.last_known, Ordering::Relaxed))
        } else {
            Poll::Pending
        }
    }
}

impl<S: Sequence> Drop for BarrierWaitFuture<'_, S> {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            let _ = node.abandon();
        }
    }
}
