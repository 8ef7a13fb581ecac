//! Multi-producer claim protocol with gap-free publish detection.

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;

use super::barrier::{BarrierWaitFuture, SeqNode, SeqWait, push_chain};
use super::{Sequence, SequenceBarrier, SequenceRange};
use crate::waiter::{self, Waiter};

/// Claim/publish coordination for any number of producers.
///
/// Slots are claimed with a fetch-add on the shared claim cursor, so two
/// producers may publish out of order. A parallel array of per-slot published
/// sequence numbers (`published[s & mask] == s` iff slot `s` is published)
/// lets consumers walk forward to the last *contiguous* published sequence,
/// so a consumer never observes a gap.
///
/// The application owns the ring storage; `buffer_size` must be a power of
/// two.
pub struct MultiProducerSequencer<S: Sequence = usize> {
    consumer_barrier: Arc<SequenceBarrier<S>>,
    mask: usize,
    published: Box<[S::Atomic]>,
    next_to_claim: CachePadded<S::Atomic>,
    waiters: CachePadded<AtomicPtr<SeqNode<S>>>,
}

unsafe impl<S: Sequence> Send for MultiProducerSequencer<S> {}
unsafe impl<S: Sequence> Sync for MultiProducerSequencer<S> {}

impl<S: Sequence> MultiProducerSequencer<S> {
    pub fn new(consumer_barrier: Arc<SequenceBarrier<S>>, buffer_size: usize) -> Self {
        Self::with_initial(consumer_barrier, buffer_size, S::INITIAL)
    }

    pub fn with_initial(
        consumer_barrier: Arc<SequenceBarrier<S>>,
        buffer_size: usize,
        initial: S,
    ) -> Self {
        assert!(
            buffer_size.is_power_of_two(),
            "buffer size must be a power of two"
        );
        let mask = buffer_size - 1;
        // Seed each slot with the sequence number one full lap behind its
        // first real occupant, so the contiguity walk never misreads a
        // fresh slot as published.
        let mut slots: Vec<Option<S::Atomic>> = (0..buffer_size).map(|_| None).collect();
        let mut seed = initial.sub(mask);
        for _ in 0..buffer_size {
            slots[seed.index(mask)] = Some(S::new_atomic(seed));
            seed = seed.add(1);
        }
        let published = slots
            .into_iter()
            .map(|slot| slot.expect("every ring slot is seeded"))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            consumer_barrier,
            mask,
            published,
            next_to_claim: CachePadded::new(S::new_atomic(initial.add(1))),
            waiters: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.mask + 1
    }

    /// Claims the next free slot; resolves once the consumer has freed it.
    ///
    /// The slot is taken from the shared cursor on first poll, so an
    /// unawaited claim future never creates a publish gap.
    pub fn claim_one(&self) -> MultiClaimOneFuture<'_, S> {
        MultiClaimOneFuture {
            sequencer: self,
            state: None,
        }
    }

    /// Claims between one and `count` contiguous slots.
    ///
    /// Unlike the single-producer variant the claim size is fixed up front
    /// (clamped to the buffer size): the cursor is shared, so the claim
    /// cannot be resized after other producers have claimed past it.
    pub fn claim_up_to(&self, count: usize) -> MultiClaimRangeFuture<'_, S> {
        MultiClaimRangeFuture {
            sequencer: self,
            count: count.clamp(1, self.buffer_size()),
            state: None,
        }
    }

    /// Marks one claimed sequence number as published and resumes any
    /// consumer the publish satisfies.
    pub fn publish(&self, sequence: S) {
        // Seq-cst store pairs with the seq-cst waiter-list operations in the
        // wait path.
        S::store(
            &self.published[sequence.index(self.mask)],
            sequence,
            Ordering::SeqCst,
        );
        self.resume_ready_waiters();
    }

    /// Publishes a claimed range. The range's first sequence number is
    /// stored last (seq-cst), so the contiguity walk exposes the whole range
    /// at once.
    pub fn publish_range(&self, range: SequenceRange<S>) {
        for seq in range.iter().skip(1) {
            S::store(&self.published[seq.index(self.mask)], seq, Ordering::Relaxed);
        }
        S::store(
            &self.published[range.front().index(self.mask)],
            range.front(),
            Ordering::SeqCst,
        );
        self.resume_ready_waiters();
    }

    /// Walks forward from `last_known` while slots remain contiguously
    /// published, returning the last published sequence in the prefix.
    ///
    /// Every slot in `(last_known, returned]` is safe to read.
    pub fn last_published_after(&self, last_known: S) -> S {
        self.contiguous_prefix(last_known, Ordering::Acquire)
    }

    fn contiguous_prefix(&self, last_known: S, order: Ordering) -> S {
        let mut last = last_known;
        let mut seq = last_known.add(1);
        while S::load(&self.published[seq.index(self.mask)], order) == seq {
            last = seq;
            seq = seq.add(1);
        }
        last
    }

    /// Waits until the sequence after `last_known` reaches `target`.
    ///
    /// Resolves to the latest contiguously published sequence, which never
    /// precedes `target`.
    pub fn wait_until_published(&self, target: S, last_known: S) -> MultiWaitFuture<'_, S> {
        MultiWaitFuture {
            sequencer: self,
            target,
            last_known,
            node: None,
        }
    }

    fn resume_ready_waiters(&self) {
        if self.waiters.load(Ordering::SeqCst).is_null() {
            return;
        }
        let detached = self.waiters.swap(ptr::null_mut(), Ordering::SeqCst);
        if detached.is_null() {
            return;
        }
        self.split_and_resume(detached);
    }

    /// The shared resume pass: partition a detached chain by the current
    /// contiguous prefix, requeue the unsatisfied waiters, then re-walk the
    /// published array to catch publishes that raced with the requeue.
    fn split_and_resume(&self, detached: *const SeqNode<S>) {
        let mut resume_head: *const SeqNode<S> = ptr::null();
        let mut pending = detached;
        let mut last_known =
            self.last_published_after(unsafe { S::load(&(*pending).payload.last_known, Ordering::Relaxed) });

        loop {
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

            // Catch publishes that landed while the requeued waiters were
            // detached: walk the published array up to the earliest requeued
            // target, and reclaim the list if it was reached.
            let earliest_target = last_known.add(min_diff as usize);
            let mut seq = last_known.add(1);
            let mut reached = false;
            while S::load(&self.published[seq.index(self.mask)], Ordering::SeqCst) == seq {
                last_known = seq;
                if seq == earliest_target {
                    reached = true;
                    break;
                }
                seq = seq.add(1);
            }
            if !reached {
                break;
            }

            let reclaimed = self.waiters.swap(ptr::null_mut(), Ordering::Acquire);
            if reclaimed.is_null() {
                break;
            }
            pending = reclaimed;
        }

        for node in unsafe { waiter::drain(resume_head) } {
            S::store(&node.payload.last_known, last_known, Ordering::Relaxed);
            let _ = node.fire();
        }
    }
}

/// Future returned by [`MultiProducerSequencer::claim_one`].
#[must_use = "futures do nothing unless polled"]
pub struct MultiClaimOneFuture<'a, S: Sequence> {
    sequencer: &'a MultiProducerSequencer<S>,
    state: Option<(S, BarrierWaitFuture<'a, S>)>,
}

impl<S: Sequence> Unpin for MultiClaimOneFuture<'_, S> {}

impl<S: Sequence> Future for MultiClaimOneFuture<'_, S> {
    type Output = S;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let (claimed, wait) = this.state.get_or_insert_with(|| {
            let claimed = S::fetch_add(&this.sequencer.next_to_claim, 1, Ordering::Relaxed);
            let wait = this
                .sequencer
                .consumer_barrier
                .wait_until_published(claimed.sub(this.sequencer.buffer_size()));
            (claimed, wait)
        });
        match Pin::new(wait).poll(cx) {
            Poll::Ready(_) => Poll::Ready(*claimed),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`MultiProducerSequencer::claim_up_to`].
#[must_use = "futures do nothing unless polled"]
pub struct MultiClaimRangeFuture<'a, S: Sequence> {
    sequencer: &'a MultiProducerSequencer<S>,
    count: usize,
    state: Option<(SequenceRange<S>, BarrierWaitFuture<'a, S>)>,
}

impl<S: Sequence> Unpin for MultiClaimRangeFuture<'_, S> {}

impl<S: Sequence> Future for MultiClaimRangeFuture<'_, S> {
    type Output = SequenceRange<S>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let (range, wait) = this.state.get_or_insert_with(|| {
            let begin = S::fetch_add(&this.sequencer.next_to_claim, this.count, Ordering::Relaxed);
            let range = SequenceRange::new(begin, begin.add(this.count));
            let wait = this
                .sequencer
                .consumer_barrier
                .wait_until_published(range.back().sub(this.sequencer.buffer_size()));
            (range, wait)
        });
        match Pin::new(wait).poll(cx) {
            Poll::Ready(_) => Poll::Ready(*range),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`MultiProducerSequencer::wait_until_published`].
#[must_use = "futures do nothing unless polled"]
pub struct MultiWaitFuture<'a, S: Sequence> {
    sequencer: &'a MultiProducerSequencer<S>,
    target: S,
    last_known: S,
    node: Option<Arc<SeqNode<S>>>,
}

impl<S: Sequence> Unpin for MultiWaitFuture<'_, S> {}

impl<S: Sequence> Future for MultiWaitFuture<'_, S> {
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

        // Fast path: the contiguous prefix already covers the target.
        let available = self.sequencer.last_published_after(self.last_known);
        if !available.precedes(self.target) {
            return Poll::Ready(available);
        }

        let node = Waiter::new(SeqWait {
            target: self.target,
            last_known: S::new_atomic(available),
        });
        node.register(cx.waker());
        self.node = Some(node.clone());

        let raw = Waiter::into_raw(node.clone());
        unsafe { push_chain(&self.sequencer.waiters, raw, raw, Ordering::SeqCst) };

        // Re-check with seq-cst: a publish racing with the push must be
        // caught by one side. Run the resume pass ourselves if anything
        // moved.
        if self.sequencer.contiguous_prefix(available, Ordering::SeqCst) != available {
            self.sequencer.resume_ready_waiters();
        }

        if node.is_fired() {
            Poll::Ready(S::load(&node.payload.last_known, Ordering::Relaxed))
        } else {
            Poll::Pending
        }
    }
}

impl<S: Sequence> Drop for MultiWaitFuture<'_, S> {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            let _ = node.abandon();
        }
    }
}
