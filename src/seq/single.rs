//! Single-producer claim protocol.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;

use super::barrier::BarrierWaitFuture;
use super::{Sequence, SequenceBarrier, SequenceRange};

/// Claim/publish coordination for exactly one producer.
///
/// The producer claims ring slots ahead of the consumer cursor and publishes
/// them through the internal barrier; because there is only one producer, the
/// claim cursor needs no compare-exchange, just plain loads and stores.
///
/// The application owns the ring storage; the sequencer only coordinates
/// sequence numbers. `buffer_size` must be a power of two and bounds how far
/// the producer may run ahead of `consumer_barrier`.
///
/// # Example
///
///```
/// use subito::seq::{SequenceBarrier, SingleProducerSequencer};
/// use subito::combinator::sync_wait;
/// use std::sync::Arc;
///
/// let consumed = Arc::new(SequenceBarrier::<usize>::new());
/// let sequencer = SingleProducerSequencer::new(consumed.clone(), 8);
///
/// sync_wait(async {
///     let seq = sequencer.claim_one().await;
///     // write ring[seq & 7] here
///     sequencer.publish(seq);
/// });
///```
pub struct SingleProducerSequencer<S: Sequence = usize> {
    consumer_barrier: Arc<SequenceBarrier<S>>,
    buffer_size: usize,
    /// Producer-only cursor; relaxed accesses are sufficient.
    next_to_claim: CachePadded<S::Atomic>,
    producer_barrier: SequenceBarrier<S>,
}

impl<S: Sequence> SingleProducerSequencer<S> {
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
        Self {
            consumer_barrier,
            buffer_size,
            next_to_claim: CachePadded::new(S::new_atomic(initial.add(1))),
            producer_barrier: SequenceBarrier::with_initial(initial),
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Claims the next slot, waiting until the consumer has freed it.
    pub fn claim_one(&self) -> ClaimOneFuture<'_, S> {
        let claimed = S::load(&self.next_to_claim, Ordering::Relaxed);
        ClaimOneFuture {
            sequencer: self,
            wait: self
                .consumer_barrier
                .wait_until_published(claimed.sub(self.buffer_size)),
            claimed,
        }
    }

    /// Claims between one and `count` contiguous slots, as many as are free.
    pub fn claim_up_to(&self, count: usize) -> ClaimRangeFuture<'_, S> {
        let begin = S::load(&self.next_to_claim, Ordering::Relaxed);
        ClaimRangeFuture {
            sequencer: self,
            wait: self
                .consumer_barrier
                .wait_until_published(begin.sub(self.buffer_size)),
            begin,
            count,
        }
    }

    /// Publishes every claimed sequence number up to and including `sequence`.
    pub fn publish(&self, sequence: S) {
        self.producer_barrier.publish(sequence);
    }

    /// Publishes a whole claimed range.
    pub fn publish_range(&self, range: SequenceRange<S>) {
        self.producer_barrier.publish(range.back());
    }

    #[inline]
    pub fn last_published(&self) -> S {
        self.producer_barrier.last_published()
    }

    /// Consumer-side wait on the producer's cursor.
    pub fn wait_until_published(&self, target: S) -> BarrierWaitFuture<'_, S> {
        self.producer_barrier.wait_until_published(target)
    }
}

/// Future returned by [`SingleProducerSequencer::claim_one`].
#[must_use = "futures do nothing unless polled"]
pub struct ClaimOneFuture<'a, S: Sequence> {
    sequencer: &'a SingleProducerSequencer<S>,
    wait: BarrierWaitFuture<'a, S>,
    claimed: S,
}

impl<S: Sequence> Unpin for ClaimOneFuture<'_, S> {}

impl<S: Sequence> Future for ClaimOneFuture<'_, S> {
    type Output = S;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.wait).poll(cx) {
            Poll::Ready(_) => {
                S::store(
                    &this.sequencer.next_to_claim,
                    this.claimed.add(1),
                    Ordering::Relaxed,
                );
                Poll::Ready(this.claimed)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`SingleProducerSequencer::claim_up_to`].
#[must_use = "futures do nothing unless polled"]
pub struct ClaimRangeFuture<'a, S: Sequence> {
    sequencer: &'a SingleProducerSequencer<S>,
    wait: BarrierWaitFuture<'a, S>,
    begin: S,
    count: usize,
}

impl<S: Sequence> Unpin for ClaimRangeFuture<'_, S> {}

impl<S: Sequence> Future for ClaimRangeFuture<'_, S> {
    type Output = SequenceRange<S>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.wait).poll(cx) {
            Poll::Ready(consumer_cursor) => {
                let last_available = consumer_cursor.add(this.sequencer.buffer_size);
                let available = last_available.difference(this.begin) + 1;
                debug_assert!(available > 0);
                let take = this.count.min(available as usize);
                let end = this.begin.add(take);
                S::store(&this.sequencer.next_to_claim, end, Ordering::Relaxed);
                Poll::Ready(SequenceRange::new(this.begin, end))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use futures::task::noop_waker;
    use std::thread;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    /// Claims advance one sequence number at a time starting from zero
    #[test]
    fn test_claim_sequence() {
        let consumed = Arc::new(SequenceBarrier::<usize>::new());
        let sequencer = SingleProducerSequencer::new(consumed, 4);

        for expected in 0..4usize {
            let seq = sync_wait(sequencer.claim_one());
            assert_eq!(seq, expected);
            sequencer.publish(seq);
        }
        assert_eq!(sequencer.last_published(), 3);
    }

    /// The producer stalls once it laps the consumer by a full buffer
    #[test]
    fn test_backpressure() {
        let consumed = Arc::new(SequenceBarrier::<usize>::new());
        let sequencer = SingleProducerSequencer::new(consumed.clone(), 2);

        sync_wait(sequencer.claim_one());
        sync_wait(sequencer.claim_one());
        let mut third = sequencer.claim_one();
        assert!(poll_once(&mut third).is_pending());

        // Consumer frees slot 0; the stalled claim resolves.
        consumed.publish(0);
        assert_eq!(poll_once(&mut third), Poll::Ready(2));
    }

    /// claim_up_to takes at most the free slot count
    #[test]
    fn test_claim_up_to_clamps() {
        let consumed = Arc::new(SequenceBarrier::<usize>::new());
        let sequencer = SingleProducerSequencer::new(consumed, 8);

        let range = sync_wait(sequencer.claim_up_to(64));
        assert_eq!(range.len(), 8);
        assert_eq!(range.front(), 0);
        assert_eq!(range.back(), 7);
    }

    /// Producer and consumer make progress through a tiny ring
    #[test]
    fn test_ping_pong() {
        const N: usize = 1000;
        let consumed = Arc::new(SequenceBarrier::<usize>::new());
        let sequencer = Arc::new(SingleProducerSequencer::new(consumed.clone(), 4));
        let ring = Arc::new(
            (0..4)
                .map(|_| std::sync::atomic::AtomicUsize::new(0))
                .collect::<Vec<_>>(),
        );

        let producer = {
            let sequencer = sequencer.clone();
            let ring = ring.clone();
            thread::spawn(move || {
                sync_wait(async {
                    for value in 1..=N {
                        let seq = sequencer.claim_one().await;
                        ring[seq & 3].store(value, Ordering::Relaxed);
                        sequencer.publish(seq);
                    }
                })
            })
        };

        let total = sync_wait(async {
            let mut sum = 0usize;
            let mut next = 0usize;
            while next < N {
                let available = sequencer.wait_until_published(next).await;
                while next <= available {
                    sum += ring[next & 3].load(Ordering::Relaxed);
                    next += 1;
                }
                consumed.publish(available);
            }
            sum
        });

        assert_eq!(total, N * (N + 1) / 2);
        producer.join().unwrap();
    }
}
