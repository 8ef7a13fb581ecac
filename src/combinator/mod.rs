//! Composition of awaitables.
//!
//! - [`sync_wait`]: block the calling OS thread until a future completes.
//! - [`when_all_ready`]: await every input; deliver all outputs, never
//!   short-circuiting on failures.
//! - [`when_all`]: await every input; deliver the values or the first error.
//! - [`fmap`]: lift a function over a future, preserving laziness.
//! - [`schedule_on`]: hop to a scheduler before the wrapped future starts.
//! - [`resume_on`]: hop to a scheduler after the wrapped future completes.

mod fmap;
mod scheduling;
mod sync_wait;
mod when_all;

pub use fmap::{FMap, FmapExt, fmap};
pub use scheduling::{ResumeOn, ScheduleOn, resume_on, schedule_on};
pub use sync_wait::sync_wait;
pub use when_all::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ThreadPool;
    use crate::seq::{SequenceBarrier, SingleProducerSequencer};
    use crate::sync::AsyncAutoResetEvent;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// when_all joins spawned tasks running on pool workers
    #[test]
    fn test_when_all_over_spawned_tasks() {
        let pool = ThreadPool::with_threads(2);
        let a = pool.spawn(async { 2u32 });
        let b = pool.spawn(async { 3u32 });
        let (x, y) = sync_wait(when_all((a, b))).unwrap();
        assert_eq!(x + y, 5);
    }

    /// A pool-side producer feeds a ring the calling thread consumes
    #[test]
    fn test_ring_pipeline_through_pool() {
        const N: usize = 10_000;
        const BUFFER: usize = 64;

        let pool = ThreadPool::with_threads(2);
        let consumed = Arc::new(SequenceBarrier::<usize>::new());
        let sequencer = Arc::new(SingleProducerSequencer::new(consumed.clone(), BUFFER));
        let ring = Arc::new(
            (0..BUFFER)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>(),
        );

        let producer = {
            let sequencer = sequencer.clone();
            let ring = ring.clone();
            pool.spawn(async move {
                for value in 1..=N {
                    let seq = sequencer.claim_one().await;
                    ring[seq & (BUFFER - 1)].store(value, Ordering::Relaxed);
                    sequencer.publish(seq);
                }
            })
        };

        let total = sync_wait(async {
            let mut sum = 0usize;
            let mut next = 0usize;
            while next < N {
                let available = sequencer.wait_until_published(next).await;
                while next <= available {
                    sum += ring[next & (BUFFER - 1)].load(Ordering::Relaxed);
                    next += 1;
                }
                consumed.publish(available);
            }
            sum
        });

        assert_eq!(total, N * (N + 1) / 2);
        sync_wait(producer).unwrap();
    }

    /// schedule_on, events and fmap compose into one awaitable chain
    #[test]
    fn test_composed_chain() {
        let pool = ThreadPool::with_threads(2);
        let gate = Arc::new(AsyncAutoResetEvent::new(false));

        let chain = {
            let gate = gate.clone();
            fmap(
                |()| "done",
                schedule_on(&pool.scheduler(), async move {
                    gate.wait().await;
                }),
            )
        };

        gate.set();
        assert_eq!(sync_wait(chain), "done");
    }
}
