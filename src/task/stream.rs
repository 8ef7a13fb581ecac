//! Split-subscription async stream: a value stream plus a result task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::error::Error;

type Producer<R> = Pin<Box<dyn Future<Output = Result<R, Error>> + Send>>;

struct StreamCore<T, R> {
    /// The producer body. Driven by the items side; after the items handle is
    /// dropped mid-stream, the task side takes over the drive. The protocol
    /// never has both sides polling concurrently, so the lock is uncontended.
    producer: Mutex<Option<Producer<R>>>,
    /// Yield hand-off slot, shared with the producer's yielder.
    slot: Arc<Mutex<Option<T>>>,
    /// Items handle started consuming (its first poll happened).
    started: AtomicBool,
    /// Items handle was dropped; further yields are refused. Shared with the
    /// producer's yielder.
    items_dropped: Arc<AtomicBool>,
    /// Terminal result is available.
    completed: AtomicBool,
    result: Mutex<Option<Result<R, Error>>>,
    task_waker: AtomicWaker,
}

impl<T, R> StreamCore<T, R> {
    fn finish(&self, outcome: Result<R, Error>) {
        *self.result.lock() = Some(outcome);
        self.completed.store(true, Ordering::Release);
        self.task_waker.wake();
    }
}

/// Splits a producer into a [`StreamTask`] (terminal result) and
/// [`StreamItems`] (the yielded values).
///
/// The producer does not start until the items handle is first polled.
/// Arbitration between the two handles:
///
/// - Items dropped before ever starting: the producer is never invoked and
///   the task resolves with [`Error::BrokenPromise`].
/// - Items dropped mid-stream: further yields resolve `false` (refused) and
///   the task handle drives the producer to completion.
/// - Task dropped: the items side keeps streaming; the terminal result is
///   discarded.
///
/// A producer failure becomes the task's `Err` outcome; the item stream
/// simply ends.
///
/// # Example
///
///```
/// use subito::task::subscribe;
/// use subito::combinator::sync_wait;
/// use futures::StreamExt;
///
/// let (task, items) = subscribe(|mut y| async move {
///     for i in 0..3u32 {
///         if !y.yield_(i).await {
///             break;
///         }
///     }
///     Ok("all sent")
/// });
///
/// let collected: Vec<u32> = sync_wait(items.collect());
/// assert_eq!(collected, vec![0, 1, 2]);
/// assert_eq!(sync_wait(task).unwrap(), "all sent");
///```
pub fn subscribe<T, R, F, Fut>(producer: F) -> (StreamTask<R>, StreamItems<T, R>)
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(StreamYielder<T>) -> Fut,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let core = Arc::new(StreamCore {
        producer: Mutex::new(None),
        slot: Arc::new(Mutex::new(None)),
        started: AtomicBool::new(false),
        items_dropped: Arc::new(AtomicBool::new(false)),
        completed: AtomicBool::new(false),
        result: Mutex::new(None),
        task_waker: AtomicWaker::new(),
    });

    let yielder = StreamYielder {
        slot: core.slot.clone(),
        items_dropped: core.items_dropped.clone(),
    };
    *core.producer.lock() = Some(Box::pin(producer(yielder)));

    (
        StreamTask { core: core.clone() },
        StreamItems { core },
    )
}

/// The producer's handle for emitting values.
pub struct StreamYielder<T> {
    slot: Arc<Mutex<Option<T>>>,
    items_dropped: Arc<AtomicBool>,
}

impl<T> StreamYielder<T> {
    /// Emits one value.
    ///
    /// Resolves `true` once the consumer has taken the value, or `false`
    /// immediately (discarding the value) if the consumer is gone; the
    /// producer should wind down when it sees `false`.
    pub fn yield_(&mut self, value: T) -> StreamYieldFuture<T> {
        StreamYieldFuture {
            slot: self.slot.clone(),
            items_dropped: self.items_dropped.clone(),
            value: Some(value),
            delivered: false,
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct StreamYieldFuture<T> {
    slot: Arc<Mutex<Option<T>>>,
    items_dropped: Arc<AtomicBool>,
    value: Option<T>,
    delivered: bool,
}

impl<T> Unpin for StreamYieldFuture<T> {}

impl<T> Future for StreamYieldFuture<T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.items_dropped.load(Ordering::Acquire) {
            // Consumer detached: refuse the yield so the producer can finish.
            self.value = None;
            return Poll::Ready(false);
        }
        match self.value.take() {
            Some(value) => {
                *self.slot.lock() = Some(value);
                self.delivered = true;
                Poll::Pending
            }
            None => Poll::Ready(self.delivered),
        }
    }
}

/// The consuming half of a subscription; yields the produced values.
pub struct StreamItems<T, R> {
    core: Arc<StreamCore<T, R>>,
}

impl<T, R> Unpin for StreamItems<T, R> {}

impl<T, R> Stream for StreamItems<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let core = &self.core;
        if core.completed.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        core.started.store(true, Ordering::Release);

        let mut producer = core.producer.lock();
        let Some(body) = producer.as_mut() else {
            return Poll::Ready(None);
        };

        match body.as_mut().poll(cx) {
            Poll::Pending => match core.slot.lock().take() {
                Some(value) => Poll::Ready(Some(value)),
                None => Poll::Pending,
            },
            Poll::Ready(outcome) => {
                *producer = None;
                drop(producer);
                core.finish(outcome);
                Poll::Ready(None)
            }
        }
    }
}

impl<T, R> Drop for StreamItems<T, R> {
    fn drop(&mut self) {
        self.core.items_dropped.store(true, Ordering::Release);
        if !self.core.started.load(Ordering::Acquire) {
            // Never begun: the producer must not run at all.
            *self.core.producer.lock() = None;
            self.core.finish(Err(Error::BrokenPromise));
        } else if !self.core.completed.load(Ordering::Acquire) {
            // Mid-stream: wake the task side so it can drive the producer to
            // completion (yields now resolve false).
            self.core.task_waker.wake();
        }
    }
}

/// The result half of a subscription; resolves when the producer completes.
#[must_use = "futures do nothing unless polled"]
pub struct StreamTask<R> {
    core: Arc<dyn TaskSide<R>>,
}

/// Dyn-erased view of the core for the task handle (hides `T`).
trait TaskSide<R>: Send + Sync {
    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<Result<R, Error>>;
}

impl<T, R> TaskSide<R> for StreamCore<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn poll_result(&self, cx: &mut Context<'_>) -> Poll<Result<R, Error>> {
        self.task_waker.register(cx.waker());

        if self.completed.load(Ordering::Acquire) {
            let result = self
                .result
                .lock()
                .take()
                .expect("stream task awaited after completion was consumed");
            return Poll::Ready(result);
        }

        if self.items_dropped.load(Ordering::Acquire) && self.started.load(Ordering::Acquire) {
            // The items side abandoned the drive; finish the producer here.
            let mut producer = self.producer.lock();
            if let Some(body) = producer.as_mut() {
                if let Poll::Ready(outcome) = body.as_mut().poll(cx) {
                    *producer = None;
                    drop(producer);
                    self.finish(outcome);
                    let result = self.result.lock().take().expect("just finished");
                    return Poll::Ready(result);
                }
                // Any values yielded while we drive are refused, so the slot
                // stays empty.
            }
        }

        Poll::Pending
    }
}

impl<R> Unpin for StreamTask<R> {}

impl<R> Future for StreamTask<R> {
    type Output = Result<R, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.core.poll_result(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use futures::StreamExt;

    /// Values and the terminal result both arrive
    #[test]
    fn test_split_consumption() {
        let (task, items) = subscribe(|mut y| async move {
            for i in 0..4u32 {
                if !y.yield_(i).await {
                    break;
                }
            }
            Ok(10u32)
        });

        let values: Vec<u32> = sync_wait(items.collect());
        assert_eq!(values, vec![0, 1, 2, 3]);
        assert_eq!(sync_wait(task).unwrap(), 10);
    }

    /// Dropping the items handle before starting never runs the producer
    #[test]
    fn test_unstarted_drop_is_broken_promise() {
        let (task, items) = subscribe(|mut y| async move {
            if true {
                unreachable!("producer must not start");
            }
            y.yield_(0u32).await;
            Ok(())
        });

        drop(items);
        assert!(sync_wait(task).unwrap_err().is_broken_promise());
    }

    /// Dropping the items handle mid-stream refuses further yields and the
    /// task drives the producer to its terminal result
    #[test]
    fn test_midstream_drop_hands_drive_to_task() {
        let (task, mut items) = subscribe(|mut y| async move {
            let mut sent = 0u32;
            for i in 0..100u32 {
                if !y.yield_(i).await {
                    break;
                }
                sent += 1;
            }
            Ok(sent)
        });

        sync_wait(async {
            assert_eq!(items.next().await, Some(0));
            assert_eq!(items.next().await, Some(1));
        });
        drop(items);

        // The producer saw the refusal and reported how far it got.
        assert_eq!(sync_wait(task).unwrap(), 2);
    }

    /// Dropping the task handle leaves the stream fully consumable
    #[test]
    fn test_task_drop_keeps_stream() {
        let (task, items) = subscribe(|mut y| async move {
            for i in 0..3u32 {
                if !y.yield_(i).await {
                    break;
                }
            }
            Ok(())
        });

        drop(task);
        let values: Vec<u32> = sync_wait(items.collect());
        assert_eq!(values, vec![0, 1, 2]);
    }

    /// A producer failure surfaces on the task handle
    #[test]
    fn test_failure_on_task() {
        let (task, items) = subscribe(|mut y| async move {
            y.yield_(1u32).await;
            Err::<(), _>(Error::System(7))
        });

        let values: Vec<u32> = sync_wait(items.collect());
        assert_eq!(values, vec![1]);
        assert!(matches!(sync_wait(task), Err(Error::System(7))));
    }
}
