//! Eager one-shot task and the executor-owned task core.

use std::cell::UnsafeCell;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use futures::task::{ArcWake, AtomicWaker, waker_ref};

use crate::error::Error;
use crate::scheduler::{Executor, Runnable};

// Poll-ownership state machine. Exactly one thread owns the future between
// `Running` and the transition back to `Idle`/`Scheduled`.
const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
/// Running, and a wake arrived mid-poll: re-enqueue after the poll.
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

// Completion hand-off between producer and consumer.
const NOT_COMPLETED: u8 = 0;
const COMPLETED: u8 = 1;

/// Executor-owned state of one spawned future.
pub(crate) struct TaskCore<F: Future> {
    run_state: AtomicU8,
    /// The spawned body. Owned by whichever thread holds `RUNNING`.
    future: UnsafeCell<Option<F>>,
    /// Written once by the completing poll, then published via `completed`.
    result: UnsafeCell<Option<std::thread::Result<F::Output>>>,
    /// Resolves the race between the completing poll and the join handle
    /// attaching its waker: the compare-exchange to `COMPLETED` happens after
    /// the result write, the consumer's acquire load happens after waker
    /// registration.
    completed: AtomicU8,
    join_waker: AtomicWaker,
    executor: Arc<dyn Executor>,
}

unsafe impl<F> Send for TaskCore<F>
where
    F: Future + Send,
    F::Output: Send,
{
}
unsafe impl<F> Sync for TaskCore<F>
where
    F: Future + Send,
    F::Output: Send,
{
}

impl<F> TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn new(future: F, executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            run_state: AtomicU8::new(SCHEDULED),
            future: UnsafeCell::new(Some(future)),
            result: UnsafeCell::new(None),
            completed: AtomicU8::new(NOT_COMPLETED),
            join_waker: AtomicWaker::new(),
            executor,
        })
    }

    fn schedule(self: &Arc<Self>) {
        self.executor.enqueue(self.clone());
    }
}

impl<F> ArcWake for TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut state = arc_self.run_state.load(Ordering::Relaxed);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                // Already queued, already notified, or finished.
                SCHEDULED | NOTIFIED | DONE => return,
                _ => unreachable!("invalid task state"),
            };
            match arc_self.run_state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == SCHEDULED {
                        arc_self.schedule();
                    }
                    return;
                }
                Err(current) => state = current,
            }
        }
    }
}

impl<F> Runnable for TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn run(self: Arc<Self>) {
        if self
            .run_state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Stale queue entry (the task completed or was re-queued through
            // a racing wake that already ran).
            return;
        }

        // SAFETY: holding RUNNING grants exclusive access to the cells.
        let future = unsafe { &mut *self.future.get() };
        let Some(body) = future.as_mut() else {
            return;
        };
        // SAFETY: the future never moves out of its heap cell.
        let body = unsafe { Pin::new_unchecked(body) };

        let waker = waker_ref(&self);
        let mut cx = Context::from_waker(&waker);
        // A panicking body poisons nothing: the payload becomes the task's
        // result and re-raises on await.
        let polled = catch_unwind(AssertUnwindSafe(|| body.poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => {
                if self
                    .run_state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // A wake arrived while we were polling; run again.
                    self.run_state.store(SCHEDULED, Ordering::Release);
                    self.schedule();
                }
            }
            Ok(Poll::Ready(value)) => self.complete(Ok(value)),
            Err(payload) => self.complete(Err(payload)),
        }
    }
}

impl<F> TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn complete(&self, outcome: std::thread::Result<F::Output>) {
        // SAFETY: still holding RUNNING.
        unsafe {
            *self.future.get() = None;
            *self.result.get() = Some(outcome);
        }
        self.run_state.store(DONE, Ordering::Release);
        // Publish before waking so the consumer's acquire load sees the
        // result.
        self.completed.store(COMPLETED, Ordering::Release);
        self.join_waker.wake();
    }
}

/// Dyn-erased join surface so `EagerTask<T>` does not name the future type.
trait JoinCore<T>: Send + Sync {
    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<T, Error>>;
    /// Like `poll_join` but leaves the result in place.
    fn poll_complete(&self, cx: &mut Context<'_>) -> Poll<()>;
    fn is_complete(&self) -> bool;
}

impl<F> JoinCore<F::Output> for TaskCore<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn poll_join(&self, cx: &mut Context<'_>) -> Poll<Result<F::Output, Error>> {
        self.join_waker.register(cx.waker());
        if self.completed.load(Ordering::Acquire) != COMPLETED {
            return Poll::Pending;
        }
        // SAFETY: COMPLETED published the producer's writes; the single join
        // handle is the only consumer.
        let outcome = unsafe { (*self.result.get()).take() };
        match outcome {
            Some(Ok(value)) => Poll::Ready(Ok(value)),
            Some(Err(payload)) => Poll::Ready(Err(Error::Panic(payload))),
            None => panic!("eager task awaited after its result was consumed"),
        }
    }

    fn poll_complete(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.join_waker.register(cx.waker());
        if self.completed.load(Ordering::Acquire) == COMPLETED {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire) == COMPLETED
    }
}

/// Spawns `future` onto `executor`, returning the join handle.
pub(crate) fn spawn_on<F>(executor: Arc<dyn Executor>, future: F) -> EagerTask<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let core = TaskCore::new(future, executor);
    core.schedule();
    EagerTask { core }
}

/// A one-shot computation that started executing when it was created.
///
/// Produced by [`ThreadPool::spawn`](crate::pool::ThreadPool::spawn) and
/// [`IoService::spawn`](crate::io::IoService::spawn). The body runs on the
/// executor's threads regardless of whether the handle is ever awaited;
/// dropping the handle detaches it. Awaiting yields the body's output, or
/// [`Error::Panic`] if the body panicked.
///
/// # Example
///
///```
/// use subito::pool::ThreadPool;
/// use subito::combinator::sync_wait;
///
/// let pool = ThreadPool::new();
/// let task = pool.spawn(async { String::from("ran elsewhere") });
/// assert_eq!(sync_wait(task).unwrap(), "ran elsewhere");
///```
pub struct EagerTask<T> {
    core: Arc<dyn JoinCore<T>>,
}

impl<T> EagerTask<T> {
    /// True once the body has finished (successfully or by panicking).
    pub fn is_ready(&self) -> bool {
        self.core.is_complete()
    }

    /// Waits for completion without consuming the result.
    pub fn when_ready(&self) -> EagerWhenReady<'_, T> {
        EagerWhenReady { task: self }
    }
}

impl<T> Unpin for EagerTask<T> {}

impl<T> Future for EagerTask<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.core.poll_join(cx)
    }
}

/// Future returned by [`EagerTask::when_ready`].
#[must_use = "futures do nothing unless polled"]
pub struct EagerWhenReady<'a, T> {
    task: &'a EagerTask<T>,
}

impl<T> Unpin for EagerWhenReady<'_, T> {}

impl<T> Future for EagerWhenReady<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task.core.poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use crate::pool::ThreadPool;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// The body starts without the handle being awaited
    #[test]
    fn test_starts_on_spawn() {
        let pool = ThreadPool::with_threads(2);
        let started = Arc::new(AtomicBool::new(false));

        let task = {
            let started = started.clone();
            pool.spawn(async move {
                started.store(true, Ordering::SeqCst);
            })
        };

        // Busy-wait for the worker to pick it up; no awaiting involved.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !started.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "body never started");
            std::thread::yield_now();
        }
        sync_wait(task).unwrap();
    }

    /// A detached task still runs to completion
    #[test]
    fn test_detached_runs() {
        let pool = ThreadPool::with_threads(1);
        let ran = Arc::new(AtomicBool::new(false));

        {
            let ran = ran.clone();
            drop(pool.spawn(async move {
                ran.store(true, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ran.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "detached body never ran");
            std::thread::yield_now();
        }
    }

    /// Panics in the body surface as Error::Panic on await
    #[test]
    fn test_panic_captured() {
        let pool = ThreadPool::with_threads(1);
        let task = pool.spawn(async { panic!("kaboom") });
        let err = sync_wait(task).unwrap_err();
        assert!(err.is_panic());
        assert_eq!(*err.into_panic().downcast::<&str>().unwrap(), "kaboom");
    }

    /// when_ready leaves the result consumable
    #[test]
    fn test_when_ready() {
        let pool = ThreadPool::with_threads(1);
        let task = pool.spawn(async { 9 });
        sync_wait(task.when_ready());
        assert!(task.is_ready());
        assert_eq!(sync_wait(task).unwrap(), 9);
    }
}
