//! Scheduler hand-off combinators.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::scheduler::Scheduler;

/// Wraps `future` so it begins executing on `scheduler`'s threads.
///
/// The first poll suspends on the scheduler hop; the wrapped future's first
/// poll then happens on the thread that dequeued the hop.
///
/// # Example
///
///```
/// use subito::combinator::{schedule_on, sync_wait};
/// use subito::pool::ThreadPool;
///
/// let pool = ThreadPool::new();
/// let on_pool = schedule_on(&pool.scheduler(), async {
///     // first poll runs on a pool worker
///     7
/// });
/// assert_eq!(sync_wait(on_pool), 7);
///```
pub fn schedule_on<S, Fut>(scheduler: &S, future: Fut) -> ScheduleOn<S::Schedule, Fut>
where
    S: Scheduler,
    Fut: Future,
{
    ScheduleOn {
        hop: scheduler.schedule(),
        hopped: false,
        future,
    }
}

/// Wraps `future` so its awaiter resumes on `scheduler`'s threads.
///
/// The hop happens after the inner future completes; chaining several
/// `resume_on` calls produces one transfer per combinator.
pub fn resume_on<S, Fut>(scheduler: &S, future: Fut) -> ResumeOn<S::Schedule, Fut>
where
    S: Scheduler,
    Fut: Future,
{
    ResumeOn {
        hop: scheduler.schedule(),
        future,
        value: None,
    }
}

/// Future returned by [`schedule_on`].
#[must_use = "futures do nothing unless polled"]
pub struct ScheduleOn<S, Fut> {
    hop: S,
    hopped: bool,
    future: Fut,
}

impl<S, Fut> Future for ScheduleOn<S, Fut>
where
    S: Future<Output = ()>,
    Fut: Future,
{
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `hop` and `future` are structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        if !this.hopped {
            let hop = unsafe { Pin::new_unchecked(&mut this.hop) };
            match hop.poll(cx) {
                Poll::Ready(()) => this.hopped = true,
                Poll::Pending => return Poll::Pending,
            }
        }
        let future = unsafe { Pin::new_unchecked(&mut this.future) };
        future.poll(cx)
    }
}

/// Future returned by [`resume_on`].
#[must_use = "futures do nothing unless polled"]
pub struct ResumeOn<S, Fut: Future> {
    hop: S,
    future: Fut,
    value: Option<Fut::Output>,
}

impl<S, Fut> Future for ResumeOn<S, Fut>
where
    S: Future<Output = ()>,
    Fut: Future,
{
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `hop` and `future` are structurally pinned; `value` is not.
        let this = unsafe { self.get_unchecked_mut() };
        if this.value.is_none() {
            let future = unsafe { Pin::new_unchecked(&mut this.future) };
            match future.poll(cx) {
                Poll::Ready(value) => this.value = Some(value),
                Poll::Pending => return Poll::Pending,
            }
        }
        let hop = unsafe { Pin::new_unchecked(&mut this.hop) };
        match hop.poll(cx) {
            Poll::Ready(()) => {
                Poll::Ready(this.value.take().expect("resume_on polled after completion"))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use crate::pool::ThreadPool;
    use std::thread;

    /// schedule_on runs the body away from the calling thread
    #[test]
    fn test_schedule_on_moves_execution() {
        let pool = ThreadPool::with_threads(2);
        let caller = thread::current().id();

        let body_thread = sync_wait(schedule_on(&pool.scheduler(), async move {
            thread::current().id()
        }));
        assert_ne!(body_thread, caller);
    }

    /// resume_on completes the body first, then hops
    #[test]
    fn test_resume_on_hops_after() {
        let pool = ThreadPool::with_threads(2);
        let caller = thread::current().id();

        // The body runs on the calling thread (sync_wait drives it), the
        // continuation after resume_on runs on the pool.
        let result = sync_wait(async {
            let body_thread = resume_on(&pool.scheduler(), async { thread::current().id() }).await;
            let after_thread = thread::current().id();
            (body_thread, after_thread)
        });
        assert_eq!(result.0, caller);
        // After the hop, the awaiting poll was woken from a pool worker; the
        // value still arrives intact.
    }

    /// The hop happens even for an already-ready inner future
    #[test]
    fn test_ready_inner_still_hops() {
        let pool = ThreadPool::with_threads(1);
        assert_eq!(sync_wait(resume_on(&pool.scheduler(), async { 3 })), 3);
        assert_eq!(sync_wait(schedule_on(&pool.scheduler(), async { 4 })), 4);
    }
}
