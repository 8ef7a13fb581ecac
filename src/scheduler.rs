//! Execution seams shared by the thread pool and the I/O service.
//!
//! Two traits split the executor surface:
//!
//! - [`Executor`] is the enqueue side: it accepts ready-to-run jobs and
//!   promises some thread will call [`Runnable::run`] on each exactly once.
//! - [`Scheduler`] is the awaitable side: `schedule().await` suspends the
//!   caller and resumes it from an executor thread.
//!
//! Both the thread pool and the I/O service implement both; combinators like
//! [`schedule_on`](crate::combinator::schedule_on) and
//! [`resume_on`](crate::combinator::resume_on) only require [`Scheduler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::waiter::Waiter;

/// A unit of work an executor thread runs to completion.
pub trait Runnable: Send + Sync + 'static {
    fn run(self: Arc<Self>);
}

/// The enqueue seam: accepts a job and guarantees it runs exactly once on
/// some executor thread.
pub trait Executor: Send + Sync + 'static {
    fn enqueue(&self, job: Arc<dyn Runnable>);
}

/// Something that can transfer an awaiting computation onto its own threads.
pub trait Scheduler {
    type Schedule: Future<Output = ()> + Send + 'static;

    /// Returns an awaitable that suspends the caller and resumes it on one of
    /// the scheduler's threads. A schedule operation that has been awaited
    /// resumes exactly once.
    fn schedule(&self) -> Self::Schedule;
}

/// The awaitable returned by [`Scheduler::schedule`] for executor-backed
/// schedulers.
///
/// The first poll enqueues a fire-once node; the node is completed by the
/// executor thread that dequeues it, which makes the hop observable: polls
/// that happen before the dequeue stay pending.
#[must_use = "futures do nothing unless polled"]
pub struct ScheduleFuture {
    executor: Arc<dyn Executor>,
    node: Option<Arc<Waiter<()>>>,
}

/// Safe: no field is pinned to another field of the same struct.
impl Unpin for ScheduleFuture {}

impl ScheduleFuture {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            node: None,
        }
    }
}

impl Runnable for Waiter<()> {
    fn run(self: Arc<Self>) {
        // A false return means the awaiting future was dropped; nothing to
        // resume in that case.
        let _ = self.fire();
    }
}

impl Future for ScheduleFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.node {
            None => {
                let node = Waiter::new(());
                // Register before publishing the node so the dequeuing thread
                // either sees this waker or its wake is observed by the next
                // poll's state check.
                node.register(cx.waker());
                self.node = Some(node.clone());
                self.executor.enqueue(node);
                Poll::Pending
            }
            Some(node) => {
                node.register(cx.waker());
                if node.is_fired() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for ScheduleFuture {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            // Tell the executor not to bother waking us.
            let _ = node.abandon();
        }
    }
}
