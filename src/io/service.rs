//! Reactor-backed event loop and scheduler.

use std::future::Future;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::scheduler::{Executor, Runnable, ScheduleFuture, Scheduler};
use crate::task::{EagerTask, spawn_on};

use super::operation::{IoOperation, OpHeader, SubmitOutcome};
use super::reactor::{LocalReactor, Reactor};
use super::timer::{TimedScheduleFuture, TimerControl};

type Job = Arc<dyn Runnable>;

const STOP_FLAG: usize = 1;
const ACTIVE_INC: usize = 2;

/// Tag bits in completion keys; allocations are at least 8-byte aligned so
/// the low bits are free.
const KEY_KIND_MASK: usize = 0b11;
pub(super) const KEY_JOB: usize = 0b01;
pub(super) const KEY_OP: usize = 0b10;

/// Node of the overflow stack holding wake posts the reactor refused.
struct OverflowNode {
    next: *mut OverflowNode,
    job: Job,
}

pub(super) struct IoInner<R: Reactor> {
    pub(super) reactor: R,
    /// Packed `(active_thread_count << 1 | stop_flag)`.
    thread_state: AtomicUsize,
    work_count: AtomicUsize,
    overflow: AtomicPtr<OverflowNode>,
    pub(super) timer: OnceLock<TimerControl>,
}

impl<R: Reactor> IoInner<R> {
    fn try_enter_event_loop(&self) -> bool {
        let mut state = self.thread_state.load(Ordering::Relaxed);
        loop {
            if state & STOP_FLAG != 0 {
                return false;
            }
            match self.thread_state.compare_exchange_weak(
                state,
                state + ACTIVE_INC,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    fn exit_event_loop(&self) {
        self.thread_state.fetch_sub(ACTIVE_INC, Ordering::Relaxed);
    }

    pub(super) fn is_stop_requested(&self) -> bool {
        self.thread_state.load(Ordering::Acquire) & STOP_FLAG != 0
    }

    pub(super) fn stop(&self) {
        let old = self.thread_state.fetch_or(STOP_FLAG, Ordering::Release);
        if old & STOP_FLAG == 0 {
            // One wake per thread inside the loop, so each of them observes
            // the stop and leaves.
            for _ in 0..(old / ACTIVE_INC) {
                self.reactor.post_wake(0);
            }
        }
    }

    /// Requeues wake posts that previously failed. Runs before every poll.
    fn retry_overflow(&self) {
        let mut node = self.overflow.swap(ptr::null_mut(), Ordering::Acquire);
        while !node.is_null() {
            let owned = unsafe { Box::from_raw(node) };
            node = owned.next;
            self.post_job(owned.job);
        }
    }

    /// Posts a job to the completion queue, spilling to the overflow stack
    /// if the reactor refuses the post.
    fn post_job(&self, job: Job) {
        let key = Box::into_raw(Box::new(job)) as usize | KEY_JOB;
        if self.reactor.post_wake(key) {
            return;
        }

        // Reclaim the allocation and park the job on the lock-free overflow
        // stack; the next thread entering the loop retries it.
        let job = *unsafe { Box::from_raw((key & !KEY_KIND_MASK) as *mut Job) };
        let node = Box::into_raw(Box::new(OverflowNode {
            next: ptr::null_mut(),
            job,
        }));
        let mut head = self.overflow.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self.overflow.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Dequeues and dispatches one completion. Returns false on stop or on
    /// an empty queue in non-waiting mode.
    fn try_process_one_event(&self, wait: bool) -> Result<bool, Error> {
        if self.is_stop_requested() {
            return Ok(false);
        }

        loop {
            self.retry_overflow();

            let timeout = if wait { None } else { Some(Duration::ZERO) };
            let Some(completion) = self.reactor.poll(timeout)? else {
                return Ok(false);
            };

            match completion.key & KEY_KIND_MASK {
                KEY_JOB => {
                    let job =
                        *unsafe { Box::from_raw((completion.key & !KEY_KIND_MASK) as *mut Job) };
                    job.run();
                    return Ok(true);
                }
                KEY_OP => {
                    let header = unsafe {
                        Arc::from_raw((completion.key & !KEY_KIND_MASK) as *const OpHeader)
                    };
                    header.complete(completion.result, completion.bytes);
                    return Ok(true);
                }
                _ => {
                    // Plain wake-up: either a stop signal or a stale wake
                    // from a previous stop/reset cycle.
                    if self.is_stop_requested() {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

impl<R: Reactor> Executor for IoInner<R> {
    fn enqueue(&self, job: Job) {
        self.post_job(job);
    }
}

impl<R: Reactor> Drop for IoInner<R> {
    fn drop(&mut self) {
        debug_assert!(
            self.overflow.load(Ordering::Relaxed).is_null(),
            "io service dropped with overflowed work"
        );
        let mut node = *self.overflow.get_mut();
        while !node.is_null() {
            let owned = unsafe { Box::from_raw(node) };
            node = owned.next;
        }
    }
}

/// A reactor-backed scheduler whose event loop any number of threads may
/// drive.
///
/// Threads enter the loop through one of the `process_*` methods; `stop()`
/// makes every one of them return. The service tracks outstanding work
/// through [`notify_work_started`](IoService::notify_work_started) /
/// [`notify_work_finished`](IoService::notify_work_finished): when the count
/// drops to zero the loop stops itself.
///
/// # Example
///
///```
/// use subito::io::IoService;
///
/// let service = IoService::local();
/// let task = service.spawn(async { 2 + 3 });
/// // Drive the loop until the spawned task stops it.
/// service.notify_work_started();
/// let service2 = &service;
/// std::thread::scope(|scope| {
///     scope.spawn(move || {
///         service2.process_events().unwrap();
///     });
///     let five = subito::sync_wait(task).unwrap();
///     assert_eq!(five, 5);
///     service2.notify_work_finished();
/// });
///```
pub struct IoService<R: Reactor = LocalReactor> {
    inner: Arc<IoInner<R>>,
}

impl IoService<LocalReactor> {
    /// A service over the in-process reactor.
    pub fn local() -> Self {
        Self::new(LocalReactor::new())
    }
}

impl<R: Reactor> IoService<R> {
    pub fn new(reactor: R) -> Self {
        Self {
            inner: Arc::new(IoInner {
                reactor,
                thread_state: AtomicUsize::new(0),
                work_count: AtomicUsize::new(0),
                overflow: AtomicPtr::new(ptr::null_mut()),
                timer: OnceLock::new(),
            }),
        }
    }

    pub fn reactor(&self) -> &R {
        &self.inner.reactor
    }

    /// Processes events until the service is stopped. Returns the number of
    /// events handled on this thread.
    pub fn process_events(&self) -> Result<u64, Error> {
        self.run_loop(true, u64::MAX)
    }

    /// Processes the events already queued, then returns without blocking.
    pub fn process_pending_events(&self) -> Result<u64, Error> {
        self.run_loop(false, u64::MAX)
    }

    /// Blocks for one event.
    pub fn process_one_event(&self) -> Result<u64, Error> {
        self.run_loop(true, 1)
    }

    /// Processes one already-queued event, if any.
    pub fn process_one_pending_event(&self) -> Result<u64, Error> {
        self.run_loop(false, 1)
    }

    fn run_loop(&self, wait: bool, limit: u64) -> Result<u64, Error> {
        let mut handled = 0;
        if !self.inner.try_enter_event_loop() {
            return Ok(0);
        }
        let result = (|| {
            while handled < limit && self.inner.try_process_one_event(wait)? {
                handled += 1;
            }
            Ok(handled)
        })();
        self.inner.exit_event_loop();
        result
    }

    /// Makes every thread inside the event loop return. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.is_stop_requested()
    }

    /// Clears a previous stop so the loop can be entered again.
    ///
    /// Must only be called while no thread is inside the loop.
    pub fn reset(&self) {
        let old = self.inner.thread_state.fetch_and(!STOP_FLAG, Ordering::Relaxed);
        debug_assert_eq!(old, STOP_FLAG, "reset() while the event loop is active");
    }

    /// Registers one unit of outstanding work keeping the loop alive.
    pub fn notify_work_started(&self) {
        self.inner.work_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases one unit of work; the last release stops the service.
    pub fn notify_work_finished(&self) {
        if self.inner.work_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            debug!("work count hit zero, stopping io service");
            self.stop();
        }
    }

    /// An awaitable that resumes the caller on an event-loop thread.
    pub fn schedule(&self) -> ScheduleFuture {
        ScheduleFuture::new(self.inner.clone())
    }

    /// An awaitable that resumes the caller on an event-loop thread after
    /// `delay` has elapsed.
    pub fn schedule_after(&self, delay: Duration) -> TimedScheduleFuture<R> {
        self.schedule_after_ct(delay, CancellationToken::none())
    }

    /// Like [`schedule_after`](IoService::schedule_after), but the wait can
    /// be cancelled through `token`, failing the await with
    /// [`Error::Cancelled`].
    pub fn schedule_after_ct(
        &self,
        delay: Duration,
        token: CancellationToken,
    ) -> TimedScheduleFuture<R> {
        TimedScheduleFuture::new(self.inner.clone(), delay, token)
    }

    /// Starts `future` on the event loop's threads immediately.
    pub fn spawn<F>(&self, future: F) -> EagerTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_on(self.inner.clone(), future)
    }

    #[cfg(test)]
    pub(crate) fn timer_started(&self) -> bool {
        self.inner.timer.get().is_some()
    }

    /// Submits a cancellable reactor operation.
    ///
    /// `submit` is handed the reactor and the completion key to pass to one
    /// of the submission methods; it reports whether the operation completed
    /// synchronously. The cancellation callback is installed before `submit`
    /// runs, so a racing `request_cancellation` either prevents the
    /// submission or cancels it through the reactor.
    pub fn submit<S>(&self, submit: S, token: CancellationToken) -> IoOperation<R, S>
    where
        S: FnOnce(&R, usize) -> Result<SubmitOutcome, Error>,
    {
        IoOperation::new(self.inner.clone(), submit, token)
    }
}

impl<R: Reactor> Scheduler for IoService<R> {
    type Schedule = ScheduleFuture;

    fn schedule(&self) -> ScheduleFuture {
        IoService::schedule(self)
    }
}

impl<R: Reactor> Drop for IoService<R> {
    fn drop(&mut self) {
        if let Some(control) = self.inner.timer.get() {
            control.shutdown();
        }
        debug_assert!(
            self.inner.thread_state.load(Ordering::Relaxed) < ACTIVE_INC,
            "io service dropped while threads are inside the event loop"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Spawned work runs on an event-loop thread and stops the loop when the
    /// work count drains
    #[test]
    fn test_spawn_and_drain() {
        let service = IoService::local();
        service.notify_work_started();

        let loop_thread_task = service.spawn(async { thread::current().id() });

        thread::scope(|scope| {
            let svc = &service;
            scope.spawn(move || {
                svc.process_events().unwrap();
            });

            let loop_thread = sync_wait(loop_thread_task).unwrap();
            assert_ne!(loop_thread, thread::current().id());
            svc.notify_work_finished();
        });
    }

    /// schedule() resumes exactly once per await
    #[test]
    fn test_schedule_resumes_once() {
        let service = IoService::local();
        service.notify_work_started();
        let resumes = Arc::new(AtomicUsize::new(0));

        let task = {
            let resumes = resumes.clone();
            let schedule = service.schedule();
            async move {
                schedule.await;
                resumes.fetch_add(1, Ordering::SeqCst);
            }
        };

        thread::scope(|scope| {
            let svc = &service;
            scope.spawn(move || {
                svc.process_events().unwrap();
            });
            sync_wait(task);
            svc.notify_work_finished();
        });
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    /// Multiple threads can drive the same loop
    #[test]
    fn test_multi_threaded_loop() {
        let service = IoService::local();
        service.notify_work_started();
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let counter = counter.clone();
                service.spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::scope(|scope| {
            let svc = &service;
            for _ in 0..3 {
                scope.spawn(move || {
                    svc.process_events().unwrap();
                });
            }
            for task in tasks {
                sync_wait(task).unwrap();
            }
            svc.notify_work_finished();
        });
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    /// stop() releases a blocked loop thread; reset() re-arms the loop
    #[test]
    fn test_stop_and_reset() {
        let service = IoService::local();

        thread::scope(|scope| {
            let svc = &service;
            let blocked = scope.spawn(move || svc.process_events().unwrap());
            thread::sleep(Duration::from_millis(10));
            svc.stop();
            blocked.join().unwrap();
        });

        assert!(service.is_stop_requested());
        service.reset();
        assert!(!service.is_stop_requested());
        // The loop is usable again.
        assert_eq!(service.process_pending_events().unwrap(), 0);
    }
}
