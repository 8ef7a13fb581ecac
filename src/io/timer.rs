//! Timer thread and timed schedule operations.
//!
//! The first `schedule_after` lazily starts one timer thread per service.
//! Newly queued timers arrive over a lock-free stack; the thread ingests
//! them into a due-time heap and sleeps on a deadline condvar until the
//! earliest entry is due. Elapsed and cancelled timers are not resumed on
//! the timer thread itself: each is handed to the service's completion queue
//! so the awaiter resumes on an event-loop thread.

use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::cancel::{CancellationRegistration, CancellationToken};
use crate::error::Error;
use crate::scheduler::{Executor, Runnable};

use super::reactor::Reactor;
use super::service::IoInner;

const PENDING: u8 = 0;
const ELAPSED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared state of one timed schedule operation.
struct TimerOp {
    state: AtomicU8,
    waker: AtomicWaker,
    token: CancellationToken,
}

impl TimerOp {
    fn resolve(self: &Arc<Self>, outcome: u8, executor: &Weak<dyn Executor>) {
        self.state.store(outcome, Ordering::Release);
        match executor.upgrade() {
            // Hop through the service queue so the awaiter resumes on an
            // event-loop thread.
            Some(executor) => executor.enqueue(self.clone()),
            // Service already gone; wake in place so the awaiter can
            // observe the outcome.
            None => self.waker.wake(),
        }
    }
}

impl Runnable for TimerOp {
    fn run(self: Arc<Self>) {
        self.waker.wake();
    }
}

struct TimerNode {
    next: *mut TimerNode,
    due: Instant,
    op: Arc<TimerOp>,
}

/// Heap entry; the ordering is inverted so the earliest due time pops first.
struct HeapEntry {
    due: Instant,
    op: Arc<TimerOp>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so BinaryHeap pops the earliest due time first.
        other.due.cmp(&self.due)
    }
}

struct TimerShared {
    /// Lock-free stack of newly queued timers.
    new_timers: AtomicPtr<TimerNode>,
    cancel_scan_requested: AtomicBool,
    shutdown: AtomicBool,
    /// Wake signal for the timer thread; also carries the deadline sleep.
    signal: Mutex<bool>,
    signalled: Condvar,
    executor: Weak<dyn Executor>,
}

impl TimerShared {
    fn wake_timer_thread(&self) {
        let mut signalled = self.signal.lock();
        *signalled = true;
        drop(signalled);
        self.signalled.notify_one();
    }

    fn push(&self, due: Instant, op: Arc<TimerOp>) {
        let node = Box::into_raw(Box::new(TimerNode {
            next: ptr::null_mut(),
            due,
            op,
        }));
        let mut head = self.new_timers.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self.new_timers.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.wake_timer_thread();
    }

    /// Tells the timer thread that some queued timer had cancellation
    /// requested. Cheap and idempotent until the next scan.
    fn request_cancel_scan(&self) {
        if !self.cancel_scan_requested.swap(true, Ordering::Release) {
            self.wake_timer_thread();
        }
    }

    fn run(&self) {
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
        debug!("timer thread started");

        while !self.shutdown.load(Ordering::Acquire) {
            // Sleep until signalled or until the earliest timer is due.
            {
                let mut signalled = self.signal.lock();
                if !*signalled {
                    match heap.peek().map(|entry| entry.due) {
                        Some(deadline) => {
                            let _ = self.signalled.wait_until(&mut signalled, deadline);
                        }
                        None => self.signalled.wait(&mut signalled),
                    }
                }
                *signalled = false;
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            // Remove cancelled timers with a linear pass, resolving each.
            if self.cancel_scan_requested.swap(false, Ordering::Acquire) {
                let mut kept = BinaryHeap::with_capacity(heap.len());
                for entry in heap.drain() {
                    if entry.op.token.is_cancellation_requested() {
                        entry.op.resolve(CANCELLED, &self.executor);
                    } else {
                        kept.push(entry);
                    }
                }
                heap = kept;
            }

            // Ingest newly queued timers.
            let mut node = self.new_timers.swap(ptr::null_mut(), Ordering::Acquire);
            while !node.is_null() {
                let owned = unsafe { Box::from_raw(node) };
                node = owned.next;
                if owned.op.token.is_cancellation_requested() {
                    owned.op.resolve(CANCELLED, &self.executor);
                } else {
                    heap.push(HeapEntry {
                        due: owned.due,
                        op: owned.op,
                    });
                }
            }

            // Pop everything that is due.
            let now = Instant::now();
            while heap.peek().is_some_and(|entry| entry.due <= now) {
                let entry = heap.pop().unwrap();
                entry.op.resolve(ELAPSED, &self.executor);
            }
        }

        // Shutting down: resolve whatever is left as cancelled so no awaiter
        // hangs.
        for entry in heap.drain() {
            entry.op.resolve(CANCELLED, &self.executor);
        }
        let mut node = self.new_timers.swap(ptr::null_mut(), Ordering::Acquire);
        while !node.is_null() {
            let owned = unsafe { Box::from_raw(node) };
            node = owned.next;
            owned.op.resolve(CANCELLED, &self.executor);
        }
        debug!("timer thread stopped");
    }
}

/// Owner of the lazily started timer thread.
pub(super) struct TimerControl {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerControl {
    fn start(executor: Weak<dyn Executor>) -> Self {
        let shared = Arc::new(TimerShared {
            new_timers: AtomicPtr::new(ptr::null_mut()),
            cancel_scan_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            signal: Mutex::new(false),
            signalled: Condvar::new(),
            executor,
        });
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("subito-timer".into())
                .spawn(move || shared.run())
                .expect("failed to spawn timer thread")
        };
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub(super) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_timer_thread();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Future returned by [`IoService::schedule_after`](super::IoService::schedule_after).
///
/// Resolves no earlier than the requested delay, on an event-loop thread.
/// Cancelling the token fails the await with [`Error::Cancelled`] promptly,
/// without waiting out the delay.
#[must_use = "futures do nothing unless polled"]
pub struct TimedScheduleFuture<R: Reactor> {
    service: Arc<IoInner<R>>,
    delay: Duration,
    token: CancellationToken,
    op: Option<Arc<TimerOp>>,
    registration: Option<CancellationRegistration>,
}

impl<R: Reactor> TimedScheduleFuture<R> {
    pub(super) fn new(service: Arc<IoInner<R>>, delay: Duration, token: CancellationToken) -> Self {
        Self {
            service,
            delay,
            token,
            op: None,
            registration: None,
        }
    }
}

impl<R: Reactor> Unpin for TimedScheduleFuture<R> {}

impl<R: Reactor> Future for TimedScheduleFuture<R> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Some(op) = &this.op {
            op.waker.register(cx.waker());
            return match op.state.load(Ordering::Acquire) {
                ELAPSED => {
                    this.registration = None;
                    Poll::Ready(Ok(()))
                }
                CANCELLED => {
                    this.registration = None;
                    Poll::Ready(Err(Error::Cancelled))
                }
                _ => Poll::Pending,
            };
        }

        this.token.check()?;

        let control = this.service.timer.get_or_init(|| {
            // Weak so the timer thread never keeps the service alive.
            let executor: Arc<dyn Executor> = this.service.clone();
            let executor: Weak<dyn Executor> = Arc::downgrade(&executor);
            TimerControl::start(executor)
        });

        let op = Arc::new(TimerOp {
            state: AtomicU8::new(PENDING),
            waker: AtomicWaker::new(),
            token: this.token.clone(),
        });
        op.waker.register(cx.waker());

        // The cancellation hook only nudges the timer thread; the thread does
        // the actual removal and resolution.
        let registration = {
            let shared = control.shared.clone();
            this.token.register(move || shared.request_cancel_scan())
        };
        this.registration = Some(registration);

        control.shared.push(Instant::now() + this.delay, op.clone());
        this.op = Some(op);

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::combinator::{sync_wait, when_all_ready};
    use crate::io::IoService;
    use std::thread;

    fn with_loop<T: Send>(service: &IoService, body: impl FnOnce() -> T + Send) -> T {
        service.notify_work_started();
        thread::scope(|scope| {
            scope.spawn(|| {
                service.process_events().unwrap();
            });
            let out = body();
            service.notify_work_finished();
            out
        })
    }

    /// Timers complete no earlier than their nominal delay
    #[test]
    fn test_minimum_delay() {
        let service = IoService::local();
        let start = Instant::now();
        let waits = when_all_ready((
            service.schedule_after(Duration::from_millis(100)),
            service.schedule_after(Duration::from_millis(120)),
            service.schedule_after(Duration::from_millis(50)),
        ));

        let (a, b, c) = with_loop(&service, || sync_wait(waits));
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    /// Out-of-order submission still fires the earliest timer first
    #[test]
    fn test_reordered_due_times() {
        let service = IoService::local();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let slow = {
            let order = order.clone();
            let wait = service.schedule_after(Duration::from_millis(80));
            async move {
                wait.await.unwrap();
                order.lock().push("slow");
            }
        };
        let fast = {
            let order = order.clone();
            let wait = service.schedule_after(Duration::from_millis(20));
            async move {
                wait.await.unwrap();
                order.lock().push("fast");
            }
        };

        with_loop(&service, || sync_wait(when_all_ready((slow, fast))));
        assert_eq!(*order.lock(), vec!["fast", "slow"]);
    }

    /// Cancelling a long timer fails the await promptly
    #[test]
    fn test_prompt_cancellation() {
        let service = IoService::local();
        let source = CancellationSource::new();
        let wait = service.schedule_after_ct(Duration::from_secs(20), source.token());

        let start = Instant::now();
        let result = with_loop(&service, || {
            let canceller = thread::spawn({
                let source = source.clone();
                move || {
                    thread::sleep(Duration::from_millis(20));
                    source.request_cancellation();
                }
            });
            let result = sync_wait(wait);
            canceller.join().unwrap();
            result
        });

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    /// A token cancelled before the first poll never reaches the timer thread
    #[test]
    fn test_cancelled_before_poll() {
        let service = IoService::local();
        let source = CancellationSource::new();
        source.request_cancellation();

        let wait = service.schedule_after_ct(Duration::from_secs(5), source.token());
        assert!(matches!(sync_wait(wait), Err(Error::Cancelled)));
        // No timer thread was ever started.
        assert!(!service.timer_started());
    }
}
