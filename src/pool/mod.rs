//! Work-stealing static thread pool.
//!
//! A fixed set of workers, each owning a LIFO deque of jobs, plus one global
//! injector for external enqueues. A worker looks for work in cost order:
//!
//!```text
//!  local deque ─▶ global injector (batch) ─▶ steal from other workers
//!       │
//!       ▼ nothing anywhere
//!  bounded spin ─▶ publish intent to sleep ─▶ re-check all queues ─▶ block
//!```
//!
//! ## Sleep/wake arbitration
//!
//! The race between "worker goes to sleep" and "enqueuer posts work" is
//! resolved with a seq-cst sleeping count: a worker increments it after
//! setting its own sleeping flag and re-checks every queue before blocking;
//! an enqueuer that decrements the count from non-zero owns the obligation to
//! wake exactly one sleeping worker. A worker that finds work during the
//! re-check takes itself back out of the count, preferring to wake itself
//! over a context switch.
//!
//! Scheduling makes no affinity or cross-worker FIFO guarantees: a resumed
//! computation runs on whichever worker picks it up.

use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::scheduler::{Executor, Runnable, ScheduleFuture, Scheduler};
use crate::task::{EagerTask, spawn_on};

type Job = Arc<dyn Runnable>;

/// Spin rounds before a worker starts the sleep protocol.
const SPIN_ROUNDS: u32 = 30;

/// Auto-reset wake event for one worker.
struct WakeEvent {
    set: Mutex<bool>,
    condvar: Condvar,
}

impl WakeEvent {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.condvar.notify_one();
    }

    fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.condvar.wait(&mut set);
        }
        *set = false;
    }
}

struct WorkerState {
    stealer: Stealer<Job>,
    sleeping: AtomicBool,
    wake: WakeEvent,
}

impl WorkerState {
    /// Claims and wakes this worker if it is (about to go) sleeping.
    fn try_wake_up(&self) -> bool {
        if self.sleeping.load(Ordering::SeqCst) && self.sleeping.swap(false, Ordering::SeqCst) {
            self.wake.set();
            true
        } else {
            false
        }
    }
}

struct PoolInner {
    injector: Injector<Job>,
    workers: Box<[WorkerState]>,
    /// Count of workers that have published an intent to sleep.
    sleeping_count: AtomicUsize,
    stop: AtomicBool,
}

thread_local! {
    /// Set while a worker loop runs on this thread: (pool identity, local
    /// deque). Lets same-pool enqueues skip the global injector.
    static CURRENT_WORKER: Cell<Option<(usize, *const Worker<Job>)>> = const { Cell::new(None) };
}

impl PoolInner {
    fn identity(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as *const () as usize
    }

    /// True if any queue (other than `except`'s local deque) may hold work.
    /// Read-only, approximate; used in the spin phase to avoid cache-line
    /// writes while many workers poll.
    fn has_queued_work(&self, except: usize) -> bool {
        if !self.injector.is_empty() {
            return true;
        }
        self.workers
            .iter()
            .enumerate()
            .any(|(i, w)| i != except && !w.stealer.is_empty())
    }

    /// Global dequeue then steal sweep. Steals are batched into `local` so a
    /// follow-up pop is cheap.
    fn take_remote(&self, index: usize, local: &Worker<Job>) -> Option<Job> {
        loop {
            match self.injector.steal_batch_and_pop(local) {
                crossbeam_deque::Steal::Success(job) => return Some(job),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }

        loop {
            let mut retry = false;
            for (i, state) in self.workers.iter().enumerate() {
                if i == index {
                    continue;
                }
                match state.stealer.steal_batch_and_pop(local) {
                    crossbeam_deque::Steal::Success(job) => {
                        trace!(victim = i, thief = index, "stole work");
                        return Some(job);
                    }
                    crossbeam_deque::Steal::Retry => retry = true,
                    crossbeam_deque::Steal::Empty => {}
                }
            }
            if !retry {
                return None;
            }
        }
    }

    /// The enqueuer side of the wake arbitration: claim one sleeper, then
    /// find and wake it.
    fn wake_one(&self) {
        // Seq-cst read: either we observe the sleeper's count increment, or
        // the sleeper's re-check observes our enqueue.
        let mut count = self.sleeping_count.load(Ordering::SeqCst);
        loop {
            if count == 0 {
                return;
            }
            match self.sleeping_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::AcqRel,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }

        // Having claimed the obligation, we are guaranteed to find a worker
        // to wake, though maybe not in one pass (workers may be waking
        // themselves concurrently).
        loop {
            for state in self.workers.iter() {
                if state.try_wake_up() {
                    return;
                }
            }
        }
    }

    /// A worker that found work after declaring intent to sleep takes itself
    /// back out of the sleeping count (or, if an enqueuer already claimed it,
    /// wakes the worker that should have been woken instead).
    fn clear_intent_to_sleep(&self, index: usize) {
        let mut count = self.sleeping_count.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                // An enqueuer claimed us; nothing left to clear.
                return;
            }
            match self.sleeping_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }

        if !self.workers[index].try_wake_up() {
            for (i, state) in self.workers.iter().enumerate() {
                if i != index && state.try_wake_up() {
                    return;
                }
            }
        }
    }

    fn run_worker(self: &Arc<Self>, index: usize, local: Worker<Job>) {
        CURRENT_WORKER.with(|current| {
            current.set(Some((self.identity(), &local as *const Worker<Job>)))
        });
        debug!(worker = index, "pool worker started");

        'outer: loop {
            // Normal processing: drain local, then remote.
            loop {
                let job = local.pop().or_else(|| self.take_remote(index, &local));
                match job {
                    Some(job) => job.run(),
                    None => break,
                }
            }

            // Out of work; spin briefly before sleeping so a fast enqueue
            // does not pay a futex round-trip.
            loop {
                let backoff = Backoff::new();
                for _ in 0..SPIN_ROUNDS {
                    if self.stop.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    backoff.spin();
                    if self.has_queued_work(index)
                        && let Some(job) = self.take_remote(index, &local)
                    {
                        job.run();
                        continue 'outer;
                    }
                }

                // Publish intent to sleep: own flag first, then the count.
                self.workers[index].sleeping.store(true, Ordering::SeqCst);
                self.sleeping_count.fetch_add(1, Ordering::SeqCst);

                // Re-check everything: an enqueue that raced with the
                // publication above must be found here, because the enqueuer
                // may have read a zero sleeping count.
                if self.has_queued_work(index) {
                    if let Some(job) = self.take_remote(index, &local) {
                        self.clear_intent_to_sleep(index);
                        job.run();
                        continue 'outer;
                    }
                }

                if self.stop.load(Ordering::Relaxed) {
                    break 'outer;
                }

                trace!(worker = index, "worker sleeping");
                self.workers[index].wake.wait();
                continue 'outer;
            }
        }

        CURRENT_WORKER.with(|current| current.set(None));
        debug!(worker = index, "pool worker stopped");
    }
}

impl Executor for PoolInner {
    fn enqueue(&self, job: Job) {
        let used_local = CURRENT_WORKER.with(|current| match current.get() {
            Some((pool, local)) if pool == (self as *const PoolInner as *const () as usize) => {
                // SAFETY: the pointer was set by this thread's running worker
                // loop and stays valid for its duration.
                unsafe { (*local).push(job.clone()) };
                true
            }
            _ => false,
        });
        if !used_local {
            self.injector.push(job);
        }
        self.wake_one();
    }
}

/// A fixed-size pool of worker threads executing spawned futures and
/// [`schedule()`](ThreadPool::schedule) hops.
///
/// Dropping the pool latches the stop flag, wakes every worker and joins
/// them. Callers are responsible for awaiting their tasks first; queued work
/// is asserted drained in debug builds.
///
/// # Example
///
///```
/// use subito::pool::ThreadPool;
/// use subito::combinator::sync_wait;
///
/// let pool = ThreadPool::new();
/// let doubled = pool.spawn(async { 21 * 2 });
/// assert_eq!(sync_wait(doubled).unwrap(), 42);
///```
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// One worker per available hardware thread.
    pub fn new() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_threads(threads)
    }

    pub fn with_threads(count: usize) -> Self {
        let count = count.max(1);

        let locals: Vec<Worker<Job>> = (0..count).map(|_| Worker::new_lifo()).collect();
        let workers = locals
            .iter()
            .map(|w| WorkerState {
                stealer: w.stealer(),
                sleeping: AtomicBool::new(false),
                wake: WakeEvent::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(PoolInner {
            injector: Injector::new(),
            workers,
            sleeping_count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let threads = locals
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("subito-worker-{index}"))
                    .spawn(move || inner.run_worker(index, local))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self { inner, threads }
    }

    pub fn thread_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Starts `future` on the pool immediately, returning its join handle.
    pub fn spawn<F>(&self, future: F) -> EagerTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_on(self.inner.clone(), future)
    }

    /// An awaitable that resumes the caller on a pool worker.
    pub fn schedule(&self) -> ScheduleFuture {
        ScheduleFuture::new(self.inner.clone())
    }

    /// A cheap clonable handle implementing [`Scheduler`].
    pub fn scheduler(&self) -> PoolScheduler {
        PoolScheduler {
            inner: self.inner.clone(),
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadPool {
    type Schedule = ScheduleFuture;

    fn schedule(&self) -> ScheduleFuture {
        ThreadPool::schedule(self)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        for state in self.inner.workers.iter() {
            state.wake.set();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug_assert!(
            self.inner.injector.is_empty(),
            "thread pool dropped with queued work"
        );
    }
}

/// Clonable [`Scheduler`] handle detached from the pool's lifetime.
#[derive(Clone)]
pub struct PoolScheduler {
    inner: Arc<PoolInner>,
}

impl Scheduler for PoolScheduler {
    type Schedule = ScheduleFuture;

    fn schedule(&self) -> ScheduleFuture {
        ScheduleFuture::new(self.inner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    /// schedule() resumes the caller on a worker thread
    #[test]
    fn test_schedule_hops_to_worker() {
        let pool = ThreadPool::with_threads(2);
        let caller = thread::current().id();
        let resumed_on = sync_wait(async {
            pool.schedule().await;
            thread::current().id()
        });
        assert_ne!(resumed_on, caller);
    }

    /// Many concurrent tasks all complete
    #[test]
    fn test_many_tasks() {
        let pool = ThreadPool::with_threads(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..500)
            .map(|_| {
                let counter = counter.clone();
                pool.spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            sync_wait(task).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 500);
    }

    /// Work spreads across more than one worker
    #[test]
    fn test_work_distribution() {
        let pool = ThreadPool::with_threads(4);

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                pool.spawn(async {
                    // Enough work that a single worker cannot finish the
                    // whole batch before others wake.
                    std::thread::sleep(Duration::from_micros(100));
                    thread::current().id()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            seen.insert(sync_wait(task).unwrap());
        }
        assert!(seen.len() > 1, "all work ran on a single worker");
    }

    /// Tasks can reschedule themselves repeatedly without starving others
    #[test]
    fn test_yield_storm() {
        let pool = ThreadPool::with_threads(2);
        let scheduler = pool.scheduler();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let scheduler = scheduler.clone();
                pool.spawn(async move {
                    for _ in 0..100 {
                        scheduler.schedule().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            sync_wait(task).unwrap();
        }
    }

    /// Workers exit in bounded time once the pool is dropped
    #[test]
    fn test_shutdown_terminates() {
        let start = Instant::now();
        {
            let pool = ThreadPool::with_threads(4);
            let task = pool.spawn(async { 1 + 1 });
            assert_eq!(sync_wait(task).unwrap(), 2);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
