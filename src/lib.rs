//! Coroutine runtime primitives
//!
//! A self-contained toolkit for cooperative concurrency: one-shot and shared
//! result types, generators and async streams, lock-free synchronization
//! primitives, disruptor-style sequencers, a work-stealing thread pool and a
//! reactor-backed I/O service. Everything composes through plain
//! [`Future`](std::future::Future)s; no external runtime is required or
//! assumed.
//!
//! ## Layout
//!
//!```text
//!  task/        one-shot results: Task, EagerTask, SharedTask,
//!               Generator, AsyncGenerator, AsyncStream
//!  combinator/  sync_wait, when_all, when_all_ready, fmap,
//!               schedule_on, resume_on
//!  sync/        async events and mutex
//!  cancel/      cancellation source / token / registration
//!  seq/         sequence barrier and single/multi producer sequencers
//!  pool/        work-stealing static thread pool
//!  io/          reactor seam, event loop, timers, cancellable operations
//!  net/         IPv4/IPv6 addresses and endpoints
//!```
//!
//! ## Suspension model
//!
//! Every primitive keeps a fast path that completes without suspending, and a
//! slow path that parks the caller on a lock-free waiter list. Waiters are
//! resumed through their [`Waker`](std::task::Waker) by whichever thread
//! observes the releasing transition (a `set()`, an `unlock()`, a `publish()`,
//! an I/O completion). Each waiter resumes at most once; primitives that hand
//! a resource to a waiter (the mutex, the auto-reset event) detect waiters
//! that were dropped mid-wait and pass the grant along instead of losing it.
//!
//! ## Example
//!
//!```
//! use subito::combinator::sync_wait;
//! use subito::pool::ThreadPool;
//!
//! let pool = ThreadPool::new();
//! let task = pool.spawn(async { 2 + 2 });
//! assert_eq!(sync_wait(task).unwrap(), 4);
//!```

pub mod cancel;
pub mod combinator;
pub mod error;
pub mod io;
pub mod net;
pub mod pool;
pub mod scheduler;
pub mod seq;
pub mod sync;
pub mod task;

pub(crate) mod waiter;

pub use combinator::sync_wait;
pub use error::Error;
pub use scheduler::{Executor, Runnable, ScheduleFuture, Scheduler};
