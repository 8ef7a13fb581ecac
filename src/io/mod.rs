//! Reactor-backed I/O service: event loop, timers, cancellable operations.
//!
//! The service wraps a platform [`Reactor`] (a completion queue) and runs an
//! event loop that any number of threads may enter. Three kinds of traffic
//! flow through the queue:
//!
//! - plain wake-ups (stop signals),
//! - scheduled jobs ([`IoService::schedule`] hops and spawned task polls),
//! - operation completions resolved against a [cancellable state
//!   machine](IoOperation).
//!
//! Timers live on a lazily started timer thread that feeds elapsed waits
//! back through the same queue, so every resumption happens on an event-loop
//! thread.

mod operation;
mod reactor;
mod service;
mod timer;

pub use operation::{IoOperation, SubmitOutcome};
pub use reactor::{
    Buffer, BufferMut, CANCELLED_RESULT, Completion, LocalReactor, RawHandle, Reactor,
};
pub use service::IoService;
pub use timer::TimedScheduleFuture;
