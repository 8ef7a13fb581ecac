//! Blocking bridge from synchronous code into the async world.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, Thread};

use futures::task::{ArcWake, waker};

/// One parked OS thread waiting for a wake.
struct ThreadUnparker {
    thread: Thread,
    notified: AtomicBool,
}

impl ArcWake for ThreadUnparker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // release-store: the unparked thread's acquire-swap observes every
        // write made before the wake.
        arc_self.notified.store(true, Ordering::Release);
        arc_self.thread.unpark();
    }
}

/// Drives a future to completion on the calling thread, blocking it while the
/// future is suspended.
///
/// The future is polled in place; whenever it returns `Pending` the thread
/// parks until the registered waker fires. Panics from the future propagate
/// to the caller.
///
/// This is the entry point used by synchronous test and `main` code; inside
/// an executor-driven task prefer awaiting directly.
///
/// # Example
///
///```
/// use subito::sync::AsyncManualResetEvent;
/// use subito::combinator::sync_wait;
///
/// let event = AsyncManualResetEvent::new(true);
/// sync_wait(event.wait());
///```
pub fn sync_wait<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);

    // A fresh unparker per call: a cached thread-local one would let a nested
    // sync_wait consume the outer call's wake token.
    let unparker = Arc::new(ThreadUnparker {
        thread: thread::current(),
        notified: AtomicBool::new(false),
    });
    let waker = waker(unparker.clone());
    let mut cx = Context::from_waker(&waker);

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => {
                // Consume the token before parking; a wake that landed between
                // the poll and the swap skips the park entirely.
                while !unparker.notified.swap(false, Ordering::Acquire) {
                    thread::park();
                }
            }
        }
    }
}
