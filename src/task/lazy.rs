//! Lazy one-shot task.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A one-shot computation that starts on first await.
///
/// Wraps a future together with a result slot, which makes two access
/// patterns possible that a bare future lacks:
///
/// - [`when_ready`](Task::when_ready) drives the body to completion without
///   consuming the result, so the value can still be awaited afterwards;
/// - [`is_ready`](Task::is_ready) is a non-blocking completion probe.
///
/// Exactly one owner may await it; the body runs at most once. Dropping the
/// task before awaiting drops the captured future without ever running it.
///
/// # Example
///
///```
/// use subito::task::Task;
/// use subito::combinator::sync_wait;
///
/// let task = Task::new(async { 21 * 2 });
/// assert!(!task.is_ready());
/// assert_eq!(sync_wait(task), 42);
///```
pub struct Task<F: Future> {
    future: Option<F>,
    result: Option<F::Output>,
}

impl<F: Future> Task<F> {
    pub fn new(future: F) -> Self {
        Self {
            future: Some(future),
            result: None,
        }
    }

    /// True once the body has run to completion and the result is stored.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.result.is_some()
    }

    /// Drives the body to completion without consuming the result.
    ///
    /// After this completes, awaiting the task yields the stored value
    /// without suspending.
    pub fn when_ready(self: Pin<&mut Self>) -> WhenReady<'_, F> {
        WhenReady { task: self }
    }

    /// Polls the body once, stashing the value in the result slot.
    fn drive(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: `future` is structurally pinned; it is never moved out,
        // only dropped in place by the `take()` below.
        let this = unsafe { self.get_unchecked_mut() };
        if this.result.is_some() {
            return Poll::Ready(());
        }
        let future = this
            .future
            .as_mut()
            .expect("task polled after its result was consumed");
        let future = unsafe { Pin::new_unchecked(future) };
        match future.poll(cx) {
            Poll::Ready(value) => {
                this.result = Some(value);
                this.future = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F: Future> Future for Task<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.as_mut().drive(cx) {
            Poll::Ready(()) => {
                // SAFETY: `result` is not structurally pinned.
                let this = unsafe { self.get_unchecked_mut() };
                Poll::Ready(
                    this.result
                        .take()
                        .expect("task polled after its result was consumed"),
                )
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Task::when_ready`].
#[must_use = "futures do nothing unless polled"]
pub struct WhenReady<'a, F: Future> {
    task: Pin<&'a mut Task<F>>,
}

impl<F: Future> Future for WhenReady<'_, F> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task.as_mut().drive(cx)
    }
}

impl<F: Future> Unpin for WhenReady<'_, F> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use std::pin::pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// The body does not run until the task is awaited
    #[test]
    fn test_lazy_start() {
        let started = Arc::new(AtomicBool::new(false));
        let task = {
            let started = started.clone();
            Task::new(async move {
                started.store(true, Ordering::SeqCst);
                5
            })
        };
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(sync_wait(task), 5);
        assert!(started.load(Ordering::SeqCst));
    }

    /// Dropping an unawaited task never runs the body but drops its captures
    #[test]
    fn test_drop_without_await() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let started = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let task = {
            let started = started.clone();
            let guard = SetOnDrop(dropped.clone());
            Task::new(async move {
                let _guard = guard;
                started.store(true, Ordering::SeqCst);
            })
        };
        drop(task);
        assert!(!started.load(Ordering::SeqCst));
        assert!(dropped.load(Ordering::SeqCst));
    }

    /// when_ready() completes the body and leaves the result awaitable
    #[test]
    fn test_when_ready_then_await() {
        sync_wait(async {
            let mut task = pin!(Task::new(async { String::from("done") }));
            task.as_mut().when_ready().await;
            assert!(task.is_ready());
            assert_eq!(task.await, "done");
        });
    }
}
