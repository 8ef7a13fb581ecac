//! Shared (multi-consumer) one-shot task.

use std::cell::UnsafeCell;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::error::Error;
use crate::waiter::{self, Waiter};

type Node = Waiter<()>;

/// Head sentinel: the body has not started; the first awaiter to observe this
/// becomes the driver.
#[inline]
fn not_started() -> *mut Node {
    ptr::without_provenance_mut(1)
}

/// Head sentinel: the result is available.
#[inline]
fn ready() -> *mut Node {
    ptr::without_provenance_mut(2)
}

/// How the body ended.
enum Outcome<T> {
    Value(T),
    /// The panic payload is handed to the first awaiter that claims it;
    /// later awaiters see a placeholder payload.
    Panicked(Mutex<Option<Box<dyn std::any::Any + Send>>>),
}

/// Dyn-erased core so `SharedTask<T>` does not name the future type.
trait SharedCore<T>: Send + Sync {
    /// Head-pointer word: `not_started()` / `ready()` / null (running, no
    /// waiters) / waiter-stack head (running).
    fn head(&self) -> &AtomicPtr<Node>;
    /// Polls the body. Caller must hold the driver role.
    fn drive(&self, cx: &mut Context<'_>) -> Poll<()>;
    /// Clones out the stored outcome. Only valid in the ready state.
    fn claim_outcome(&self) -> Result<T, Error>;
}

struct SharedInner<F: Future> {
    head: AtomicPtr<Node>,
    /// Owned by the current driver (the awaiter that won `not_started()` or
    /// inherited the role after a driver was dropped).
    future: UnsafeCell<Option<F>>,
    /// Written by the completing driver before the head swaps to `ready()`.
    outcome: UnsafeCell<Option<Outcome<F::Output>>>,
}

unsafe impl<F> Send for SharedInner<F>
where
    F: Future + Send,
    F::Output: Send + Sync,
{
}
unsafe impl<F> Sync for SharedInner<F>
where
    F: Future + Send,
    F::Output: Send + Sync,
{
}

impl<F> SharedCore<F::Output> for SharedInner<F>
where
    F: Future + Send,
    F::Output: Clone + Send + Sync,
{
    fn head(&self) -> &AtomicPtr<Node> {
        &self.head
    }

    fn drive(&self, cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: the driver role is exclusive; it was acquired through the
        // head CAS and is released only through the head swap below or
        // through an abandoning swap back to `not_started()`.
        let future = unsafe { &mut *self.future.get() };
        let Some(body) = future.as_mut() else {
            return Poll::Ready(());
        };
        // SAFETY: the body never moves out of its heap cell.
        let body = unsafe { Pin::new_unchecked(body) };

        let outcome = match catch_unwind(AssertUnwindSafe(|| body.poll(cx))) {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(value)) => Outcome::Value(value),
            Err(payload) => Outcome::Panicked(Mutex::new(Some(payload))),
        };

        unsafe {
            *future = None;
            *self.outcome.get() = Some(outcome);
        }

        // Publish, then resume every queued waiter. The swap's release makes
        // the outcome visible to waiters that observe `ready()`.
        let old = self.head.swap(ready(), Ordering::AcqRel);
        if !old.is_null() {
            debug_assert!(old != not_started() && old != ready());
            for node in unsafe { waiter::drain(old) } {
                let _ = node.fire();
            }
        }
        Poll::Ready(())
    }

    fn claim_outcome(&self) -> Result<F::Output, Error> {
        // SAFETY: `ready()` was observed with acquire ordering, and the
        // outcome is only written once, before that publication.
        let outcome = unsafe { (*self.outcome.get()).as_ref() };
        match outcome.expect("shared task marked ready without an outcome") {
            Outcome::Value(value) => Ok(value.clone()),
            Outcome::Panicked(payload) => Err(Error::Panic(
                payload
                    .lock()
                    .take()
                    .unwrap_or_else(|| Box::new("shared task panicked")),
            )),
        }
    }
}

/// A one-shot computation whose result every clone can await.
///
/// The body starts when the first clone is awaited (at most once, however
/// many clones race); each awaiter receives a clone of the value. If the
/// driving awaiter is dropped mid-flight, a queued awaiter silently inherits
/// the drive, so progress is never lost while any interested clone remains.
///
/// Queued waiters are resumed in LIFO order (most recently suspended first).
///
/// If the body panics, the first awaiter to observe the failure receives the
/// panic payload; the rest receive a placeholder [`Error::Panic`].
///
/// # Example
///
///```
/// use subito::task::SharedTask;
/// use subito::combinator::sync_wait;
///
/// let task = SharedTask::new(async { vec![1, 2, 3] });
/// let other = task.clone();
/// assert_eq!(sync_wait(task).unwrap(), vec![1, 2, 3]);
/// assert_eq!(sync_wait(other).unwrap(), vec![1, 2, 3]);
///```
pub struct SharedTask<T> {
    core: Arc<dyn SharedCore<T>>,
    node: Option<Arc<Node>>,
    is_driver: bool,
}

impl<T> SharedTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            core: Arc::new(SharedInner {
                head: AtomicPtr::new(not_started()),
                future: UnsafeCell::new(Some(future)),
                outcome: UnsafeCell::new(None),
            }),
            node: None,
            is_driver: false,
        }
    }
}

impl<T> SharedTask<T> {
    /// True once the body has completed and the result is shareable.
    pub fn is_ready(&self) -> bool {
        self.core.head().load(Ordering::Acquire) == ready()
    }
}

impl<T> Clone for SharedTask<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            node: None,
            is_driver: false,
        }
    }
}

impl<T> Unpin for SharedTask<T> {}

impl<T> Future for SharedTask<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.is_driver {
            return match this.core.drive(cx) {
                Poll::Ready(()) => {
                    this.is_driver = false;
                    Poll::Ready(this.core.claim_outcome())
                }
                Poll::Pending => Poll::Pending,
            };
        }

        if let Some(node) = &this.node {
            node.register(cx.waker());
            if !node.is_fired() {
                return Poll::Pending;
            }
            this.node = None;
            // Fired either because the result is ready, or because the
            // driver was dropped and we should try to take over; fall
            // through to the head loop either way.
        }

        let head_word = this.core.head();
        let mut head = head_word.load(Ordering::Acquire);
        loop {
            if head == ready() {
                return Poll::Ready(this.core.claim_outcome());
            }

            if head == not_started() {
                // Exactly one awaiter wins this transition and becomes
                // responsible for starting (and driving) the body.
                match head_word.compare_exchange_weak(
                    head,
                    ptr::null_mut(),
                    Ordering::Acquire,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        this.is_driver = true;
                        return match this.core.drive(cx) {
                            Poll::Ready(()) => {
                                this.is_driver = false;
                                Poll::Ready(this.core.claim_outcome())
                            }
                            Poll::Pending => Poll::Pending,
                        };
                    }
                    Err(current) => {
                        head = current;
                        continue;
                    }
                }
            }

            // Body is running under another driver: enqueue. Always a fresh
            // node; a fired one cannot be reused.
            let node = Waiter::new(());
            this.node = Some(node.clone());
            node.register(cx.waker());
            unsafe { node.set_next(head) };
            let raw = Waiter::into_raw(node);
            match head_word.compare_exchange_weak(head, raw, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return Poll::Pending,
                Err(current) => {
                    unsafe { drop(Waiter::from_raw(raw)) };
                    head = current;
                }
            }
        }
    }
}

impl<T> Drop for SharedTask<T> {
    fn drop(&mut self) {
        if let Some(node) = &self.node {
            let _ = node.abandon();
        }
        if self.is_driver {
            // Hand the drive back: any queued waiter is woken so one of them
            // can claim `not_started()` and continue the body.
            let old = self.core.head().swap(not_started(), Ordering::AcqRel);
            if old != not_started() && old != ready() && !old.is_null() {
                for node in unsafe { waiter::drain(old) } {
                    let _ = node.fire();
                }
            }
        }
    }
}
