//! Async mutex with FIFO hand-off.

use std::cell::UnsafeCell;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::task::{Context, Poll};

use crate::waiter::{self, Waiter};

type Node = Waiter<()>;

/// Sentinel head value meaning "unlocked". Null means "locked, no waiters";
/// any other value is the top of the waiter stack (and the mutex is locked).
#[inline]
fn not_locked() -> *mut Node {
    ptr::without_provenance_mut(1)
}

/// A mutex whose lock operation suspends instead of blocking.
///
/// Ownership passes directly from `unlock` to the longest-waiting locker: the
/// releasing thread reverses any newly arrived waiter stack into a FIFO list
/// and fires the front node, which then owns the lock when it resumes. A lock
/// future dropped after being granted the lock releases it again, so the
/// hand-off is never lost.
///
/// # Example
///
///```
/// use subito::sync::AsyncMutex;
/// use subito::combinator::sync_wait;
///
/// let counter = AsyncMutex::new(0u32);
/// sync_wait(async {
///     let mut guard = counter.lock().await;
///     *guard += 1;
/// });
/// assert_eq!(*sync_wait(counter.lock()), 1);
///```
pub struct AsyncMutex<T: ?Sized> {
    /// `not_locked()` / null / waiter stack head.
    state: AtomicPtr<Node>,
    /// FIFO remainder of a previous unlock's drain. Only the lock holder
    /// touches this.
    waiters: UnsafeCell<*const Node>,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for AsyncMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for AsyncMutex<T> {}

impl<T> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: AtomicPtr::new(not_locked()),
            waiters: UnsafeCell::new(ptr::null()),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        let mut this = self;
        let head = *this.state.get_mut();
        if head != not_locked() && !head.is_null() {
            drop(unsafe { waiter::drain(head) });
        }
        let held = *this.waiters.get_mut();
        if !held.is_null() {
            drop(unsafe { waiter::drain(held) });
        }
        let value = unsafe { ptr::read(this.value.get()) };
        std::mem::forget(this);
        value
    }
}

impl<T: ?Sized> AsyncMutex<T> {
    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
        self.state
            .compare_exchange(
                not_locked(),
                ptr::null_mut(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| AsyncMutexGuard { mutex: self })
    }

    /// Acquires the lock, suspending while another owner holds it.
    ///
    /// The returned guard releases the lock on drop (all exit paths).
    pub fn lock(&self) -> MutexLockFuture<'_, T> {
        MutexLockFuture {
            mutex: self,
            node: None,
        }
    }

    /// Mutable access without locking; the borrow proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Releases the lock, handing it to the longest-waiting locker if any.
    ///
    /// Caller must own the lock.
    fn unlock(&self) {
        // SAFETY: lock ownership grants exclusive access to `waiters`.
        let mut head = unsafe { *self.waiters.get() };

        loop {
            if head.is_null() {
                // No privately held waiters. Try a plain release first.
                if self
                    .state
                    .compare_exchange(
                        ptr::null_mut(),
                        not_locked(),
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }

                // At least one waiter arrived; detach the stack and reverse
                // it so the head is the first to have queued.
                let stack = self.state.swap(ptr::null_mut(), Ordering::Acquire);
                debug_assert!(stack != not_locked() && !stack.is_null());
                head = unsafe { waiter::reverse(stack) };
            }

            // Pop the front waiter and store the remainder before firing:
            // once fired, the new owner may unlock and read `waiters`.
            let front = unsafe { Waiter::from_raw(head) };
            head = unsafe { front.next() };
            unsafe { *self.waiters.get() = head };

            if front.fire() {
                // Lock ownership transferred.
                return;
            }
            // Front waiter was dropped mid-wait; grant the next one.
        }
    }
}

impl<T: Default> Default for AsyncMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> Drop for AsyncMutex<T> {
    fn drop(&mut self) {
        let head = *self.state.get_mut();
        if head != not_locked() && !head.is_null() {
            drop(unsafe { waiter::drain(head) });
        }
        let held = *self.waiters.get_mut();
        if !held.is_null() {
            drop(unsafe { waiter::drain(held) });
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct MutexLockFuture<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
    node: Option<Arc<Node>>,
}

/// Safe: the struct is not self-referential.
impl<T: ?Sized> Unpin for MutexLockFuture<'_, T> {}

impl<'a, T: ?Sized> Future for MutexLockFuture<'a, T> {
    type Output = AsyncMutexGuard<'a, T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(node) = &self.node {
            node.register(cx.waker());
            return if node.is_fired() {
                // The unlocker handed us the lock.
                self.node = None;
                Poll::Ready(AsyncMutexGuard { mutex: self.mutex })
            } else {
                Poll::Pending
            };
        }

        let node = Waiter::new(());
        node.register(cx.waker());

        let mut head = self.mutex.state.load(Ordering::Acquire);
        loop {
            if head == not_locked() {
                match self.mutex.state.compare_exchange_weak(
                    head,
                    ptr::null_mut(),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Poll::Ready(AsyncMutexGuard { mutex: self.mutex }),
                    Err(current) => head = current,
                }
            } else {
                // Locked: push onto the waiter stack.
                unsafe { node.set_next(head) };
                let ptr = Waiter::into_raw(node.clone());
                match self.mutex.state.compare_exchange_weak(
                    head,
                    ptr,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.node = Some(node);
                        return Poll::Pending;
                    }
                    Err(current) => {
                        unsafe { drop(Waiter::from_raw(ptr)) };
                        head = current;
                    }
                }
            }
        }
    }
}

impl<T: ?Sized> Drop for MutexLockFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(node) = &self.node
            && !node.abandon()
        {
            // The unlocker granted us the lock after our last poll; release
            // it so the hand-off chain continues.
            self.mutex.unlock();
        }
    }
}

/// Scoped ownership of an [`AsyncMutex`]; unlocks on drop.
pub struct AsyncMutexGuard<'a, T: ?Sized> {
    mutex: &'a AsyncMutex<T>,
}

impl<T: ?Sized> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves lock ownership.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive lock ownership.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use futures::task::noop_waker;
    use std::thread;

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    /// Uncontended lock acquires without suspending
    #[test]
    fn test_uncontended() {
        let mutex = AsyncMutex::new(7);
        let guard = sync_wait(mutex.lock());
        assert_eq!(*guard, 7);
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    /// try_lock fails while the lock is held
    #[test]
    fn test_try_lock_contended() {
        let mutex = AsyncMutex::new(());
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    /// Unlock hands the mutex to waiters in FIFO order
    #[test]
    fn test_fifo_handoff() {
        let mutex = AsyncMutex::new(());
        let guard = mutex.try_lock().unwrap();

        let mut first = mutex.lock();
        let mut second = mutex.lock();
        assert!(poll_once(&mut first).is_pending());
        assert!(poll_once(&mut second).is_pending());

        drop(guard);
        // The lock went to `first`; `second` still waits.
        assert!(poll_once(&mut second).is_pending());
        let first_guard = match poll_once(&mut first) {
            Poll::Ready(g) => g,
            Poll::Pending => panic!("first waiter should own the lock"),
        };

        drop(first_guard);
        assert!(poll_once(&mut second).is_ready());
    }

    /// A lock future dropped after being granted the lock releases it
    #[test]
    fn test_dropped_grantee_releases() {
        let mutex = AsyncMutex::new(());
        let guard = mutex.try_lock().unwrap();

        let mut doomed = mutex.lock();
        let mut survivor = mutex.lock();
        assert!(poll_once(&mut doomed).is_pending());
        assert!(poll_once(&mut survivor).is_pending());

        drop(guard);
        drop(doomed);
        assert!(poll_once(&mut survivor).is_ready());
    }

    /// Parallel increments never lose updates
    #[test]
    fn test_parallel_increments() {
        let mutex = Arc::new(AsyncMutex::new(0u64));
        let threads = 4u64;
        let per_thread = 1000u64;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        let mut guard = sync_wait(mutex.lock());
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*sync_wait(mutex.lock()), threads * per_thread);
    }
}
