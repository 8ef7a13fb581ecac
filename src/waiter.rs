//! Shared waiter-node machinery for lock-free waiter lists.
//!
//! Every slow path in the crate parks its caller on an intrusive stack of
//! heap nodes: an atomic head pointer plus a per-node `next` link. Nodes are
//! pushed with a CAS loop and drained by an exchange-to-null, so the head
//! pointer is also free to carry sentinel values (an event's "set" state, a
//! mutex's "locked, no waiters" state) chosen to never collide with a real
//! allocation.
//!
//! ## Node lifecycle
//!
//!```text
//!             fire()              (waker notified, resumes once)
//!  Waiting ──────────▶ Fired
//!     │
//!     │ abandon()               (future dropped mid-wait)
//!     └──────────▶ Abandoned
//!```
//!
//! `fire()` and `abandon()` race through a single compare-exchange, so exactly
//! one of them wins. A primitive that hands a resource to the waiter it fires
//! must check the return value of `fire()`: a `false` means the waiter was
//! dropped and the grant has to go to the next node. Conversely a future whose
//! `abandon()` fails knows it was granted the resource after all and must
//! release it from its destructor.
//!
//! ## `next` aliasing rule
//!
//! The `next` link is only ever written by the thread that owns the node at
//! that moment: the pusher before the publishing CAS, or the drainer that
//! detached the whole list. It is never touched while the node is reachable
//! by other threads.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::Waker;

use futures::task::AtomicWaker;

const WAITING: u8 = 0;
const FIRED: u8 = 1;
const ABANDONED: u8 = 2;

pub(crate) struct Waiter<P> {
    next: UnsafeCell<*const Waiter<P>>,
    waker: AtomicWaker,
    state: AtomicU8,
    pub(crate) payload: P,
}

// The raw `next` pointer is guarded by the aliasing rule above; everything
// else is atomics plus the payload.
unsafe impl<P: Send + Sync> Send for Waiter<P> {}
unsafe impl<P: Send + Sync> Sync for Waiter<P> {}

impl<P> Waiter<P> {
    pub(crate) fn new(payload: P) -> Arc<Self> {
        Arc::new(Self {
            next: UnsafeCell::new(ptr::null()),
            waker: AtomicWaker::new(),
            state: AtomicU8::new(WAITING),
            payload,
        })
    }

    /// Stores the continuation to notify on `fire()`.
    ///
    /// Callers must register *before* checking `is_fired()` so that a
    /// concurrent `fire()` either sees the fresh waker or is observed by the
    /// subsequent state check.
    #[inline]
    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Marks the waiter resumable and notifies it.
    ///
    /// Returns false if the waiter was already fired or abandoned; the caller
    /// then still owns whatever grant it was trying to hand over.
    pub(crate) fn fire(&self) -> bool {
        if self
            .state
            .compare_exchange(WAITING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.waker.wake();
            true
        } else {
            false
        }
    }

    /// Marks the waiter as dropped mid-wait.
    ///
    /// Returns false if a concurrent `fire()` won the race, in which case the
    /// grant was already handed to this waiter and the caller must release it.
    pub(crate) fn abandon(&self) -> bool {
        self.state
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Leaks one strong reference as a raw pointer suitable for an intrusive
    /// list head or link.
    pub(crate) fn into_raw(this: Arc<Self>) -> *mut Waiter<P> {
        Arc::into_raw(this) as *mut Waiter<P>
    }

    /// Reclaims a reference previously leaked with [`Waiter::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `into_raw` and not have been reclaimed yet.
    pub(crate) unsafe fn from_raw(ptr: *const Waiter<P>) -> Arc<Self> {
        unsafe { Arc::from_raw(ptr) }
    }

    /// # Safety
    ///
    /// Caller must own the node per the aliasing rule in the module docs.
    #[inline]
    pub(crate) unsafe fn set_next(&self, next: *const Waiter<P>) {
        unsafe { *self.next.get() = next };
    }

    /// # Safety
    ///
    /// Caller must own the node per the aliasing rule in the module docs.
    #[inline]
    pub(crate) unsafe fn next(&self) -> *const Waiter<P> {
        unsafe { *self.next.get() }
    }
}

/// Reverses a detached (exclusively owned) list in place, returning the new
/// head. Used to turn a LIFO push stack into FIFO resume order.
///
/// # Safety
///
/// The caller must exclusively own every node in the list.
pub(crate) unsafe fn reverse<P>(mut head: *const Waiter<P>) -> *const Waiter<P> {
    let mut reversed: *const Waiter<P> = ptr::null();
    while !head.is_null() {
        let node = head;
        unsafe {
            head = (*node).next();
            (*node).set_next(reversed);
        }
        reversed = node;
    }
    reversed
}

/// Takes ownership of a detached list and iterates it front to back, yielding
/// each node as a live `Arc`.
///
/// # Safety
///
/// The caller must exclusively own every node in the list, and each node must
/// carry the strong reference leaked by [`Waiter::into_raw`].
pub(crate) unsafe fn drain<P>(head: *const Waiter<P>) -> Drain<P> {
    Drain { current: head }
}

pub(crate) struct Drain<P> {
    current: *const Waiter<P>,
}

impl<P> Iterator for Drain<P> {
    type Item = Arc<Waiter<P>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        // Reclaim the node's leaked reference, then read `next` while the Arc
        // keeps it alive.
        let node = unsafe { Waiter::from_raw(self.current) };
        self.current = unsafe { node.next() };
        Some(node)
    }
}

impl<P> Drop for Drain<P> {
    fn drop(&mut self) {
        // Release the remaining leaked references even if the caller stopped
        // iterating early.
        for _node in self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// fire() wins exactly once, abandon() observes the loss
    #[test]
    fn test_fire_once() {
        let w = Waiter::new(());
        assert!(w.fire());
        assert!(!w.fire());
        assert!(!w.abandon());
        assert!(w.is_fired());
    }

    /// An abandoned waiter can no longer be fired
    #[test]
    fn test_abandon_blocks_fire() {
        let w = Waiter::new(());
        assert!(w.abandon());
        assert!(!w.fire());
        assert!(!w.is_fired());
    }

    /// Push three nodes as a stack, reverse, and drain in FIFO order
    #[test]
    fn test_reverse_and_drain() {
        let mut head: *const Waiter<usize> = ptr::null();
        for i in 0..3usize {
            let node = Waiter::new(i);
            unsafe { node.set_next(head) };
            head = Waiter::into_raw(node);
        }

        // Stack order is 2, 1, 0; reversed it becomes insertion order.
        let fifo = unsafe { reverse(head) };
        let order: Vec<usize> = unsafe { drain(fifo) }.map(|n| n.payload).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    /// Dropping a drain iterator releases the remaining nodes
    #[test]
    fn test_drain_drop_releases() {
        struct CountOnDrop(Arc<AtomicUsize>);
        impl Drop for CountOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut head: *const Waiter<CountOnDrop> = ptr::null();
        for _ in 0..4 {
            let node = Waiter::new(CountOnDrop(drops.clone()));
            unsafe { node.set_next(head) };
            head = Waiter::into_raw(node);
        }

        let mut iter = unsafe { drain(head) };
        let _first = iter.next();
        drop(iter);
        drop(_first);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }
}
