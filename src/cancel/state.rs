//! Shared cancellation state and the lock-free registration list.
//!
//! ## State word
//!
//! One `AtomicU64`:
//!
//! - bit 0: cancellation requested
//! - bit 1: callback notification complete
//! - bits 2..: count of live [`CancellationSource`](crate::cancel::CancellationSource) handles
//!
//! Memory management of the state itself is `Arc`-based (every handle holds a
//! strong reference); the packed source count exists purely to answer
//! `can_be_cancelled()`: once the last source is gone and cancellation was
//! never requested, no one can request it anymore.
//!
//! ## Registration list
//!
//! Registrations are spread over up to 16 buckets hashed by the registering
//! thread's id to reduce contention. Each bucket is a chain of chunks whose
//! slot counts double from 16 up to 1024; a slot is an atomic pointer to the
//! registration record. Claiming a slot, deregistering, and the notifier
//! acquiring callbacks all resolve through seq-cst exchanges on the slot, so
//! every installed callback is claimed exactly once.

use std::cell::UnsafeCell;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_utils::Backoff;

pub(super) const REQUESTED_FLAG: u64 = 1;
pub(super) const NOTIFIED_FLAG: u64 = 2;
pub(super) const SOURCE_REF_INC: u64 = 4;

const INITIAL_CHUNK_SLOTS: usize = 16;
const MAX_CHUNK_SLOTS: usize = 1024;
const MAX_BUCKETS: usize = 16;

/// A registered callback record. The slot in the registration list holds one
/// leaked strong reference; the [`Registration`](crate::cancel::CancellationRegistration)
/// handle holds another.
pub(super) struct CallbackRecord {
    /// Taken exactly once, by whichever side claims the slot.
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    /// Back-pointer to the slot this record was installed in.
    slot: UnsafeCell<*const Slot>,
}

// The cells are claimed through the slot's seq-cst exchange before access.
unsafe impl Send for CallbackRecord {}
unsafe impl Sync for CallbackRecord {}

impl CallbackRecord {
    pub(super) fn new(callback: Box<dyn FnOnce() + Send>) -> Arc<Self> {
        Arc::new(Self {
            callback: UnsafeCell::new(Some(callback)),
            slot: UnsafeCell::new(ptr::null()),
        })
    }

    /// # Safety
    ///
    /// Caller must have exclusive claim on the record: either it won the
    /// slot's claiming exchange, or the record was never published.
    pub(super) unsafe fn take_callback(&self) -> Option<Box<dyn FnOnce() + Send>> {
        unsafe { (*self.callback.get()).take() }
    }
}

type Slot = AtomicPtr<CallbackRecord>;

struct Chunk {
    next: AtomicPtr<Chunk>,
    prev: *const Chunk,
    entries: Box<[Slot]>,
}

impl Chunk {
    /// Allocates a chunk and leaks it; freed by `CancellationState::drop`.
    fn allocate(slots: usize, prev: *const Chunk) -> *mut Chunk {
        let entries = (0..slots)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Chunk {
            next: AtomicPtr::new(ptr::null_mut()),
            prev,
            entries,
        }))
    }
}

struct RegistrationList {
    /// Identity of the thread running the callbacks. Written by the notifier
    /// after it wins the requested flag and before it claims any slot; read
    /// only by deregistering threads whose claim CAS failed, which
    /// synchronizes through that same slot exchange.
    notifier: UnsafeCell<Option<ThreadId>>,
    /// Cache of the last chunk per bucket so registration doesn't rescan the
    /// chain from the head. May lag; converges on use.
    tail_hints: Box<[AtomicPtr<Chunk>]>,
    buckets: Box<[AtomicPtr<Chunk>]>,
}

unsafe impl Send for RegistrationList {}
unsafe impl Sync for RegistrationList {}

impl RegistrationList {
    fn allocate() -> *mut RegistrationList {
        let bucket_count = thread::available_parallelism()
            .map(|n| n.get().min(MAX_BUCKETS))
            .unwrap_or(1);
        let buckets = (0..bucket_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let tail_hints = (0..bucket_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(RegistrationList {
            notifier: UnsafeCell::new(None),
            tail_hints,
            buckets,
        }))
    }

    fn bucket_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    /// Installs the record into a free slot, leaking one strong reference
    /// into the slot and recording the slot pointer in the record.
    fn add(&self, record: &Arc<CallbackRecord>) {
        let index = self.bucket_index();
        let bucket = &self.buckets[index];
        let leaked = Arc::into_raw(record.clone()) as *mut CallbackRecord;

        let mut head = bucket.load(Ordering::Acquire);
        if head.is_null() {
            // First registration from this bucket: allocate the head chunk
            // with slot 0 pre-claimed.
            let chunk = Chunk::allocate(INITIAL_CHUNK_SLOTS, ptr::null());
            unsafe {
                (*chunk).entries[0].store(leaked, Ordering::Relaxed);
                *record.slot.get() = &(*chunk).entries[0];
            }
            match bucket.compare_exchange(
                ptr::null_mut(),
                chunk,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => {
                    // Lost the race; discard our chunk and fall through to
                    // the claim loop on the winner's chain.
                    drop(unsafe { Box::from_raw(chunk) });
                    head = current;
                }
            }
        }

        loop {
            // Walk to the true last chunk, starting from the cached hint.
            let hinted = self.tail_hints[index].load(Ordering::Acquire);
            let mut last = if hinted.is_null() { head } else { hinted };
            unsafe {
                let mut next = (*last).next.load(Ordering::Acquire);
                while !next.is_null() {
                    last = next;
                    next = (*last).next.load(Ordering::Acquire);
                }
            }
            if last != hinted {
                self.tail_hints[index].store(last, Ordering::Release);
            }

            // Work backwards from the last chunk looking for a free slot; the
            // cheap relaxed read filters occupied slots before the claiming
            // exchange.
            let mut chunk = last as *const Chunk;
            while !chunk.is_null() {
                let entries = unsafe { &(*chunk).entries };
                for slot in entries.iter() {
                    if slot.load(Ordering::Relaxed).is_null() {
                        unsafe { *record.slot.get() = slot as *const Slot };
                        if slot
                            .compare_exchange(
                                ptr::null_mut(),
                                leaked,
                                Ordering::SeqCst,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            return;
                        }
                    }
                }
                chunk = unsafe { (*chunk).prev };
            }

            // Every chunk is full: append a bigger one with slot 0
            // pre-claimed.
            let slots = unsafe { ((&(*last).entries).len() * 2).min(MAX_CHUNK_SLOTS) };
            let fresh = Chunk::allocate(slots, last);
            unsafe {
                (*fresh).entries[0].store(leaked, Ordering::Relaxed);
                *record.slot.get() = &(*fresh).entries[0];
            }
            match unsafe {
                (*last).next.compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
            } {
                Ok(_) => {
                    self.tail_hints[index].store(fresh, Ordering::Release);
                    return;
                }
                Err(_) => {
                    // Another thread appended concurrently; retry, likely
                    // finding space in their chunk.
                    drop(unsafe { Box::from_raw(fresh) });
                }
            }
        }
    }
}

pub(super) struct CancellationState {
    state: AtomicU64,
    registrations: AtomicPtr<RegistrationList>,
}

impl CancellationState {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU64::new(SOURCE_REF_INC),
            registrations: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(super) fn add_source_ref(&self) {
        self.state.fetch_add(SOURCE_REF_INC, Ordering::Relaxed);
    }

    pub(super) fn release_source_ref(&self) {
        self.state.fetch_sub(SOURCE_REF_INC, Ordering::AcqRel);
    }

    pub(super) fn can_be_cancelled(&self) -> bool {
        // Any live source keeps the word non-zero through its ref increment;
        // after the last source is gone only a latched request (or completed
        // notification) does.
        self.state.load(Ordering::Acquire) != 0
    }

    pub(super) fn is_cancellation_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) & REQUESTED_FLAG != 0
    }

    fn is_notification_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) & NOTIFIED_FLAG != 0
    }

    /// Latches the requested flag and synchronously runs every installed
    /// callback exactly once. Idempotent.
    pub(super) fn request_cancellation(&self) {
        let old = self.state.fetch_or(REQUESTED_FLAG, Ordering::SeqCst);
        if old & REQUESTED_FLAG != 0 {
            // Someone else already notified (or is notifying).
            return;
        }

        // Seq-cst pairs with the slot exchange in `try_register`: either the
        // registering thread observes the requested flag after its slot
        // write, or we observe its slot write here.
        let list = self.registrations.load(Ordering::SeqCst);
        if list.is_null() {
            self.state.fetch_or(NOTIFIED_FLAG, Ordering::Release);
            return;
        }

        unsafe { *(*list).notifier.get() = Some(thread::current().id()) };

        let buckets = unsafe { &(*list).buckets };
        for bucket in buckets.iter() {
            let mut chunk = bucket.load(Ordering::SeqCst) as *const Chunk;
            while !chunk.is_null() {
                for slot in unsafe { (*chunk).entries.iter() } {
                    if !slot.load(Ordering::SeqCst).is_null() {
                        // Claim the record; resolves the race against a
                        // concurrent deregistration.
                        let claimed = slot.swap(ptr::null_mut(), Ordering::SeqCst);
                        if !claimed.is_null() {
                            let record = unsafe { Arc::from_raw(claimed) };
                            if let Some(callback) = unsafe { record.take_callback() } {
                                // Callbacks are a noexcept boundary: an abort
                                // beats unwinding into arbitrary registrants.
                                let guard = AbortOnUnwind;
                                callback();
                                std::mem::forget(guard);
                            }
                        }
                    }
                }
                chunk = unsafe { (*chunk).next.load(Ordering::SeqCst) };
            }
        }

        self.state.fetch_or(NOTIFIED_FLAG, Ordering::Release);
    }

    /// Installs a callback record. Returns false if cancellation was already
    /// requested (or raced in before the registration became visible), in
    /// which case the caller owns running the callback.
    pub(super) fn try_register(&self, record: &Arc<CallbackRecord>) -> bool {
        if self.is_cancellation_requested() {
            return false;
        }

        let mut list = self.registrations.load(Ordering::Acquire);
        if list.is_null() {
            let fresh = RegistrationList::allocate();
            // Seq-cst so a later relaxed-free read of the state flag cannot
            // reorder before this publication.
            match self.registrations.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => list = fresh,
                Err(current) => {
                    drop(unsafe { Box::from_raw(fresh) });
                    list = current;
                }
            }
        }

        unsafe { (*list).add(record) };

        // Re-check: a concurrent request_cancellation may have missed our
        // slot write.
        if self.state.load(Ordering::SeqCst) & REQUESTED_FLAG != 0 {
            let slot = unsafe { &*(*record.slot.get()) };
            let expected = Arc::as_ptr(record) as *mut CallbackRecord;
            if slot
                .compare_exchange(expected, ptr::null_mut(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // We withdrew the registration before the notifier saw it;
                // reclaim the slot's reference and let the caller invoke the
                // callback itself.
                drop(unsafe { Arc::from_raw(expected) });
                return false;
            }
            // The notifier claimed it and will run the callback; treat the
            // registration as installed.
        }

        true
    }

    /// Removes a previously installed record. If the notifier claimed it
    /// first, blocks until the notification pass completes, unless called
    /// from the notifying thread itself.
    pub(super) fn deregister(&self, record: &Arc<CallbackRecord>) {
        let slot_ptr = unsafe { *record.slot.get() };
        if slot_ptr.is_null() {
            return;
        }
        let slot = unsafe { &*slot_ptr };
        let expected = Arc::as_ptr(record) as *mut CallbackRecord;
        // Acquire on failure: synchronizes with the notifier's claiming
        // exchange so the notifier-id write is visible below.
        if slot
            .compare_exchange(expected, ptr::null_mut(), Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            drop(unsafe { Arc::from_raw(expected) });
            return;
        }

        // The notifier owns the callback and may be running it right now.
        // The registration contract is that the callback has finished by the
        // time deregistration returns, so spin until the pass completes,
        // except on the notifying thread where that would self-deadlock.
        let list = self.registrations.load(Ordering::Relaxed);
        debug_assert!(!list.is_null());
        let notifier = unsafe { *(*list).notifier.get() };
        if notifier != Some(thread::current().id()) {
            let backoff = Backoff::new();
            while !self.is_notification_complete() {
                backoff.snooze();
            }
        }
    }
}

impl Drop for CancellationState {
    fn drop(&mut self) {
        let list = *self.registrations.get_mut();
        if list.is_null() {
            return;
        }
        let list = unsafe { Box::from_raw(list) };
        for bucket in list.buckets.iter() {
            let mut chunk = bucket.load(Ordering::Relaxed);
            while !chunk.is_null() {
                let owned = unsafe { Box::from_raw(chunk) };
                for slot in owned.entries.iter() {
                    // Normally empty by now; reclaim leaked registrations
                    // defensively.
                    let p = slot.load(Ordering::Relaxed);
                    if !p.is_null() {
                        drop(unsafe { Arc::from_raw(p) });
                    }
                }
                chunk = owned.next.load(Ordering::Relaxed);
            }
        }
    }
}

/// Aborts the process if dropped during unwinding.
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        std::process::abort();
    }
}
