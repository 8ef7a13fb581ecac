//! Platform reactor seam.
//!
//! The I/O service consumes a completion-queue abstraction: submissions
//! return immediately carrying an opaque `key`, completions are delivered
//! through [`Reactor::poll`], and [`Reactor::post_wake`] injects a synthetic
//! completion to break a blocking poll. Byte-transfer providers (an IOCP or
//! io_uring binding) implement this trait outside the crate; the in-process
//! [`LocalReactor`] serves the scheduling and timer paths, and lets tests
//! drive the operation state machine deterministically.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::net::IpEndpoint;

/// Native I/O handle (file descriptor / socket / HANDLE), type-erased.
pub type RawHandle = usize;

/// Negated platform code carried by a cancelled completion.
pub const CANCELLED_RESULT: i32 = -125;

/// One dequeued completion.
///
/// `result` follows the submission-queue convention: negative values are a
/// negated platform error code, non-negative values mean success with
/// `bytes` transferred.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The opaque key given at submission; zero marks a plain wake-up.
    pub key: usize,
    pub result: i32,
    pub bytes: usize,
}

/// A mutable buffer descriptor that outlives the borrow checker's view of a
/// submission. The submitter guarantees the memory stays valid until the
/// matching completion is dequeued.
#[derive(Debug, Clone, Copy)]
pub struct BufferMut {
    pub ptr: *mut u8,
    pub len: usize,
}

/// A read-only buffer descriptor; same validity contract as [`BufferMut`].
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub ptr: *const u8,
    pub len: usize,
}

unsafe impl Send for BufferMut {}
unsafe impl Send for Buffer {}

/// A completion-port style reactor.
///
/// Every submission returns immediately; the outcome arrives as a
/// [`Completion`] carrying the submission's `key`. Submissions must not fail
/// after the key has been exposed to a cancellation path, so providers
/// pre-allocate whatever the submission needs.
pub trait Reactor: Send + Sync + 'static {
    /// Ties a native handle to this reactor's completion queue.
    fn register_handle(&self, handle: RawHandle) -> Result<(), Error>;

    fn submit_read(
        &self,
        handle: RawHandle,
        offset: u64,
        buffer: BufferMut,
        key: usize,
    ) -> Result<(), Error>;
    fn submit_write(
        &self,
        handle: RawHandle,
        offset: u64,
        buffer: Buffer,
        key: usize,
    ) -> Result<(), Error>;
    fn submit_accept(&self, handle: RawHandle, key: usize) -> Result<(), Error>;
    fn submit_connect(&self, handle: RawHandle, peer: &IpEndpoint, key: usize)
    -> Result<(), Error>;
    fn submit_disconnect(&self, handle: RawHandle, key: usize) -> Result<(), Error>;
    fn submit_send(&self, handle: RawHandle, buffer: Buffer, key: usize) -> Result<(), Error>;
    fn submit_recv(&self, handle: RawHandle, buffer: BufferMut, key: usize) -> Result<(), Error>;
    fn submit_send_to(
        &self,
        handle: RawHandle,
        peer: &IpEndpoint,
        buffer: Buffer,
        key: usize,
    ) -> Result<(), Error>;
    fn submit_recv_from(
        &self,
        handle: RawHandle,
        buffer: BufferMut,
        key: usize,
    ) -> Result<(), Error>;

    /// Best-effort cancellation of an in-flight submission; a no-op if the
    /// completion was already produced.
    fn cancel(&self, key: usize);

    /// Dequeues one completion. `None` timeout blocks indefinitely;
    /// `Some(d)` waits at most `d` and returns `Ok(None)` on timeout.
    fn poll(&self, timeout: Option<Duration>) -> Result<Option<Completion>, Error>;

    /// Enqueues a synthetic completion with the given key (zero for a plain
    /// wake-up). Returns false if the queue refused it.
    fn post_wake(&self, key: usize) -> bool;
}

/// In-process reactor: a condvar-guarded completion queue with no OS handles
/// behind it.
///
/// Submissions are recorded and completed explicitly via
/// [`LocalReactor::complete`], which makes it the test double for the
/// cancellable-operation state machine, and a fully functional backend for
/// `schedule()` / timer traffic.
pub struct LocalReactor {
    queue: Mutex<LocalQueue>,
    ready: Condvar,
}

struct LocalQueue {
    completions: VecDeque<Completion>,
    /// Keys submitted and not yet completed.
    in_flight: Vec<usize>,
}

impl LocalReactor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(LocalQueue {
                completions: VecDeque::new(),
                in_flight: Vec::new(),
            }),
            ready: Condvar::new(),
        }
    }

    fn record(&self, key: usize) -> Result<(), Error> {
        self.queue.lock().in_flight.push(key);
        Ok(())
    }

    fn push(&self, completion: Completion) {
        let mut queue = self.queue.lock();
        queue.completions.push_back(completion);
        drop(queue);
        self.ready.notify_one();
    }

    /// Number of submissions that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.queue.lock().in_flight.len()
    }

    /// Produces the completion for the oldest in-flight submission.
    ///
    /// Returns false if nothing is in flight.
    pub fn complete_next(&self, result: i32, bytes: usize) -> bool {
        let mut queue = self.queue.lock();
        if queue.in_flight.is_empty() {
            return false;
        }
        let key = queue.in_flight.remove(0);
        queue.completions.push_back(Completion { key, result, bytes });
        drop(queue);
        self.ready.notify_one();
        true
    }
}

impl Default for LocalReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for LocalReactor {
    fn register_handle(&self, _handle: RawHandle) -> Result<(), Error> {
        Ok(())
    }

    fn submit_read(
        &self,
        _handle: RawHandle,
        _offset: u64,
        _buffer: BufferMut,
        key: usize,
    ) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_write(
        &self,
        _handle: RawHandle,
        _offset: u64,
        _buffer: Buffer,
        key: usize,
    ) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_accept(&self, _handle: RawHandle, key: usize) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_connect(
        &self,
        _handle: RawHandle,
        _peer: &IpEndpoint,
        key: usize,
    ) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_disconnect(&self, _handle: RawHandle, key: usize) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_send(&self, _handle: RawHandle, _buffer: Buffer, key: usize) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_recv(&self, _handle: RawHandle, _buffer: BufferMut, key: usize) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_send_to(
        &self,
        _handle: RawHandle,
        _peer: &IpEndpoint,
        _buffer: Buffer,
        key: usize,
    ) -> Result<(), Error> {
        self.record(key)
    }

    fn submit_recv_from(
        &self,
        _handle: RawHandle,
        _buffer: BufferMut,
        key: usize,
    ) -> Result<(), Error> {
        self.record(key)
    }

    fn cancel(&self, key: usize) {
        let mut queue = self.queue.lock();
        if let Some(pos) = queue.in_flight.iter().position(|&k| k == key) {
            queue.in_flight.remove(pos);
            queue.completions.push_back(Completion {
                key,
                result: CANCELLED_RESULT,
                bytes: 0,
            });
            drop(queue);
            self.ready.notify_one();
        }
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<Option<Completion>, Error> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(completion) = queue.completions.pop_front() {
                return Ok(Some(completion));
            }
            match timeout {
                None => {
                    self.ready.wait(&mut queue);
                }
                Some(duration) if duration.is_zero() => return Ok(None),
                Some(duration) => {
                    let deadline = Instant::now() + duration;
                    if self.ready.wait_until(&mut queue, deadline).timed_out() {
                        return Ok(queue.completions.pop_front());
                    }
                }
            }
        }
    }

    fn post_wake(&self, key: usize) -> bool {
        self.push(Completion {
            key,
            result: 0,
            bytes: 0,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Completions arrive in submission order through complete_next
    #[test]
    fn test_fifo_completion() {
        let reactor = LocalReactor::new();
        reactor.submit_accept(1, 0x10).unwrap();
        reactor.submit_accept(1, 0x20).unwrap();
        assert_eq!(reactor.in_flight(), 2);

        assert!(reactor.complete_next(0, 5));
        let c = reactor.poll(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!((c.key, c.bytes), (0x10, 5));
    }

    /// cancel() produces a cancelled completion for in-flight keys only
    #[test]
    fn test_cancel() {
        let reactor = LocalReactor::new();
        reactor.submit_accept(1, 0x10).unwrap();
        reactor.cancel(0x10);
        let c = reactor.poll(Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(c.result, CANCELLED_RESULT);

        // Already completed: cancelling again is a no-op.
        reactor.cancel(0x10);
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_none());
    }

    /// post_wake breaks a blocking poll
    #[test]
    fn test_post_wake() {
        let reactor = std::sync::Arc::new(LocalReactor::new());
        let waker = {
            let reactor = reactor.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                reactor.post_wake(0);
            })
        };
        let c = reactor.poll(None).unwrap().unwrap();
        assert_eq!(c.key, 0);
        waker.join().unwrap();
    }
}
