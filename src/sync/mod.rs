//! Async synchronization primitives.
//!
//! All four types share one construction: an atomic head word that is either a
//! sentinel (encoding "set" / "unlocked" / "no waiters") or the top of an
//! intrusive stack of waiter nodes. The releasing operation (`set`, `unlock`)
//! detaches the whole stack with a single exchange and decides which waiters
//! to resume.
//!
//! | type | head encoding | resume order |
//! |------|---------------|--------------|
//! | [`AsyncManualResetEvent`] | set sentinel / null / stack | all, LIFO |
//! | [`AsyncAutoResetEvent`] | packed `(set, waiters)` counts + two lists | `min(set, waiters)`, FIFO |
//! | [`AsyncMutex`] | unlocked sentinel / null / stack | one, FIFO |
//! | [`SingleConsumerEvent`] | three-state byte | the one waiter |
//!
//! Waiters dropped mid-wait are skipped; primitives that hand over a resource
//! (the mutex's lock, the auto-reset event's set token) pass the grant to the
//! next waiter instead of losing it.

mod auto_reset;
mod manual_reset;
mod mutex;
mod single_consumer;

pub use auto_reset::{AsyncAutoResetEvent, AutoResetWaitFuture};
pub use manual_reset::{AsyncManualResetEvent, ManualResetWaitFuture};
pub use mutex::{AsyncMutex, AsyncMutexGuard, MutexLockFuture};
pub use single_consumer::{
    SingleConsumerAutoResetEvent, SingleConsumerAutoResetWait, SingleConsumerEvent,
    SingleConsumerWait,
};
