//! One-shot results, shared results, and value sequences.
//!
//! | type | start | owners | consumers |
//! |------|-------|--------|-----------|
//! | [`Task`] | on first await | one | one |
//! | [`EagerTask`] | at spawn, on an executor | one | one |
//! | [`SharedTask`] | on first await | many | many (`T: Clone`) |
//! | [`Generator`] | on first `next()` | one | one, synchronous |
//! | [`AsyncGenerator`] | on first `poll_next` | one | one |
//! | [`AsyncStream`](subscribe) | on first `poll_next` | split task/items | one each |

mod async_generator;
mod eager;
mod generator;
mod lazy;
mod shared;
mod stream;

pub use async_generator::{AsyncGenerator, AsyncYieldFuture, AsyncYielder};
pub use eager::{EagerTask, EagerWhenReady};
pub use generator::{
    Generator, RecursiveGenerator, RecursiveYieldFuture, RecursiveYielder, YieldFuture, Yielder,
};
pub use lazy::{Task, WhenReady};
pub use shared::SharedTask;
pub use stream::{StreamItems, StreamTask, StreamYieldFuture, StreamYielder, subscribe};

pub(crate) use eager::spawn_on;
