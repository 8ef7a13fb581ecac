//! Synchronous generators built on the async yield protocol.
//!
//! Stable Rust has no native generator syntax, but an `async` block plus a
//! shared yield slot is an equivalent state machine: the producer writes a
//! value into the slot and suspends; the consumer polls the producer with a
//! no-op waker and takes the slot after every `Pending`. No executor, waker,
//! or thread is involved, so iteration is strictly synchronous and lazy.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::task::noop_waker;

/// The producer's handle for emitting values.
pub struct Yielder<T> {
    slot: Rc<Cell<Option<T>>>,
}

impl<T> Yielder<T> {
    /// Emits one value and suspends until the consumer has taken it.
    pub fn yield_(&self, value: T) -> YieldFuture<T> {
        YieldFuture {
            slot: self.slot.clone(),
            value: Some(value),
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct YieldFuture<T> {
    slot: Rc<Cell<Option<T>>>,
    value: Option<T>,
}

impl<T> Unpin for YieldFuture<T> {}

impl<T> Future for YieldFuture<T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.value.take() {
            Some(value) => {
                // Hand the value to the consumer and suspend; the consumer's
                // next step resumes us.
                self.slot.set(Some(value));
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// A lazy, finite, non-restartable sequence of `T` produced by a suspended
/// computation.
///
/// Dropping the generator before exhaustion drops the producer in place,
/// running the destructors of everything live in its scope.
///
/// # Example
///
///```
/// use subito::task::Generator;
///
/// let fibs = Generator::new(|y| async move {
///     let (mut a, mut b) = (0u64, 1u64);
///     loop {
///         y.yield_(a).await;
///         (a, b) = (b, a + b);
///     }
/// });
/// let first: Vec<u64> = fibs.take(6).collect();
/// assert_eq!(first, vec![0, 1, 1, 2, 3, 5]);
///```
///
/// # Panics
///
/// The producer must suspend only through [`Yielder::yield_`]; awaiting
/// anything that parks on an external waker makes `next()` panic, because a
/// synchronous iterator has no way to wait.
pub struct Generator<'a, T> {
    slot: Rc<Cell<Option<T>>>,
    producer: Option<Pin<Box<dyn Future<Output = ()> + 'a>>>,
}

impl<'a, T: 'a> Generator<'a, T> {
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(Yielder<T>) -> Fut,
        Fut: Future<Output = ()> + 'a,
    {
        let slot = Rc::new(Cell::new(None));
        let yielder = Yielder { slot: slot.clone() };
        Self {
            slot,
            producer: Some(Box::pin(producer(yielder))),
        }
    }
}

impl<T> Iterator for Generator<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let producer = self.producer.as_mut()?;

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match producer.as_mut().poll(&mut cx) {
            Poll::Pending => match self.slot.take() {
                Some(value) => Some(value),
                None => panic!("generator suspended on a non-yield await"),
            },
            Poll::Ready(()) => {
                self.producer = None;
                None
            }
        }
    }
}

impl<T> std::iter::FusedIterator for Generator<'_, T> {}

/// One step of a recursive producer: a leaf value or a whole nested
/// generator to splice in.
enum Step<'a, T> {
    Value(T),
    Nested(RecursiveGenerator<'a, T>),
}

/// The producer handle for [`RecursiveGenerator`].
pub struct RecursiveYielder<'a, T> {
    slot: Rc<Cell<Option<Step<'a, T>>>>,
}

impl<'a, T> RecursiveYielder<'a, T> {
    pub fn yield_(&self, value: T) -> RecursiveYieldFuture<'a, T> {
        RecursiveYieldFuture {
            slot: self.slot.clone(),
            step: Some(Step::Value(value)),
        }
    }

    /// Splices a nested generator: its elements are produced before this
    /// producer resumes.
    pub fn yield_from(&self, nested: RecursiveGenerator<'a, T>) -> RecursiveYieldFuture<'a, T> {
        RecursiveYieldFuture {
            slot: self.slot.clone(),
            step: Some(Step::Nested(nested)),
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct RecursiveYieldFuture<'a, T> {
    slot: Rc<Cell<Option<Step<'a, T>>>>,
    step: Option<Step<'a, T>>,
}

impl<T> Unpin for RecursiveYieldFuture<'_, T> {}

impl<T> Future for RecursiveYieldFuture<'_, T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.step.take() {
            Some(step) => {
                self.slot.set(Some(step));
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// One producer frame of a recursive generation.
struct Frame<'a, T> {
    slot: Rc<Cell<Option<Step<'a, T>>>>,
    producer: Pin<Box<dyn Future<Output = ()> + 'a>>,
}

/// A generator whose producer can yield nested generators.
///
/// Iteration keeps the active producers on an explicit frame stack: entering
/// a nested generator pushes its frames, exhausting one pops it. Stepping to
/// the next element touches only the innermost frame, so per-element cost
/// does not grow with nesting depth.
///
/// # Example
///
///```
/// use subito::task::{RecursiveGenerator, RecursiveYielder};
///
/// fn range(lo: u32, hi: u32) -> RecursiveGenerator<'static, u32> {
///     RecursiveGenerator::new(move |y| async move {
///         if hi - lo <= 1 {
///             if lo < hi {
///                 y.yield_(lo).await;
///             }
///         } else {
///             let mid = lo + (hi - lo) / 2;
///             y.yield_from(range(lo, mid)).await;
///             y.yield_from(range(mid, hi)).await;
///         }
///     })
/// }
///
/// let all: Vec<u32> = range(0, 5).collect();
/// assert_eq!(all, vec![0, 1, 2, 3, 4]);
///```
pub struct RecursiveGenerator<'a, T> {
    frames: Vec<Frame<'a, T>>,
}

impl<'a, T: 'a> RecursiveGenerator<'a, T> {
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(RecursiveYielder<'a, T>) -> Fut,
        Fut: Future<Output = ()> + 'a,
    {
        let slot = Rc::new(Cell::new(None));
        let yielder = RecursiveYielder { slot: slot.clone() };
        Self {
            frames: vec![Frame {
                slot,
                producer: Box::pin(producer(yielder)),
            }],
        }
    }
}

impl<T> Iterator for RecursiveGenerator<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            let frame = self.frames.last_mut()?;
            match frame.producer.as_mut().poll(&mut cx) {
                Poll::Pending => match frame.slot.take() {
                    Some(Step::Value(value)) => return Some(value),
                    Some(Step::Nested(nested)) => {
                        // Descend: the nested generator's frames become the
                        // innermost ones.
                        self.frames.extend(nested.frames);
                    }
                    None => panic!("generator suspended on a non-yield await"),
                },
                Poll::Ready(()) => {
                    self.frames.pop();
                }
            }
        }
    }
}

impl<T> std::iter::FusedIterator for RecursiveGenerator<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Values arrive lazily, one per next() call
    #[test]
    fn test_lazy_iteration() {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let mut generator = {
            let steps = steps.clone();
            Generator::new(move |y| async move {
                for i in 0..3 {
                    steps.borrow_mut().push(i);
                    y.yield_(i).await;
                }
            })
        };

        assert!(steps.borrow().is_empty());
        assert_eq!(generator.next(), Some(0));
        assert_eq!(steps.borrow().len(), 1);
        assert_eq!(generator.next(), Some(1));
        assert_eq!(generator.next(), Some(2));
        assert_eq!(generator.next(), None);
        // Fused: keeps returning None.
        assert_eq!(generator.next(), None);
    }

    /// Early drop runs destructors of values live in the producer
    #[test]
    fn test_early_drop() {
        struct Tracked(Rc<Cell<bool>>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let mut generator = {
            let dropped = dropped.clone();
            Generator::new(move |y| async move {
                let guard = Tracked(dropped);
                y.yield_(1).await;
                y.yield_(2).await;
                drop(guard);
            })
        };

        assert_eq!(generator.next(), Some(1));
        assert!(!dropped.get());
        drop(generator);
        assert!(dropped.get());
    }

    /// Borrowed captures work for non-'static producers
    #[test]
    fn test_borrowed_capture() {
        let data = vec![10, 20, 30];
        let items = &data;
        let generator = Generator::new(move |y| async move {
            for item in items {
                y.yield_(*item * 2).await;
            }
        });
        assert_eq!(generator.collect::<Vec<_>>(), vec![20, 40, 60]);
    }

    /// Deep nesting flattens in order
    #[test]
    fn test_recursive_nesting() {
        fn countdown(n: u32) -> RecursiveGenerator<'static, u32> {
            RecursiveGenerator::new(move |y| async move {
                if n > 0 {
                    y.yield_(n).await;
                    y.yield_from(countdown(n - 1)).await;
                }
            })
        }

        let all: Vec<u32> = countdown(5).collect();
        assert_eq!(all, vec![5, 4, 3, 2, 1]);
    }

    /// A nested generator interleaves with values from its parent
    #[test]
    fn test_recursive_interleaving() {
        let generator = RecursiveGenerator::new(|y| async move {
            y.yield_(1).await;
            y.yield_from(RecursiveGenerator::new(|y| async move {
                y.yield_(2).await;
                y.yield_(3).await;
            }))
            .await;
            y.yield_(4).await;
        });
        assert_eq!(generator.collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }
}
