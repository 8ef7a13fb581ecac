//! Asynchronous generator: a producer-driven [`Stream`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;

use crate::error::Error;

/// The producer's handle for emitting values.
///
/// Unlike the synchronous [`Yielder`](crate::task::Yielder), the producer may
/// also await arbitrary futures between yields; the consumer's `poll_next`
/// simply stays pending until the producer either yields or completes.
pub struct AsyncYielder<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> AsyncYielder<T> {
    /// Emits one value and suspends until the consumer has taken it.
    pub fn yield_(&mut self, value: T) -> AsyncYieldFuture<T> {
        AsyncYieldFuture {
            slot: self.slot.clone(),
            value: Some(value),
        }
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct AsyncYieldFuture<T> {
    slot: Arc<Mutex<Option<T>>>,
    value: Option<T>,
}

impl<T> Unpin for AsyncYieldFuture<T> {}

impl<T> Future for AsyncYieldFuture<T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.value.take() {
            Some(value) => {
                // The consumer drives us, takes the slot, and resumes us on
                // its next step; no waker hand-off is needed.
                *self.slot.lock() = Some(value);
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// An asynchronous sequence of `T` with a terminal `Result`.
///
/// Implements [`Stream`] with `Item = Result<T, E>`: values arrive as
/// `Ok(item)`, and a producer failure surfaces once, as the final `Err` item,
/// on the consumer's next step after the failure becomes visible. The stream
/// then ends.
///
/// The producer runs inline inside `poll_next` (single ownership, no
/// executor); between yields it may await anything.
///
/// # Example
///
///```
/// use subito::task::AsyncGenerator;
/// use subito::combinator::sync_wait;
/// use futures::StreamExt;
///
/// let mut numbers = AsyncGenerator::<u32>::new(|mut y| async move {
///     y.yield_(1).await;
///     y.yield_(2).await;
///     Ok(())
/// });
/// sync_wait(async {
///     assert_eq!(numbers.next().await.unwrap().unwrap(), 1);
///     assert_eq!(numbers.next().await.unwrap().unwrap(), 2);
///     assert!(numbers.next().await.is_none());
/// });
///```
pub struct AsyncGenerator<T, E = Error> {
    slot: Arc<Mutex<Option<T>>>,
    producer: Option<Pin<Box<dyn Future<Output = Result<(), E>> + Send>>>,
}

impl<T, E> AsyncGenerator<T, E>
where
    T: Send + 'static,
{
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(AsyncYielder<T>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let yielder = AsyncYielder { slot: slot.clone() };
        Self {
            slot,
            producer: Some(Box::pin(producer(yielder))),
        }
    }
}

impl<T, E> Unpin for AsyncGenerator<T, E> {}

impl<T, E> Stream for AsyncGenerator<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(producer) = self.producer.as_mut() else {
            return Poll::Ready(None);
        };

        match producer.as_mut().poll(cx) {
            Poll::Pending => match self.slot.lock().take() {
                Some(value) => Poll::Ready(Some(Ok(value))),
                // Suspended on something external; its waker will re-poll us.
                None => Poll::Pending,
            },
            Poll::Ready(outcome) => {
                self.producer = None;
                match outcome {
                    Ok(()) => Poll::Ready(None),
                    Err(error) => Poll::Ready(Some(Err(error))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sync_wait;
    use crate::sync::AsyncManualResetEvent;
    use futures::StreamExt;
    use std::thread;
    use std::time::Duration;

    /// Values stream through in order, then the stream ends
    #[test]
    fn test_in_order() {
        let generator = AsyncGenerator::<u32>::new(|mut y| async move {
            for i in 0..5 {
                y.yield_(i * i).await;
            }
            Ok(())
        });
        let collected: Vec<u32> = sync_wait(generator.map(|r| r.unwrap()).collect());
        assert_eq!(collected, vec![0, 1, 4, 9, 16]);
    }

    /// The producer may await external futures between yields
    #[test]
    fn test_external_awaits() {
        let gate = Arc::new(AsyncManualResetEvent::new(false));
        let mut generator = {
            let gate = gate.clone();
            AsyncGenerator::<&'static str>::new(move |mut y| async move {
                y.yield_("before").await;
                gate.wait().await;
                y.yield_("after").await;
                Ok(())
            })
        };

        let opener = {
            let gate = gate.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                gate.set();
            })
        };

        sync_wait(async {
            assert_eq!(generator.next().await.unwrap().unwrap(), "before");
            assert_eq!(generator.next().await.unwrap().unwrap(), "after");
            assert!(generator.next().await.is_none());
        });
        opener.join().unwrap();
    }

    /// A producer error arrives as the final item
    #[test]
    fn test_terminal_error() {
        let mut generator = AsyncGenerator::<u32>::new(|mut y| async move {
            y.yield_(1).await;
            Err(Error::System(5))
        });
        sync_wait(async {
            assert_eq!(generator.next().await.unwrap().unwrap(), 1);
            let err = generator.next().await.unwrap().unwrap_err();
            assert!(matches!(err, Error::System(5)));
            assert!(generator.next().await.is_none());
        });
    }
}
