//! Function application over awaitables.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Lifts `f: A -> B` over a future of `A`.
///
/// Laziness is preserved: nothing runs until the returned future is polled,
/// and `f` runs on whatever thread completes the inner future. `f` is
/// captured by value; to apply a borrowed function, wrap the reference in a
/// closure explicitly.
///
/// # Example
///
///```
/// use subito::combinator::{fmap, sync_wait};
///
/// let doubled = fmap(|x: u32| x * 2, async { 21 });
/// assert_eq!(sync_wait(doubled), 42);
///```
pub fn fmap<F, Fut, B>(f: F, future: Fut) -> FMap<F, Fut>
where
    Fut: Future,
    F: FnOnce(Fut::Output) -> B,
{
    FMap {
        f: Some(f),
        future,
    }
}

/// Method-syntax access to [`fmap`].
pub trait FmapExt: Future + Sized {
    fn fmap<F, B>(self, f: F) -> FMap<F, Self>
    where
        F: FnOnce(Self::Output) -> B,
    {
        fmap(f, self)
    }
}

impl<Fut: Future> FmapExt for Fut {}

/// Future returned by [`fmap`].
#[must_use = "futures do nothing unless polled"]
pub struct FMap<F, Fut> {
    f: Option<F>,
    future: Fut,
}

impl<F, Fut, B> Future for FMap<F, Fut>
where
    Fut: Future,
    F: FnOnce(Fut::Output) -> B,
{
    type Output = B;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `future` is structurally pinned; `f` is never pinned.
        let this = unsafe { self.get_unchecked_mut() };
        let future = unsafe { Pin::new_unchecked(&mut this.future) };
        match future.poll(cx) {
            Poll::Ready(value) => {
                let f = this.f.take().expect("fmap polled after completion");
                Poll::Ready(f(value))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
