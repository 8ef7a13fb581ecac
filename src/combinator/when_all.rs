//! Await many futures as one.
//!
//! Two flavors:
//!
//! - [`when_all_ready`] waits until *every* input has completed and hands
//!   back all outputs untouched. Failures never short-circuit; the caller
//!   inspects each result.
//! - [`when_all`] waits until every input (with `Result` output) has
//!   completed, then yields the values, or the first error in declaration
//!   order. Later errors are discarded.
//!
//! Both accept heterogeneous tuples (arity 1 to 8) and homogeneous `Vec`s.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{MaybeDone, maybe_done};

/// Awaits every input; completes when all have, with every output intact.
///
/// # Example
///
///```
/// use subito::combinator::{sync_wait, when_all_ready};
///
/// let (a, b) = sync_wait(when_all_ready((async { 1 }, async { "two" })));
/// assert_eq!((a, b), (1, "two"));
///```
pub fn when_all_ready<T: WhenAllReadyInput>(input: T) -> T::Ready {
    input.into_when_all_ready()
}

/// Awaits every input; yields the values or the first error.
///
/// All inputs run to completion before the error is reported, unlike a
/// short-circuiting join; only the error channel is first-wins.
///
/// # Example
///
///```
/// use subito::combinator::{sync_wait, when_all};
/// use subito::error::Error;
///
/// let ok: Result<(u32, u32), Error> =
///     sync_wait(when_all((async { Ok(1) }, async { Ok(2) })));
/// assert_eq!(ok.unwrap(), (1, 2));
///```
pub fn when_all<T: WhenAllInput>(input: T) -> T::All {
    input.into_when_all()
}

/// Inputs accepted by [`when_all_ready`].
pub trait WhenAllReadyInput {
    type Ready: Future;
    fn into_when_all_ready(self) -> Self::Ready;
}

/// Inputs accepted by [`when_all`].
pub trait WhenAllInput {
    type All: Future;
    fn into_when_all(self) -> Self::All;
}

/// Pin-projects a pinned boxed slice element-by-element.
fn iter_pin_mut<T>(slice: Pin<&mut [T]>) -> impl Iterator<Item = Pin<&mut T>> {
    // SAFETY: the elements live in a pinned allocation and are never moved.
    unsafe { slice.get_unchecked_mut() }
        .iter_mut()
        .map(|t| unsafe { Pin::new_unchecked(t) })
}

/// Future returned by [`when_all_ready`] on a `Vec`.
#[must_use = "futures do nothing unless polled"]
pub struct WhenAllReadyVec<F: Future> {
    children: Pin<Box<[MaybeDone<F>]>>,
}

impl<F: Future> Future for WhenAllReadyVec<F> {
    type Output = Vec<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut all_done = true;
        for child in iter_pin_mut(self.children.as_mut()) {
            if child.poll(cx).is_pending() {
                all_done = false;
            }
        }
        if !all_done {
            return Poll::Pending;
        }
        let outputs = iter_pin_mut(self.children.as_mut())
            .map(|child| {
                child
                    .take_output()
                    .expect("when_all_ready polled after completion")
            })
            .collect();
        Poll::Ready(outputs)
    }
}

impl<F: Future> WhenAllReadyInput for Vec<F> {
    type Ready = WhenAllReadyVec<F>;

    fn into_when_all_ready(self) -> Self::Ready {
        WhenAllReadyVec {
            children: Box::into_pin(
                self.into_iter()
                    .map(maybe_done)
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            ),
        }
    }
}

/// Future returned by [`when_all`] on a `Vec`.
#[must_use = "futures do nothing unless polled"]
pub struct WhenAllVec<F: Future> {
    inner: WhenAllReadyVec<F>,
}

impl<F: Future> Unpin for WhenAllVec<F> {}

impl<F, T, E> Future for WhenAllVec<F>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = Result<Vec<T>, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            // collect() stops at the first error in order; later errors are
            // dropped with their results.
            Poll::Ready(results) => Poll::Ready(results.into_iter().collect()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F, T, E> WhenAllInput for Vec<F>
where
    F: Future<Output = Result<T, E>>,
{
    type All = WhenAllVec<F>;

    fn into_when_all(self) -> Self::All {
        WhenAllVec {
            inner: self.into_when_all_ready(),
        }
    }
}

macro_rules! tuple_when_all {
    ($Ready:ident, $All:ident; $(($F:ident, $T:ident, $value:ident, $idx:tt)),+) => {
        /// Future returned by [`when_all_ready`] on a tuple of this arity.
        #[must_use = "futures do nothing unless polled"]
        pub struct $Ready<$($F: Future),+>($(MaybeDone<$F>),+);

        impl<$($F: Future),+> Future for $Ready<$($F),+> {
            type Output = ($($F::Output,)+);

            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let mut all_done = true;
                $(
                    // SAFETY: each child is structurally pinned.
                    if unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.$idx) }
                        .poll(cx)
                        .is_pending()
                    {
                        all_done = false;
                    }
                )+
                if !all_done {
                    return Poll::Pending;
                }
                Poll::Ready(($(
                    unsafe { self.as_mut().map_unchecked_mut(|s| &mut s.$idx) }
                        .take_output()
                        .expect("when_all_ready polled after completion"),
                )+))
            }
        }

        impl<$($F: Future),+> WhenAllReadyInput for ($($F,)+) {
            type Ready = $Ready<$($F),+>;

            fn into_when_all_ready(self) -> Self::Ready {
                $Ready($(maybe_done(self.$idx)),+)
            }
        }

        /// Future returned by [`when_all`] on a tuple of this arity.
        #[must_use = "futures do nothing unless polled"]
        pub struct $All<$($F: Future),+> {
            inner: $Ready<$($F),+>,
        }

        impl<Err, $($F, $T),+> Future for $All<$($F),+>
        where
            $($F: Future<Output = Result<$T, Err>>,)+
        {
            type Output = Result<($($T,)+), Err>;

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                // SAFETY: `inner` is structurally pinned.
                let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
                match inner.poll(cx) {
                    Poll::Ready(($($value,)+)) => {
                        // First error in declaration order wins.
                        Poll::Ready((|| -> Result<($($T,)+), Err> { Ok(($($value?,)+)) })())
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }

        impl<Err, $($F, $T),+> WhenAllInput for ($($F,)+)
        where
            $($F: Future<Output = Result<$T, Err>>,)+
        {
            type All = $All<$($F),+>;

            fn into_when_all(self) -> Self::All {
                $All {
                    inner: self.into_when_all_ready(),
                }
            }
        }
    };
}

#[rustfmt::skip]
mod tuples {
    use super::*;

    tuple_when_all!(WhenAllReady1, WhenAll1; (F1, T1, v1, 0));
    tuple_when_all!(WhenAllReady2, WhenAll2; (F1, T1, v1, 0), (F2, T2, v2, 1));
    tuple_when_all!(WhenAllReady3, WhenAll3; (F1, T1, v1, 0), (F2, T2, v2, 1), (F3, T3, v3, 2));
    tuple_when_all!(WhenAllReady4, WhenAll4; (F1, T1, v1, 0), (F2, T2, v2, 1), (F3, T3, v3, 2), (F4, T4, v4, 3));
    tuple_when_all!(WhenAllReady5, WhenAll5; (F1, T1, v1, 0), (F2, T2, v2, 1), (F3, T3, v3, 2), (F4, T4, v4, 3), (F5, T5, v5, 4));
    tuple_when_all!(WhenAllReady6, WhenAll6; (F1, T1, v1, 0), (F2, T2, v2, 1), (F3, T3, v3, 2), (F4, T4, v4, 3), (F5, T5, v5, 4), (F6, T6, v6, 5));
    tuple_when_all!(WhenAllReady7, WhenAll7; (F1, T1, v1, 0), (F2, T2, v2, 1), (F3, T3, v3, 2), (F4, T4, v4, 3), (F5, T5, v5, 4), (F6, T6, v6, 5), (F7, T7, v7, 6));
    tuple_when_all!(WhenAllReady8, WhenAll8; (F1, T1, v1, 0), (F2, T2, v2, 1), (F3, T3, v3, 2), (F4, T4, v4, 3), (F5, T5, v5, 4), (F6, T6, v6, 5), (F7, T7, v7, 6), (F8, T8, v8, 7));
}

pub use tuples::*;
