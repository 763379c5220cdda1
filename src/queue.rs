// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An asynchronous FIFO rendezvous queue.
//!
//! [`AsyncQueue`] brokers values between any number of [`put`](AsyncQueue::put)
//! and [`get`](AsyncQueue::get) callers. It never blocks on `put`: a value
//! either lands directly in the hands of the head-of-line waiting [`get`],
//! or is buffered for a future `get` to pick up. The two sides rendezvous in
//! strict program order — the k-th `get` always resolves from the k-th `put`.
//!
//! This is the queue `kasync::sync::oneshot` and `kasync::sync::wait_queue`
//! generalize into a many-values primitive: a single buffered slot (oneshot)
//! or a pure wakeup signal (wait_queue) becomes, here, a full FIFO channel of
//! `T` values with the same "resolve the oldest waiter first" discipline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::list::{NodeId, WaitList};

enum Slot<T> {
    Waiting(Option<Waker>),
    Ready(T),
}

struct State<T> {
    available: VecDeque<T>,
    pending: WaitList<Slot<T>>,
}

/// A FIFO queue that brokers values between [`put`](AsyncQueue::put) and
/// [`get`](AsyncQueue::get) callers.
///
/// `AsyncQueue` is single-threaded (`!Send`/`!Sync`): all state lives behind
/// an `Rc<RefCell<_>>`, matching the "no cross-thread coordination" non-goal.
/// Clone the queue (cheap, an `Rc` bump) to share it between tasks on the
/// same cooperative executor.
pub struct AsyncQueue<T> {
    inner: Rc<RefCell<State<T>>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> AsyncQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(State {
                available: VecDeque::new(),
                pending: WaitList::new(),
            })),
        }
    }

    /// Creates a queue pre-populated with `values`, as if each had been
    /// `put` before any `get` was called.
    #[must_use]
    pub fn with_initial(values: impl IntoIterator<Item = T>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(State {
                available: values.into_iter().collect(),
                pending: WaitList::new(),
            })),
        }
    }

    /// The queue's signed size: positive if values are buffered, negative if
    /// consumers are waiting, zero if neither.
    #[must_use]
    pub fn size(&self) -> isize {
        let state = self.inner.borrow();
        if !state.available.is_empty() {
            isize::try_from(state.available.len()).unwrap_or(isize::MAX)
        } else {
            -isize::try_from(state.pending.len()).unwrap_or(isize::MAX)
        }
    }

    /// Delivers `value` to the longest-waiting [`get`], or buffers it if no
    /// one is waiting. Never blocks.
    ///
    /// # Panics
    ///
    /// Never panics in practice; the internal invariant that the head of
    /// `pending` is always a live, still-waiting slot is upheld by
    /// construction (a resolved or dropped waiter always removes itself).
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub fn put(&self, value: T) {
        let mut state = self.inner.borrow_mut();
        let Some(id) = state.pending.front() else {
            state.available.push_back(value);
            return;
        };
        let slot = state.pending.get_mut(id).expect("front node must exist");
        let waker = match core::mem::replace(slot, Slot::Ready(value)) {
            Slot::Waiting(waker) => waker,
            Slot::Ready(_) => unreachable!("a queued waiter already held a value"),
        };
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns a future that resolves to the next value in FIFO order, either
    /// immediately (if one is buffered) or once a matching `put` arrives.
    pub fn get(&self) -> Get<T> {
        Get { inner: self.inner.clone(), id: None }
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`AsyncQueue::get`].
#[must_use = "futures do nothing unless polled"]
pub struct Get<T> {
    inner: Rc<RefCell<State<T>>>,
    id: Option<NodeId>,
}

impl<T> Future for Get<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.inner.borrow_mut();

        if let Some(id) = this.id {
            return match state.pending.get_mut(id) {
                Some(Slot::Ready(_)) => {
                    let Some(Slot::Ready(value)) = state.pending.remove(id) else {
                        unreachable!("slot was just observed to be Ready")
                    };
                    this.id = None;
                    Poll::Ready(value)
                }
                Some(Slot::Waiting(waker)) => {
                    *waker = Some(cx.waker().clone());
                    Poll::Pending
                }
                None => unreachable!("a queued waiter's node disappeared without resolving it"),
            };
        }

        if let Some(value) = state.available.pop_front() {
            return Poll::Ready(value);
        }

        let id = state.pending.push_back(Slot::Waiting(Some(cx.waker().clone())));
        this.id = Some(id);
        Poll::Pending
    }
}

impl<T> Drop for Get<T> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.borrow_mut().pending.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::AsyncQueue;

    #[test]
    fn put_then_get_resolves_immediately() {
        let q = AsyncQueue::new();
        q.put(1);
        assert_eq!(q.get().now_or_never(), Some(1));
    }

    #[test]
    fn get_then_put_resolves_pending_future() {
        let q = AsyncQueue::new();
        let mut fut = Box::pin(q.get());
        assert!(fut.as_mut().now_or_never().is_none());
        q.put(42);
        assert_eq!(futures::executor::block_on(fut), 42);
    }

    #[test]
    fn strict_fifo_rendezvous() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default();

        let q = AsyncQueue::new();
        let g1 = q.get();
        let g2 = q.get();
        q.put("first");
        q.put("second");
        assert_eq!(futures::executor::block_on(g1), "first");
        assert_eq!(futures::executor::block_on(g2), "second");
    }

    #[test]
    fn with_initial_buffers_values() {
        let q = AsyncQueue::with_initial([1, 2, 3]);
        assert_eq!(q.size(), 3);
        assert_eq!(q.get().now_or_never(), Some(1));
        assert_eq!(q.get().now_or_never(), Some(2));
    }

    #[test]
    fn dropping_a_pending_get_does_not_leave_a_phantom_waiter() {
        let q = AsyncQueue::<i32>::new();
        {
            let fut = q.get();
            let mut fut = Box::pin(fut);
            assert!(fut.as_mut().now_or_never().is_none());
        }
        // the dropped `get` must not still be parked, or this `put` would be
        // silently swallowed by a waiter nobody is polling anymore.
        q.put(7);
        assert_eq!(q.get().now_or_never(), Some(7));
    }

    #[test]
    fn size_reflects_buffered_and_waiting_counts() {
        let q = AsyncQueue::<i32>::new();
        assert_eq!(q.size(), 0);
        q.put(1);
        q.put(2);
        assert_eq!(q.size(), 2);
    }
}
