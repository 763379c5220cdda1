// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal cancellation-token collaborator.
//!
//! A real cooperative runtime would bring its own cancellation facility;
//! this crate ships the smallest implementation of the interface its
//! `read`/`upgradeable_read`/`write`/`upgrade` operations need to drive
//! cancellation end-to-end: `is_cancelled`, `throw_if_cancelled`, and
//! `register(callback) -> Registration` with `Registration::unregister`.
//!
//! Like the rest of this crate, a [`CancellationToken`] is single-threaded:
//! it is built on `Rc<RefCell<_>>`, not atomics, matching the non-goal of
//! cross-thread coordination.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Cancelled;
use crate::list::{NodeId, WaitList};

struct Inner {
    cancelled: bool,
    callbacks: WaitList<Box<dyn FnMut()>>,
}

/// A handle that can be cancelled exactly once, firing every callback
/// registered with [`register`](CancellationToken::register) at that point.
///
/// A fresh `CancellationToken` behaves as "never cancelled" until
/// [`cancel`](Self::cancel) is called. Callers that want a token that is
/// guaranteed to never fire can simply pass `None::<&CancellationToken>` at
/// call sites that accept `Option<&CancellationToken>`.
#[derive(Clone)]
pub struct CancellationToken(Rc<RefCell<Inner>>);

/// A live registration of a callback with a [`CancellationToken`].
///
/// Dropping a `Registration` without calling [`unregister`](Self::unregister)
/// leaves the callback registered; callers that stop caring about
/// cancellation before it fires (e.g. because their waiter was woken some
/// other way) must unregister explicitly to avoid the callback firing late.
pub struct Registration {
    inner: Rc<RefCell<Inner>>,
    id: Option<NodeId>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Inner {
            cancelled: false,
            callbacks: WaitList::new(),
        })))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.borrow().cancelled
    }

    /// Returns `Err(Cancelled)` if this token has already fired.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if [`cancel`](Self::cancel) has already been
    /// called on this token.
    pub fn throw_if_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() { Err(Cancelled) } else { Ok(()) }
    }

    /// Registers `callback` to run the first time this token is cancelled.
    ///
    /// If the token is already cancelled, `callback` runs immediately,
    /// inline, before this method returns.
    pub fn register(&self, mut callback: impl FnMut() + 'static) -> Registration {
        if self.is_cancelled() {
            callback();
            return Registration { inner: self.0.clone(), id: None };
        }
        let id = self.0.borrow_mut().callbacks.push_back(Box::new(callback));
        Registration { inner: self.0.clone(), id: Some(id) }
    }

    /// Cancels this token, firing every still-registered callback in
    /// registration order. A second call is a no-op.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn cancel(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.cancelled {
            return;
        }
        inner.cancelled = true;
        let callbacks = inner.callbacks.drain_all();
        drop(inner);
        for mut callback in callbacks {
            callback();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Registration {
    /// Removes the associated callback so it will not fire on a later
    /// cancellation. No-op if the callback already fired or was already
    /// unregistered.
    pub fn unregister(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.borrow_mut().callbacks.remove(id);
        }
    }
}
