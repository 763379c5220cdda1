// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use thiserror::Error;

/// A waiter was woken because the [`CancellationToken`](crate::cancel::CancellationToken)
/// it registered with fired, or was already cancelled when it tried to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Errors produced by [`ReaderWriterLock`](crate::rwlock::ReaderWriterLock) handles.
///
/// Both variants are programmer errors, not recoverable conditions: a
/// well-behaved caller never triggers either one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum LockError {
    /// The handle's `release` (or `upgrade`) was called a second time.
    #[error("lock handle was already released")]
    AlreadyReleased,
    /// The handle is no longer the lock's current upgradeable/upgraded
    /// holder (e.g. it was superseded, or never held the role at all).
    #[error("handle is not the lock's current holder for this role")]
    NotCurrentHolder,
}
