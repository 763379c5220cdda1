// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative, single-threaded concurrency primitives: an async FIFO
//! rendezvous queue and a fair reader/writer/upgradeable-reader lock.
//!
//! Both primitives assume a single-process, cooperatively-scheduled runtime
//! (one logical thread of execution, driven by an external executor that
//! polls futures to completion). Neither type is `Send` or `Sync`: all
//! shared state lives behind `Rc<RefCell<_>>`, not `Arc<Mutex<_>>` or
//! atomics, because there is never more than one thread to defend against.
//! Sharing a primitive across cooperative tasks on the same thread is just
//! `Clone`/handle passing, not cross-thread coordination.
//!
//! - [`queue::AsyncQueue`] — a many-values FIFO channel. `put` never blocks;
//!   `get` resolves in strict rendezvous order, matching the oldest still-
//!   pending `put` to the oldest still-pending `get`.
//! - [`rwlock::ReaderWriterLock`] — a coordination-only lock (it wraps no
//!   payload) admitting concurrent readers, at most one upgradeable reader,
//!   and an exclusive writer, with an in-place upgrade path from
//!   upgradeable-read to write.
//! - [`cancel::CancellationToken`] — the minimal cancellation collaborator
//!   both primitives' cancellable entry points accept.

pub mod cancel;
pub mod error;
pub(crate) mod list;
pub mod queue;
pub mod rwlock;

pub use cancel::{CancellationToken, Registration};
pub use error::{Cancelled, LockError};
pub use queue::{AsyncQueue, Get};
pub use rwlock::{
    Read, ReadGuard, ReaderWriterLock, Upgrade, UpgradeError, UpgradeableRead,
    UpgradeableReadGuard, Write, WriteGuard,
};
