// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fair, four-role reader/writer/upgradeable-reader/upgraded-writer lock.
//!
//! [`ReaderWriterLock`] admits any number of concurrent [`read`](ReaderWriterLock::read)
//! holders, at most one [`upgradeable_read`](ReaderWriterLock::upgradeable_read)
//! holder (which may itself coexist with plain readers), and at most one
//! [`write`](ReaderWriterLock::write) holder to the exclusion of everyone
//! else. An upgradeable reader can additionally call
//! [`upgrade`](UpgradeableReadGuard::upgrade) to wait out the remaining
//! plain readers and become the sole writer without ever releasing the lock
//! in between.
//!
//! Like [`crate::queue::AsyncQueue`], this is single-threaded: state lives
//! behind an `Rc<RefCell<_>>`, and fairness is enforced by four
//! [`WaitList`]s rather than atomics, matching `kasync::sync::wait_queue`'s
//! wake-one/wake-all split but without the lock-free, intrusive machinery
//! that design needs to survive concurrent pollers.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::cancel::{CancellationToken, Registration};
use crate::error::{Cancelled, LockError};
use crate::list::{NodeId, WaitList};

/// Identifies a single upgradeable-reader admission, so a guard can tell
/// whether it is still the lock's current upgradeable holder.
type HandleId = u64;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Ready,
    Cancelled,
}

struct WaiterNode<P> {
    waker: RefCell<Option<Waker>>,
    outcome: Cell<Outcome>,
    /// Set only for a queued [`Upgrade`] whose originating upgradeable
    /// handle was released before the upgrade was ever admitted. Read by
    /// `Upgrade::poll` to tell that apart from a real token cancellation.
    stale: Cell<bool>,
    payload: P,
}

impl<P> WaiterNode<P> {
    fn new(waker: Waker, payload: P) -> Self {
        Self {
            waker: RefCell::new(Some(waker)),
            outcome: Cell::new(Outcome::Pending),
            stale: Cell::new(false),
            payload,
        }
    }
}

fn resolve<P>(node: &Rc<WaiterNode<P>>) {
    node.outcome.set(Outcome::Ready);
    if let Some(waker) = node.waker.borrow_mut().take() {
        waker.wake();
    }
}

/// Rejects a queued waiter whose admission became permanently impossible
/// for a reason other than cancellation or normal scheduling (currently:
/// an upgrade whose upgradeable handle was released out from under it).
fn reject_stale<P>(node: &Rc<WaiterNode<P>>) {
    node.stale.set(true);
    node.outcome.set(Outcome::Cancelled);
    if let Some(waker) = node.waker.borrow_mut().take() {
        waker.wake();
    }
}

struct State {
    /// >0: that many readers hold the lock. 0: free. -1: a writer (plain or
    /// upgraded) holds the lock.
    count: i64,
    upgradeable: Option<HandleId>,
    upgraded: Option<HandleId>,
    next_id: HandleId,
    readers: WaitList<Rc<WaiterNode<()>>>,
    upgradeables: WaitList<Rc<WaiterNode<HandleId>>>,
    upgrades: WaitList<Rc<WaiterNode<()>>>,
    writers: WaitList<Rc<WaiterNode<()>>>,
}

impl State {
    fn can_take_read(&self) -> bool {
        self.count >= 0 && self.writers.is_empty() && self.upgrades.is_empty()
    }

    fn can_take_upgradeable_read(&self) -> bool {
        self.count >= 0 && self.upgradeable.is_none()
    }

    fn can_take_write(&self) -> bool {
        self.count == 0
    }

    fn can_take_upgrade(&self) -> bool {
        self.count == 1 && self.upgradeable.is_some() && self.upgraded.is_none()
    }

    fn next_handle_id(&mut self) -> HandleId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Re-evaluates every waiter queue in priority order — writers, then a
/// pending upgrade, then a pending upgradeable reader, then all plain
/// readers — stopping as soon as one step admits a waiter. Called after
/// every release, since a release is the only thing that can free capacity.
fn reschedule(state: &mut State) {
    if state.can_take_write() {
        if let Some(id) = state.writers.front() {
            let node = state.writers.remove(id).expect("front handle is valid");
            state.count = -1;
            resolve(&node);
            return;
        }
    }

    if state.can_take_upgrade() {
        if let Some(id) = state.upgrades.front() {
            let node = state.upgrades.remove(id).expect("front handle is valid");
            state.count = -1;
            state.upgraded = state.upgradeable;
            resolve(&node);
            return;
        }
    }

    if state.can_take_upgradeable_read() {
        if let Some(id) = state.upgradeables.front() {
            let node = state.upgradeables.remove(id).expect("front handle is valid");
            state.count += 1;
            state.upgradeable = Some(node.payload);
            resolve(&node);
            return;
        }
    }

    if state.can_take_read() && !state.readers.is_empty() {
        let nodes = state.readers.drain_all();
        state.count += i64::try_from(nodes.len()).unwrap_or(i64::MAX);
        for node in &nodes {
            resolve(node);
        }
    }
}

/// A fair reader/writer/upgradeable-reader/upgraded-writer lock.
///
/// `ReaderWriterLock` guards no payload of its own — like .NET's
/// `AsyncReaderWriterLock`, it is a pure coordination gate. Pair it with
/// whatever data it protects by embedding a guard alongside that data, or by
/// holding the lock in the same `Rc` as the data it guards.
///
/// There is no re-entry: acquiring a second role from a task that already
/// holds one will deadlock against itself exactly as it would for any other
/// cooperative lock.
pub struct ReaderWriterLock {
    inner: Rc<RefCell<State>>,
}

impl ReaderWriterLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(State {
                count: 0,
                upgradeable: None,
                upgraded: None,
                next_id: 0,
                readers: WaitList::new(),
                upgradeables: WaitList::new(),
                upgrades: WaitList::new(),
                writers: WaitList::new(),
            })),
        }
    }

    /// Returns a future resolving to a [`ReadGuard`] once no writer holds or
    /// is waiting for the lock. Equivalent to `read_cancellable(None)`.
    pub fn read(&self) -> Read {
        self.read_cancellable(None)
    }

    /// Like [`read`](Self::read), but resolves to `Err(Cancelled)` if `token`
    /// fires before admission.
    pub fn read_cancellable(&self, token: Option<CancellationToken>) -> Read {
        Read {
            lock: self.inner.clone(),
            token,
            phase: Phase::Start,
        }
    }

    /// Returns a future resolving to an [`UpgradeableReadGuard`] once no
    /// writer holds or is waiting and no other upgradeable reader holds the
    /// lock. Equivalent to `upgradeable_read_cancellable(None)`.
    pub fn upgradeable_read(&self) -> UpgradeableRead {
        self.upgradeable_read_cancellable(None)
    }

    /// Like [`upgradeable_read`](Self::upgradeable_read), but resolves to
    /// `Err(Cancelled)` if `token` fires before admission.
    pub fn upgradeable_read_cancellable(&self, token: Option<CancellationToken>) -> UpgradeableRead {
        UpgradeableRead {
            lock: self.inner.clone(),
            token,
            phase: Phase::Start,
        }
    }

    /// Returns a future resolving to a [`WriteGuard`] once the lock is
    /// completely free. Equivalent to `write_cancellable(None)`.
    pub fn write(&self) -> Write {
        self.write_cancellable(None)
    }

    /// Like [`write`](Self::write), but resolves to `Err(Cancelled)` if
    /// `token` fires before admission.
    pub fn write_cancellable(&self, token: Option<CancellationToken>) -> Write {
        Write {
            lock: self.inner.clone(),
            token,
            phase: Phase::Start,
        }
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A held read lock. Dropping it (or calling [`release`](Self::release))
/// relinquishes it.
pub struct ReadGuard {
    lock: Rc<RefCell<State>>,
    released: Cell<bool>,
}

impl ReadGuard {
    fn new(lock: Rc<RefCell<State>>) -> Self {
        Self { lock, released: Cell::new(false) }
    }

    /// Releases this read lock early.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyReleased`] if this guard was already
    /// released, by this call or by being dropped.
    pub fn release(&self) -> Result<(), LockError> {
        if self.released.replace(true) {
            return Err(LockError::AlreadyReleased);
        }
        let mut state = self.lock.borrow_mut();
        state.count -= 1;
        reschedule(&mut state);
        Ok(())
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            let mut state = self.lock.borrow_mut();
            state.count -= 1;
            reschedule(&mut state);
        }
    }
}

/// A held upgradeable-read lock: a read lock that may coexist with plain
/// readers, but at most one of which may be outstanding at a time, and which
/// may [`upgrade`](Self::upgrade) into exclusive write access.
pub struct UpgradeableReadGuard {
    lock: Rc<RefCell<State>>,
    id: HandleId,
    released: Cell<bool>,
}

impl UpgradeableReadGuard {
    fn new(lock: Rc<RefCell<State>>, id: HandleId) -> Self {
        Self { lock, id, released: Cell::new(false) }
    }

    /// Releases this upgradeable-read lock early.
    ///
    /// If this guard currently has a completed upgrade outstanding (i.e. its
    /// [`WriteGuard`] has not been released yet), this releases both: the
    /// upgrade is implicitly given up along with the upgradeable role.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyReleased`] if this guard was already
    /// released, by this call or by being dropped.
    pub fn release(&self) -> Result<(), LockError> {
        if self.released.replace(true) {
            return Err(LockError::AlreadyReleased);
        }
        self.release_locked();
        Ok(())
    }

    fn release_locked(&self) {
        let mut state = self.lock.borrow_mut();
        debug_assert_eq!(state.upgradeable, Some(self.id));
        if state.upgraded == Some(self.id) {
            state.count = 0;
            state.upgraded = None;
        } else {
            state.count -= 1;
        }
        state.upgradeable = None;
        // any queued `upgrade()` belongs to this handle (only one
        // upgradeable reader, and hence one upgrade path, exists at a
        // time) and can never be admitted once `upgradeable` is cleared.
        for node in state.upgrades.drain_all() {
            reject_stale(&node);
        }
        reschedule(&mut state);
    }

    /// Returns a future resolving to a [`WriteGuard`] once every other
    /// reader has released, without ever giving up this lock's grip in
    /// between. Equivalent to `upgrade_cancellable(None)`.
    pub fn upgrade(&self) -> Upgrade {
        self.upgrade_cancellable(None)
    }

    /// Like [`upgrade`](Self::upgrade), but resolves to
    /// `Err(UpgradeError::Cancelled)` if `token` fires before admission.
    pub fn upgrade_cancellable(&self, token: Option<CancellationToken>) -> Upgrade {
        Upgrade {
            lock: self.lock.clone(),
            id: self.id,
            token,
            phase: Phase::Start,
        }
    }
}

impl Drop for UpgradeableReadGuard {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            self.release_locked();
        }
    }
}

enum Origin {
    Plain,
    Upgraded,
}

/// A held write lock, granted either by [`ReaderWriterLock::write`] or by
/// [`UpgradeableReadGuard::upgrade`]. Both share this type; releasing one
/// gained through an upgrade leaves the originating [`UpgradeableReadGuard`]
/// live, as documented there.
pub struct WriteGuard {
    lock: Rc<RefCell<State>>,
    origin: Origin,
    released: Cell<bool>,
}

impl WriteGuard {
    fn new(lock: Rc<RefCell<State>>, origin: Origin) -> Self {
        Self { lock, origin, released: Cell::new(false) }
    }

    /// Releases this write lock early.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyReleased`] if this guard was already
    /// released, by this call or by being dropped.
    pub fn release(&self) -> Result<(), LockError> {
        if self.released.replace(true) {
            return Err(LockError::AlreadyReleased);
        }
        self.release_locked();
        Ok(())
    }

    fn release_locked(&self) {
        let mut state = self.lock.borrow_mut();
        match self.origin {
            Origin::Plain => state.count = 0,
            Origin::Upgraded => {
                state.upgraded = None;
                state.count = 1;
            }
        }
        reschedule(&mut state);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            self.release_locked();
        }
    }
}

/// An error from [`UpgradeableReadGuard::upgrade`]: either the upgrade was
/// cancelled, or the guard attempting it is no longer the lock's current
/// upgradeable holder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpgradeError {
    Cancelled,
    NotCurrentHolder,
}

impl From<Cancelled> for UpgradeError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

enum Phase<P> {
    Start,
    Queued { id: NodeId, node: Rc<WaiterNode<P>>, reg: Option<Registration> },
    Done,
}

fn cancel_readers(lock: &Rc<RefCell<State>>, id: NodeId, node: &Rc<WaiterNode<()>>) {
    let removed = lock.borrow_mut().readers.remove(id).is_some();
    if removed {
        node.outcome.set(Outcome::Cancelled);
        if let Some(waker) = node.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

fn cancel_upgradeables(lock: &Rc<RefCell<State>>, id: NodeId, node: &Rc<WaiterNode<HandleId>>) {
    let removed = lock.borrow_mut().upgradeables.remove(id).is_some();
    if removed {
        node.outcome.set(Outcome::Cancelled);
        if let Some(waker) = node.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

fn cancel_upgrades(lock: &Rc<RefCell<State>>, id: NodeId, node: &Rc<WaiterNode<()>>) {
    let removed = lock.borrow_mut().upgrades.remove(id).is_some();
    if removed {
        node.outcome.set(Outcome::Cancelled);
        if let Some(waker) = node.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

fn cancel_writers(lock: &Rc<RefCell<State>>, id: NodeId, node: &Rc<WaiterNode<()>>) {
    let removed = lock.borrow_mut().writers.remove(id).is_some();
    if removed {
        node.outcome.set(Outcome::Cancelled);
        if let Some(waker) = node.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Future returned by [`ReaderWriterLock::read`] and
/// [`ReaderWriterLock::read_cancellable`].
#[must_use = "futures do nothing unless polled"]
pub struct Read {
    lock: Rc<RefCell<State>>,
    token: Option<CancellationToken>,
    phase: Phase<()>,
}

impl Future for Read {
    type Output = Result<ReadGuard, Cancelled>;

    #[tracing::instrument(level = "trace", name = "Read::poll", skip_all)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            Phase::Start => {
                if let Some(token) = &this.token {
                    token.throw_if_cancelled()?;
                }
                let mut state = this.lock.borrow_mut();
                if state.can_take_read() {
                    state.count += 1;
                    drop(state);
                    this.phase = Phase::Done;
                    return Poll::Ready(Ok(ReadGuard::new(this.lock.clone())));
                }
                let node = Rc::new(WaiterNode::new(cx.waker().clone(), ()));
                let id = state.readers.push_back(node.clone());
                drop(state);
                let reg = this.token.as_ref().map(|token| {
                    let lock = this.lock.clone();
                    let node = node.clone();
                    token.register(move || cancel_readers(&lock, id, &node))
                });
                this.phase = Phase::Queued { id, node, reg };
                Poll::Pending
            }
            Phase::Queued { node, .. } => match node.outcome.get() {
                Outcome::Pending => {
                    *node.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                Outcome::Ready => {
                    let guard = ReadGuard::new(this.lock.clone());
                    this.phase = Phase::Done;
                    Poll::Ready(Ok(guard))
                }
                Outcome::Cancelled => {
                    this.phase = Phase::Done;
                    Poll::Ready(Err(Cancelled))
                }
            },
            Phase::Done => panic!("Read polled after completion"),
        }
    }
}

impl Drop for Read {
    /// A `Read` dropped while still parked must not leave a waiter behind:
    /// a node no one will ever poll again would eventually be popped by
    /// [`reschedule`], incrementing `count` for an acquisition that will
    /// never be released.
    fn drop(&mut self) {
        if let Phase::Queued { id, node, .. } = &self.phase {
            let mut state = self.lock.borrow_mut();
            if state.readers.remove(*id).is_none() && node.outcome.get() == Outcome::Ready {
                // already popped by `reschedule` and granted a read slot
                // that this future will now never hand to a guard.
                state.count -= 1;
                reschedule(&mut state);
            }
        }
    }
}

/// Future returned by [`ReaderWriterLock::upgradeable_read`] and
/// [`ReaderWriterLock::upgradeable_read_cancellable`].
#[must_use = "futures do nothing unless polled"]
pub struct UpgradeableRead {
    lock: Rc<RefCell<State>>,
    token: Option<CancellationToken>,
    phase: Phase<HandleId>,
}

impl Future for UpgradeableRead {
    type Output = Result<UpgradeableReadGuard, Cancelled>;

    #[tracing::instrument(level = "trace", name = "UpgradeableRead::poll", skip_all)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            Phase::Start => {
                if let Some(token) = &this.token {
                    token.throw_if_cancelled()?;
                }
                let mut state = this.lock.borrow_mut();
                let id = state.next_handle_id();
                if state.can_take_upgradeable_read() {
                    state.count += 1;
                    state.upgradeable = Some(id);
                    drop(state);
                    this.phase = Phase::Done;
                    return Poll::Ready(Ok(UpgradeableReadGuard::new(this.lock.clone(), id)));
                }
                let node = Rc::new(WaiterNode::new(cx.waker().clone(), id));
                let node_id = state.upgradeables.push_back(node.clone());
                drop(state);
                let reg = this.token.as_ref().map(|token| {
                    let lock = this.lock.clone();
                    let node = node.clone();
                    token.register(move || cancel_upgradeables(&lock, node_id, &node))
                });
                this.phase = Phase::Queued { id: node_id, node, reg };
                Poll::Pending
            }
            Phase::Queued { node, .. } => match node.outcome.get() {
                Outcome::Pending => {
                    *node.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                Outcome::Ready => {
                    let guard = UpgradeableReadGuard::new(this.lock.clone(), node.payload);
                    this.phase = Phase::Done;
                    Poll::Ready(Ok(guard))
                }
                Outcome::Cancelled => {
                    this.phase = Phase::Done;
                    Poll::Ready(Err(Cancelled))
                }
            },
            Phase::Done => panic!("UpgradeableRead polled after completion"),
        }
    }
}

impl Drop for UpgradeableRead {
    /// Mirrors [`Read`]'s drop handling: a parked or already-granted
    /// upgradeable-read waiter must not be abandoned without unwinding its
    /// effect on `state`.
    fn drop(&mut self) {
        if let Phase::Queued { id, node, .. } = &self.phase {
            let mut state = self.lock.borrow_mut();
            if state.upgradeables.remove(*id).is_none() && node.outcome.get() == Outcome::Ready {
                state.upgradeable = None;
                state.count -= 1;
                reschedule(&mut state);
            }
        }
    }
}

/// Future returned by [`ReaderWriterLock::write`] and
/// [`ReaderWriterLock::write_cancellable`].
#[must_use = "futures do nothing unless polled"]
pub struct Write {
    lock: Rc<RefCell<State>>,
    token: Option<CancellationToken>,
    phase: Phase<()>,
}

impl Future for Write {
    type Output = Result<WriteGuard, Cancelled>;

    #[tracing::instrument(level = "trace", name = "Write::poll", skip_all)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            Phase::Start => {
                if let Some(token) = &this.token {
                    token.throw_if_cancelled()?;
                }
                let mut state = this.lock.borrow_mut();
                if state.can_take_write() {
                    state.count = -1;
                    drop(state);
                    this.phase = Phase::Done;
                    return Poll::Ready(Ok(WriteGuard::new(this.lock.clone(), Origin::Plain)));
                }
                let node = Rc::new(WaiterNode::new(cx.waker().clone(), ()));
                let id = state.writers.push_back(node.clone());
                drop(state);
                let reg = this.token.as_ref().map(|token| {
                    let lock = this.lock.clone();
                    let node = node.clone();
                    token.register(move || cancel_writers(&lock, id, &node))
                });
                this.phase = Phase::Queued { id, node, reg };
                Poll::Pending
            }
            Phase::Queued { node, .. } => match node.outcome.get() {
                Outcome::Pending => {
                    *node.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                Outcome::Ready => {
                    let guard = WriteGuard::new(this.lock.clone(), Origin::Plain);
                    this.phase = Phase::Done;
                    Poll::Ready(Ok(guard))
                }
                Outcome::Cancelled => {
                    this.phase = Phase::Done;
                    Poll::Ready(Err(Cancelled))
                }
            },
            Phase::Done => panic!("Write polled after completion"),
        }
    }
}

impl Drop for Write {
    /// Mirrors [`Read`]'s drop handling: a parked or already-granted writer
    /// must not be abandoned without unwinding its effect on `state`.
    fn drop(&mut self) {
        if let Phase::Queued { id, node, .. } = &self.phase {
            let mut state = self.lock.borrow_mut();
            if state.writers.remove(*id).is_none() && node.outcome.get() == Outcome::Ready {
                state.count = 0;
                reschedule(&mut state);
            }
        }
    }
}

/// Future returned by [`UpgradeableReadGuard::upgrade`] and
/// [`UpgradeableReadGuard::upgrade_cancellable`].
#[must_use = "futures do nothing unless polled"]
pub struct Upgrade {
    lock: Rc<RefCell<State>>,
    id: HandleId,
    token: Option<CancellationToken>,
    phase: Phase<()>,
}

impl Future for Upgrade {
    type Output = Result<WriteGuard, UpgradeError>;

    #[tracing::instrument(level = "trace", name = "Upgrade::poll", skip_all)]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.phase {
            Phase::Start => {
                if let Some(token) = &this.token {
                    token.throw_if_cancelled()?;
                }
                let mut state = this.lock.borrow_mut();
                if state.upgradeable != Some(this.id) {
                    return Poll::Ready(Err(UpgradeError::NotCurrentHolder));
                }
                if state.can_take_upgrade() {
                    state.count = -1;
                    state.upgraded = Some(this.id);
                    drop(state);
                    this.phase = Phase::Done;
                    return Poll::Ready(Ok(WriteGuard::new(this.lock.clone(), Origin::Upgraded)));
                }
                let node = Rc::new(WaiterNode::new(cx.waker().clone(), ()));
                let id = state.upgrades.push_back(node.clone());
                drop(state);
                let reg = this.token.as_ref().map(|token| {
                    let lock = this.lock.clone();
                    let node = node.clone();
                    token.register(move || cancel_upgrades(&lock, id, &node))
                });
                this.phase = Phase::Queued { id, node, reg };
                Poll::Pending
            }
            Phase::Queued { node, .. } => match node.outcome.get() {
                Outcome::Pending => {
                    *node.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                Outcome::Ready => {
                    let guard = WriteGuard::new(this.lock.clone(), Origin::Upgraded);
                    this.phase = Phase::Done;
                    Poll::Ready(Ok(guard))
                }
                Outcome::Cancelled => {
                    this.phase = Phase::Done;
                    if node.stale.get() {
                        Poll::Ready(Err(UpgradeError::NotCurrentHolder))
                    } else {
                        Poll::Ready(Err(UpgradeError::Cancelled))
                    }
                }
            },
            Phase::Done => panic!("Upgrade polled after completion"),
        }
    }
}

impl Drop for Upgrade {
    /// Mirrors [`Read`]'s drop handling: a parked or already-granted
    /// upgrade must not be abandoned without unwinding its effect on
    /// `state`. Note an already-granted upgrade restores `count = 1` (the
    /// upgradeable census), not `0` — the originating upgradeable handle is
    /// still live and was never given up.
    fn drop(&mut self) {
        if let Phase::Queued { id, node, .. } = &self.phase {
            let mut state = self.lock.borrow_mut();
            if state.upgrades.remove(*id).is_none() && node.outcome.get() == Outcome::Ready {
                state.upgraded = None;
                state.count = 1;
                reschedule(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    use super::ReaderWriterLock;
    use crate::cancel::CancellationToken;

    #[test]
    fn writer_excludes_readers() {
        let lock = ReaderWriterLock::new();
        let w = lock.write().now_or_never().unwrap().unwrap();
        assert!(lock.read().now_or_never().is_none());
        w.release().unwrap();
        assert!(lock.read().now_or_never().is_some());
    }

    #[test]
    fn readers_share_the_lock() {
        let lock = ReaderWriterLock::new();
        let r1 = lock.read().now_or_never().unwrap().unwrap();
        let r2 = lock.read().now_or_never().unwrap().unwrap();
        assert!(lock.write().now_or_never().is_none());
        r1.release().unwrap();
        assert!(lock.write().now_or_never().is_none());
        r2.release().unwrap();
        assert!(lock.write().now_or_never().is_some());
    }

    #[test]
    fn queued_readers_are_woken_as_a_batch_once_writer_releases() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default();

        let lock = ReaderWriterLock::new();
        let w = lock.write().now_or_never().unwrap().unwrap();
        let mut r1 = Box::pin(lock.read());
        let mut r2 = Box::pin(lock.read());
        assert!(r1.as_mut().now_or_never().is_none());
        assert!(r2.as_mut().now_or_never().is_none());
        w.release().unwrap();
        assert!(futures::executor::block_on(r1).is_ok());
        assert!(futures::executor::block_on(r2).is_ok());
    }

    #[test]
    fn upgradeable_reader_coexists_with_plain_readers() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let r = lock.read().now_or_never().unwrap().unwrap();
        assert!(lock.upgradeable_read().now_or_never().is_none());
        r.release().unwrap();
        u.release().unwrap();
    }

    #[test]
    fn upgrade_waits_for_other_readers_to_release() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let r = lock.read().now_or_never().unwrap().unwrap();
        let mut upgrade = Box::pin(u.upgrade());
        assert!(upgrade.as_mut().now_or_never().is_none());
        r.release().unwrap();
        let w = futures::executor::block_on(upgrade).unwrap();
        assert!(lock.read().now_or_never().is_none());
        w.release().unwrap();
        assert!(lock.read().now_or_never().is_some());
    }

    #[test]
    fn releasing_an_upgraded_write_guard_leaves_upgradeable_guard_live() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let w = u.upgrade().now_or_never().unwrap().unwrap();
        w.release().unwrap();
        assert!(lock.read().now_or_never().is_some());
        u.release().unwrap();
    }

    #[test]
    fn releasing_upgradeable_guard_while_upgraded_releases_both() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let _w = u.upgrade().now_or_never().unwrap().unwrap();
        u.release().unwrap();
        assert!(lock.write().now_or_never().is_some());
    }

    #[test]
    fn cancelling_a_queued_writer_does_not_leave_a_phantom_waiter() {
        let lock = ReaderWriterLock::new();
        let r = lock.read().now_or_never().unwrap().unwrap();
        let token = CancellationToken::new();
        let mut w = Box::pin(lock.write_cancellable(Some(token.clone())));
        assert!(w.as_mut().now_or_never().is_none());
        token.cancel();
        assert!(futures::executor::block_on(w).is_err());
        // a reader queued behind the cancelled writer must still be grantable
        r.release().unwrap();
        assert!(lock.read().now_or_never().is_some());
    }

    #[test]
    fn second_release_is_an_error() {
        let lock = ReaderWriterLock::new();
        let r = lock.read().now_or_never().unwrap().unwrap();
        r.release().unwrap();
        assert!(r.release().is_err());
    }

    #[test]
    fn upgrade_from_a_stale_handle_fails() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        u.release().unwrap();
        assert!(u.upgrade().now_or_never().unwrap().is_err());
    }

    #[test]
    fn dropping_a_parked_reader_does_not_corrupt_the_census() {
        let lock = ReaderWriterLock::new();
        let w = lock.write().now_or_never().unwrap().unwrap();
        let mut r = Box::pin(lock.read());
        assert!(r.as_mut().now_or_never().is_none());
        drop(r);
        w.release().unwrap();
        let w2 = lock.write().now_or_never();
        assert!(w2.is_some());
    }

    #[test]
    fn dropping_an_already_granted_but_unpolled_reader_releases_it() {
        let lock = ReaderWriterLock::new();
        let w = lock.write().now_or_never().unwrap().unwrap();
        let mut r = Box::pin(lock.read());
        assert!(r.as_mut().now_or_never().is_none());
        // release wakes the parked reader (granting it a slot) before the
        // future is ever polled again to turn that grant into a guard.
        w.release().unwrap();
        drop(r);
        assert!(lock.write().now_or_never().is_some());
    }

    #[test]
    fn dropping_a_parked_writer_does_not_corrupt_the_census() {
        let lock = ReaderWriterLock::new();
        let r = lock.read().now_or_never().unwrap().unwrap();
        let mut w = Box::pin(lock.write());
        assert!(w.as_mut().now_or_never().is_none());
        drop(w);
        r.release().unwrap();
        assert!(lock.write().now_or_never().is_some());
    }

    #[test]
    fn dropping_a_parked_upgrade_does_not_corrupt_the_census() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let r = lock.read().now_or_never().unwrap().unwrap();
        let mut upgrade = Box::pin(u.upgrade());
        assert!(upgrade.as_mut().now_or_never().is_none());
        drop(upgrade);
        r.release().unwrap();
        // the upgradeable handle is still live and can still upgrade.
        assert!(u.upgrade().now_or_never().unwrap().is_ok());
    }

    #[test]
    fn releasing_upgradeable_guard_excises_its_own_stranded_upgrade() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let r = lock.read().now_or_never().unwrap().unwrap();
        let mut upgrade = Box::pin(u.upgrade());
        assert!(upgrade.as_mut().now_or_never().is_none());
        // releasing the upgradeable guard while its own upgrade is still
        // queued must not strand that upgrade: it can never be admitted
        // again once `upgradeable` is cleared, so it has to be rejected.
        u.release().unwrap();
        assert!(futures::executor::block_on(upgrade).is_err());
        r.release().unwrap();
        assert!(lock.write().now_or_never().is_some());
    }

    #[test]
    fn dropping_upgradeable_guard_excises_its_own_stranded_upgrade() {
        let lock = ReaderWriterLock::new();
        let u = lock.upgradeable_read().now_or_never().unwrap().unwrap();
        let r = lock.read().now_or_never().unwrap().unwrap();
        let mut upgrade = Box::pin(u.upgrade());
        assert!(upgrade.as_mut().now_or_never().is_none());
        drop(u);
        assert!(futures::executor::block_on(upgrade).is_err());
        r.release().unwrap();
        assert!(lock.write().now_or_never().is_some());
    }
}
