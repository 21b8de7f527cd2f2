//! Writer-preferring shared/exclusive lock with per-thread ownership.
//!
//! [`PriorityLock`] distinguishes shared ("read") from exclusive ("write") holders the way a
//! reader/writer lock does, with three differences that the catalog relies on:
//!
//! - Ownership is tracked per OS thread, so a thread that already holds the lock can ask for
//!   it again without blocking, and [`PriorityLock::release`] releases whichever mode the
//!   calling thread holds.
//! - Exclusive requests take priority. As soon as a thread *asks* for exclusive access, no new
//!   shared holder is admitted until that request has been granted and released. Shared holders
//!   admitted before the request drain normally.
//! - Locking is decoupled from data. The lock guards whatever the caller decides it guards (a
//!   whole catalog, one dataset handle), and is held across an entire request.
//!
//! Competing exclusive requesters are not ordered relative to each other.

use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;

use crate::sync::thread::{self, ThreadId};
use crate::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LockState {
    /// Thread that claimed exclusive access. Set once no other exclusive claim exists, before
    /// the existing shared holders have drained.
    exclusive: Option<ThreadId>,
    /// Exclusive requesters still waiting for another claimant to release. New shared grants
    /// wait while this is non-zero too.
    pending_exclusive: usize,
    /// Threads currently holding shared access.
    shared: FxHashSet<ThreadId>,
}

impl LockState {
    /// Drops the calling thread's shared hold, if any. Returns true when the last shared
    /// holder left, which is the moment a pending exclusive claimant can proceed.
    fn leave_shared(&mut self, me: ThreadId) -> bool {
        self.shared.remove(&me) && self.shared.is_empty()
    }

    fn admits_shared(&self) -> bool {
        self.exclusive.is_none() && self.pending_exclusive == 0
    }
}

/// Shared/exclusive lock where pending exclusive requests block new shared grants.
///
/// All waits are condition-variable waits. Only [`try_lock_exclusive`](Self::try_lock_exclusive)
/// and [`try_write_for`](Self::try_write_for) are bounded in time.
#[derive(Default)]
pub struct PriorityLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl PriorityLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Blocks until the calling thread holds shared access.
    ///
    /// Returns `true` if this call granted the hold and `false` if the thread already held the
    /// lock in either mode, in which case nothing changed.
    pub fn lock_shared(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) || state.shared.contains(&me) {
            return false;
        }
        while !state.admits_shared() {
            state = self.wait(state);
        }
        state.shared.insert(me);
        true
    }

    /// Blocks until the calling thread holds exclusive access.
    ///
    /// A shared hold owned by the calling thread is given up first; the conversion is not
    /// atomic, another exclusive requester may run in between. Returns `false` if the thread
    /// already held exclusive access.
    pub fn lock_exclusive(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return false;
        }
        if state.leave_shared(me) {
            self.changed.notify_all();
        }
        state.pending_exclusive += 1;
        while state.exclusive.is_some() {
            state = self.wait(state);
        }
        state.pending_exclusive -= 1;
        state.exclusive = Some(me);
        while !state.shared.is_empty() {
            state = self.wait(state);
        }
        true
    }

    /// Tries to obtain exclusive access within `timeout`.
    ///
    /// The claim is registered right away, so shared requests arriving during the wait are
    /// held back exactly as for [`lock_exclusive`](Self::lock_exclusive). If the deadline
    /// passes first, the claim is withdrawn and held-back readers are woken.
    ///
    /// Returns `true` if the calling thread holds exclusive access on return.
    pub fn try_lock_exclusive(&self, timeout: Duration) -> bool {
        self.try_acquire_exclusive(timeout).is_some()
    }

    /// Like [`try_lock_exclusive`](Self::try_lock_exclusive), additionally reporting whether
    /// this call made the grant (`Some(true)`) or the thread already held it (`Some(false)`).
    fn try_acquire_exclusive(&self, timeout: Duration) -> Option<bool> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        if state.exclusive == Some(me) {
            return Some(false);
        }
        if state.leave_shared(me) {
            self.changed.notify_all();
        }

        state.pending_exclusive += 1;
        while state.exclusive.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.pending_exclusive -= 1;
                self.changed.notify_all();
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        state.pending_exclusive -= 1;
        state.exclusive = Some(me);

        while !state.shared.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.exclusive = None;
                self.changed.notify_all();
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        Some(true)
    }

    /// Releases whatever the calling thread holds. Releasing an unheld lock is a no-op.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            state.exclusive = None;
            self.changed.notify_all();
        } else if state.leave_shared(me) {
            self.changed.notify_all();
        }
    }

    pub(crate) fn release_shared(&self) {
        let me = thread::current().id();
        if self.state().leave_shared(me) {
            self.changed.notify_all();
        }
    }

    fn release_exclusive(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        if state.exclusive == Some(me) {
            state.exclusive = None;
            self.changed.notify_all();
        }
    }

    /// Returns true if the calling thread holds exclusive access.
    #[must_use]
    pub fn is_exclusive_held_by_caller(&self) -> bool {
        self.state().exclusive == Some(thread::current().id())
    }

    /// Returns true if the calling thread holds shared access.
    #[must_use]
    pub fn is_shared_held_by_caller(&self) -> bool {
        self.state().shared.contains(&thread::current().id())
    }

    /// Acquires shared access for the lifetime of the returned guard.
    pub fn read(&self) -> SharedGuard<'_> {
        SharedGuard {
            lock: self,
            owned: self.lock_shared(),
            _not_send: PhantomData,
        }
    }

    /// Acquires exclusive access for the lifetime of the returned guard.
    pub fn write(&self) -> ExclusiveGuard<'_> {
        ExclusiveGuard {
            lock: self,
            owned: self.lock_exclusive(),
            _not_send: PhantomData,
        }
    }

    /// Acquires exclusive access within `timeout`, or returns `None`.
    pub fn try_write_for(&self, timeout: Duration) -> Option<ExclusiveGuard<'_>> {
        let owned = self.try_acquire_exclusive(timeout)?;
        Some(ExclusiveGuard {
            lock: self,
            owned,
            _not_send: PhantomData,
        })
    }
}

impl fmt::Debug for PriorityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("PriorityLock")
            .field("exclusive", &state.exclusive)
            .field("pending_exclusive", &state.pending_exclusive)
            .field("shared_holders", &state.shared.len())
            .finish()
    }
}

/// Shared hold on a [`PriorityLock`]. Only releases on drop if its own acquisition granted the
/// hold, so nesting guards on one thread is harmless.
#[must_use = "the shared hold is released as soon as the guard is dropped"]
pub struct SharedGuard<'a> {
    lock: &'a PriorityLock,
    owned: bool,
    /// Holdership is per thread, the guard must be dropped where it was created.
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.lock.release_shared();
        }
    }
}

/// Exclusive hold on a [`PriorityLock`]. Same nesting rules as [`SharedGuard`].
#[must_use = "the exclusive hold is released as soon as the guard is dropped"]
pub struct ExclusiveGuard<'a> {
    lock: &'a PriorityLock,
    owned: bool,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.lock.release_exclusive();
        }
    }
}
