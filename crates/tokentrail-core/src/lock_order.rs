//! Lock ordering + debug-only deadlock prevention utilities.
//!
//! Two locking domains coexist in this crate: the per-queue record lock and
//! the scheduler's membership lock. The sweep pass must snapshot membership
//! under the scheduler lock, release it, and only then call into individual
//! queues — taking a queue lock while still holding the scheduler lock is a
//! lock-order inversion waiting to happen.
//!
//! Design goals:
//! - **Zero release overhead**: ordering checks compile to no-ops outside
//!   `debug_assertions`.
//! - **Fail fast in debug**: panic *before* attempting an out-of-order lock.
//!
//! Rule (strict):
//! - When a thread already holds any lock(s), it may only acquire locks with
//!   a strictly higher `LockLevel::rank()`.
//!
//! The scheduler's membership lock sits at the top of the hierarchy, so any
//! attempt to reach back into a queue while holding it panics in debug
//! builds. Keep critical sections tiny and never hold these locks across
//! blocking IO.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

/// Global lock hierarchy.
///
/// Lower rank must be acquired before higher rank when locks are nested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockLevel {
    /// A queue's in-memory record deque.
    QueueRecords,
    /// A queue's save gate (serializes persistence writes per queue).
    QueueSaveGate,
    /// A queue's registration handle slot.
    QueueRegistration,
    /// The sweep scheduler's membership + timer state.
    SchedulerMembers,
}

impl LockLevel {
    /// Total order rank. Must be unique per variant.
    #[must_use]
    pub const fn rank(self) -> u16 {
        match self {
            Self::QueueRecords => 10,
            Self::QueueSaveGate => 20,
            Self::QueueRegistration => 30,
            Self::SchedulerMembers => 40,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{}", self.rank())
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

#[inline]
fn check_before_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let held = held.borrow();
        let Some(&last) = held.last() else {
            return;
        };
        assert!(
            level.rank() > last.rank(),
            "lock order violation: attempting to acquire {} while holding {}. held={:?}",
            level,
            last,
            held.as_slice()
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = level;
}

#[inline]
fn did_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| held.borrow_mut().push(level));
    #[cfg(not(debug_assertions))]
    let _ = level;
}

#[inline]
fn did_release(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let last = held.pop();
        assert!(
            last == Some(level),
            "lock tracking corrupted: expected to release {}, popped={:?}, held={:?}",
            level,
            last,
            held.as_slice()
        );
    });
    #[cfg(not(debug_assertions))]
    let _ = level;
}

/// Mutex wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedMutexGuard {
            level: self.level,
            guard,
        }
    }
}

pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
