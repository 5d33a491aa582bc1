//! # Ordered Locking Primitives
//!
//! Mutex wrappers that encode their position in the lock hierarchy:
//!
//! ```text
//! REGISTRY (0)  ->  OBJECT (1)  ->  RING (2)
//! id -> vfd table   one vfd's       one ring half
//!                   inbox/flags
//! ```
//!
//! Locks must be acquired in strictly increasing level order. Two locks of
//! the same level are never held together (the two ring halves are
//! independent, and no path holds two VFDs at once). Debug builds track the
//! levels held by the current thread and panic on an inversion; release
//! builds carry no bookkeeping.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Level 0: the id -> VFD table
pub const REGISTRY: u8 = 0;
/// Level 1: an individual VFD's state
pub const OBJECT: u8 = 1;
/// Level 2: one half of the descriptor ring pair
pub const RING: u8 = 2;

/// A mutex with an associated ordering level.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
    name: &'static str,
}

/// Guard returned by [`OrderedMutex::lock`].
pub struct OrderedGuard<'a, T, const LEVEL: u8> {
    guard: Option<MutexGuard<'a, T>>,
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    /// Create a new ordered lock.
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            name,
        }
    }

    /// Acquire the lock.
    ///
    /// In debug builds, panics if the current thread already holds a lock of
    /// the same or a higher level.
    #[inline]
    pub fn lock(&self) -> OrderedGuard<'_, T, LEVEL> {
        held::acquire(LEVEL, self.name);
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        OrderedGuard {
            guard: Some(guard),
            name: self.name,
        }
    }

    /// Get the lock level.
    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    /// Get the lock name.
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T, const LEVEL: u8> std::fmt::Debug for OrderedMutex<T, LEVEL> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMutex")
            .field("name", &self.name)
            .field("level", &LEVEL)
            .finish_non_exhaustive()
    }
}

impl<'a, T, const LEVEL: u8> OrderedGuard<'a, T, LEVEL> {
    /// Block on `cv` while `condition` holds, releasing the lock meanwhile.
    pub fn wait_while<F>(mut self, cv: &Condvar, condition: F) -> Self
    where
        F: FnMut(&mut T) -> bool,
    {
        if let Some(guard) = self.guard.take() {
            let guard = cv
                .wait_while(guard, condition)
                .unwrap_or_else(PoisonError::into_inner);
            self.guard = Some(guard);
        }
        self
    }

    /// Like [`wait_while`](Self::wait_while) but gives up after `timeout`.
    /// The flag is true when the wait timed out with `condition` still set.
    pub fn wait_timeout_while<F>(
        mut self,
        cv: &Condvar,
        timeout: Duration,
        condition: F,
    ) -> (Self, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut timed_out = false;
        if let Some(guard) = self.guard.take() {
            let (guard, result) = cv
                .wait_timeout_while(guard, timeout, condition)
                .unwrap_or_else(PoisonError::into_inner);
            timed_out = result.timed_out();
            self.guard = Some(guard);
        }
        (self, timed_out)
    }
}

impl<T, const LEVEL: u8> Deref for OrderedGuard<'_, T, LEVEL> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `None` transiently inside the wait helpers.
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("ordered guard used while waiting"),
        }
    }
}

impl<T, const LEVEL: u8> DerefMut for OrderedGuard<'_, T, LEVEL> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("ordered guard used while waiting"),
        }
    }
}

impl<T, const LEVEL: u8> Drop for OrderedGuard<'_, T, LEVEL> {
    fn drop(&mut self) {
        drop(self.guard.take());
        held::release(LEVEL, self.name);
    }
}

/// Level 0 lock - the VFD table
pub type RegistryLock<T> = OrderedMutex<T, REGISTRY>;

/// Level 1 lock - individual VFD state
pub type ObjectLock<T> = OrderedMutex<T, OBJECT>;

/// Level 2 lock - one ring half
pub type RingLock<T> = OrderedMutex<T, RING>;

#[cfg(debug_assertions)]
mod held {
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<(u8, &'static str)>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(level: u8, name: &'static str) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&(top, top_name)) = held.iter().max_by_key(|(l, _)| *l) {
                assert!(
                    top < level,
                    "lock order violation: acquiring {} (level {}) while holding {} (level {})",
                    name,
                    level,
                    top_name,
                    top
                );
            }
            held.push((level, name));
        });
    }

    pub(super) fn release(level: u8, name: &'static str) {
        // Thread-local storage may already be gone during thread teardown.
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&(l, n)| l == level && n == name) {
                held.remove(pos);
            }
        });
    }

    #[cfg(test)]
    pub(super) fn depth() -> usize {
        HELD.with(|held| held.borrow().len())
    }
}

#[cfg(not(debug_assertions))]
mod held {
    #[inline(always)]
    pub(super) fn acquire(_level: u8, _name: &'static str) {}

    #[inline(always)]
    pub(super) fn release(_level: u8, _name: &'static str) {}
}
