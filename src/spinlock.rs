//! Spinlock used as the flat-combining kernel's global combiner lock.
//!
//! Flat combining (spec §4.4) wants exactly one thing from its lock: fast,
//! unfair acquisition by whichever thread happens to be free, with `try_lock`
//! as the primary entry point (a waiting thread spins on its own publication
//! record, not on this lock). [`FasLock`] is a fetch-and-store spinlock: the
//! simplest and fastest shape for that, at the cost of fairness the kernel
//! does not need (`spec.md` §5 calls flat combining "blocking but
//! starvation-bounded" through the publication-list protocol, not through
//! the lock).

use crate::backoff::{BackOff, Exponential};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A simple fetch-and-store spinlock.
///
/// Unfair under contention: a thread can be starved if others keep winning
/// the race to flip `locked`. Acceptable here because flat combining never
/// queues on this lock directly (see module docs).
#[repr(C)]
pub struct FasLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> FasLock<T> {
    /// Create a new unlocked spinlock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<FasLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(FasLockGuard { lock: self })
        }
    }

    /// Acquire the lock, spinning if necessary.
    #[inline]
    pub fn lock(&self) -> FasLockGuard<'_, T> {
        let mut backoff = Exponential::default();
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        FasLockGuard { lock: self }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

unsafe impl<T: Send> Send for FasLock<T> {}
unsafe impl<T: Send> Sync for FasLock<T> {}

/// RAII guard for [`FasLock`].
pub struct FasLockGuard<'a, T: ?Sized> {
    lock: &'a FasLock<T>,
}

impl<T: ?Sized> Deref for FasLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FasLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FasLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Type alias for the default spinlock type.
pub type SpinLock<T> = FasLock<T>;
/// Type alias for the default spinlock guard.
pub type SpinLockGuard<'a, T> = FasLockGuard<'a, T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unlocked() {
        let lock = FasLock::new(42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn lock_unlock_round_trips() {
        let lock = FasLock::new(42);
        {
            let guard = lock.lock();
            assert!(lock.is_locked());
            assert_eq!(*guard, 42);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_contends() {
        let lock = FasLock::new(42);
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn modify_through_guard() {
        let lock = FasLock::new(0);
        *lock.lock() = 42;
        assert_eq!(*lock.lock(), 42);
    }
}
