//! Read-copy-update (spec.md §4.3).
//!
//! Readers take a read-side critical section with `read_lock`/`read_unlock`
//! — a pair of relaxed counter bumps, no hazard slot needed for pointers
//! loaded inside one. Writers `retire` an unlinked pointer and eventually
//! `synchronize`, which blocks until every critical section that existed at
//! the call has ended (a *grace period*). The three flavors share that
//! surface through [`RcuDomain`] and differ only in how the grace period is
//! detected; [`Rcu`] is the flavor-erased handle containers are written
//! against.

pub mod buffered;
pub mod signal;
pub mod threaded;

use crate::error::{DeadlockPolicy, SmrResult};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Deleter;

pub(crate) struct ReaderRecord {
    /// Even when quiescent, odd while inside a (possibly nested) critical
    /// section. Advanced by one on every 0->1 and every 1->0 transition.
    pub(crate) parity: AtomicUsize,
    pub(crate) next: std::sync::atomic::AtomicPtr<ReaderRecord>,
    pub(crate) active: std::sync::atomic::AtomicBool,
    depth: std::cell::Cell<usize>,
}

unsafe impl Send for ReaderRecord {}
unsafe impl Sync for ReaderRecord {}

impl ReaderRecord {
    fn new() -> Self {
        Self {
            parity: AtomicUsize::new(0),
            next: std::sync::atomic::AtomicPtr::new(ptr::null_mut()),
            active: std::sync::atomic::AtomicBool::new(true),
            depth: std::cell::Cell::new(0),
        }
    }

    pub(crate) fn read_lock(&self) {
        let d = self.depth.get();
        if d == 0 {
            self.parity.fetch_add(1, Ordering::Acquire);
        }
        self.depth.set(d + 1);
    }

    pub(crate) fn read_unlock(&self) {
        let d = self.depth.get();
        debug_assert!(d > 0, "read_unlock without matching read_lock");
        if d == 1 {
            self.parity.fetch_add(1, Ordering::Release);
        }
        self.depth.set(d - 1);
    }

    pub(crate) fn in_cs(&self) -> bool {
        self.depth.get() > 0
    }
}

pub(crate) struct DeferredFree {
    pub(crate) ptr: *mut (),
    pub(crate) deleter: Deleter,
}

unsafe impl Send for DeferredFree {}

/// Selects which grace-period detection strategy an [`Rcu`] domain uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcuFlavor {
    /// Writer-driven: `synchronize` spins, snapshotting and re-checking
    /// reader parities itself.
    Buffered,
    /// A background thread drives grace-period detection and drains the
    /// retire queue; `synchronize` just waits for one such pass.
    Threaded,
    /// Cooperative epoch polling standing in for a real signal-based quiesce
    /// (spec.md §4.3 flavor table; documented simplification, see
    /// `DESIGN.md`).
    Signal,
}

/// The operations every RCU flavor provides (spec.md §4.3.1 – §4.3.2).
pub trait RcuDomain {
    /// Enter a (possibly nested) read-side critical section.
    fn read_lock(&self);

    /// Leave a read-side critical section entered with `read_lock`.
    fn read_unlock(&self);

    /// Enqueue a retired pointer, reclaimed once a subsequent grace period
    /// covering this call has elapsed.
    ///
    /// # Safety
    /// Same contract as `HpThread::retire`: must not be retired twice or
    /// dereferenced again by the caller.
    unsafe fn retire<T>(&self, ptr: *mut T);

    /// Block until every read-side critical section active at the time of
    /// this call has ended. Returns `Err` (or panics, or is a no-op,
    /// depending on the domain's [`DeadlockPolicy`]) if called from within
    /// an active critical section on this thread.
    fn synchronize(&self) -> SmrResult<()>;
}

/// A flavor-erased RCU domain handle.
pub enum Rcu {
    /// See [`buffered::BufferedRcu`].
    Buffered(buffered::BufferedRcu),
    /// See [`threaded::ThreadedRcu`].
    Threaded(threaded::ThreadedRcu),
    /// See [`signal::SignalRcu`].
    Signal(signal::SignalRcu),
}

impl Rcu {
    /// Construct a domain of the given flavor. `buffer_size` is a hint for
    /// the retired-pointer buffer's initial capacity (and, for `Threaded`,
    /// the retire-queue's bound before the background thread is woken
    /// eagerly).
    pub fn new(flavor: RcuFlavor, buffer_size: usize) -> Self {
        match flavor {
            RcuFlavor::Buffered => Rcu::Buffered(buffered::BufferedRcu::new(buffer_size)),
            RcuFlavor::Threaded => Rcu::Threaded(threaded::ThreadedRcu::new(buffer_size)),
            RcuFlavor::Signal => Rcu::Signal(signal::SignalRcu::new(buffer_size)),
        }
    }

    /// Set the policy applied when `synchronize` is called reentrantly.
    pub fn with_deadlock_policy(self, policy: DeadlockPolicy) -> Self {
        match self {
            Rcu::Buffered(d) => Rcu::Buffered(d.with_deadlock_policy(policy)),
            Rcu::Threaded(d) => Rcu::Threaded(d.with_deadlock_policy(policy)),
            Rcu::Signal(d) => Rcu::Signal(d.with_deadlock_policy(policy)),
        }
    }
}

impl RcuDomain for Rcu {
    fn read_lock(&self) {
        match self {
            Rcu::Buffered(d) => d.read_lock(),
            Rcu::Threaded(d) => d.read_lock(),
            Rcu::Signal(d) => d.read_lock(),
        }
    }

    fn read_unlock(&self) {
        match self {
            Rcu::Buffered(d) => d.read_unlock(),
            Rcu::Threaded(d) => d.read_unlock(),
            Rcu::Signal(d) => d.read_unlock(),
        }
    }

    unsafe fn retire<T>(&self, ptr: *mut T) {
        match self {
            Rcu::Buffered(d) => d.retire(ptr),
            Rcu::Threaded(d) => d.retire(ptr),
            Rcu::Signal(d) => d.retire(ptr),
        }
    }

    fn synchronize(&self) -> SmrResult<()> {
        match self {
            Rcu::Buffered(d) => d.synchronize(),
            Rcu::Threaded(d) => d.synchronize(),
            Rcu::Signal(d) => d.synchronize(),
        }
    }
}

/// An RAII read-side critical section.
pub struct RcuReadGuard<'d, D: RcuDomain> {
    domain: &'d D,
}

impl<'d, D: RcuDomain> RcuReadGuard<'d, D> {
    pub(crate) fn new(domain: &'d D) -> Self {
        domain.read_lock();
        Self { domain }
    }
}

impl<D: RcuDomain> Drop for RcuReadGuard<'_, D> {
    fn drop(&mut self) {
        self.domain.read_unlock();
    }
}
