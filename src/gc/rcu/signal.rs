//! Signal-based RCU, approximated (spec.md §4.3, "Signal-based" row).
//!
//! The original scheme sends a real signal to each reader thread and has
//! the handler stamp the thread's current epoch; that requires raw signal
//! plumbing (`libc::pthread_kill` + a process-wide handler) that is not
//! portable test surface, so this flavor approximates it with cooperative
//! polling: a global epoch counter readers copy into their record on entry,
//! and a writer that bumps the epoch and waits for every reader's stamped
//! epoch to catch up. Documented as a deliberate simplification in
//! `DESIGN.md`; the read/write API is identical to the other two flavors.

use crate::error::{DeadlockPolicy, SmrError, SmrResult};
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::DeferredFree;

struct SignalRecord {
    epoch: AtomicUsize,
    in_cs: AtomicUsize,
    next: AtomicPtr<SignalRecord>,
    active: std::sync::atomic::AtomicBool,
}

unsafe impl Send for SignalRecord {}
unsafe impl Sync for SignalRecord {}

thread_local! {
    static LOCAL: RefCell<Vec<(usize, *const SignalRecord)>> = RefCell::new(Vec::new());
}

/// A signal-flavored (cooperative-polling) RCU domain.
pub struct SignalRcu {
    global_epoch: AtomicUsize,
    records: AtomicPtr<SignalRecord>,
    retired: Mutex<Vec<DeferredFree>>,
    deadlock_policy: DeadlockPolicy,
}

unsafe impl Send for SignalRcu {}
unsafe impl Sync for SignalRcu {}

impl SignalRcu {
    pub(crate) fn new(buffer_size_hint: usize) -> Self {
        Self {
            global_epoch: AtomicUsize::new(0),
            records: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::with_capacity(buffer_size_hint)),
            deadlock_policy: DeadlockPolicy::default(),
        }
    }

    pub(crate) fn with_deadlock_policy(mut self, policy: DeadlockPolicy) -> Self {
        self.deadlock_policy = policy;
        self
    }

    fn domain_key(&self) -> usize {
        self as *const Self as usize
    }

    fn local_record(&self) -> *const SignalRecord {
        let key = self.domain_key();
        LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            if let Some((_, rec)) = local.iter().find(|(k, _)| *k == key) {
                return *rec;
            }
            let boxed = Box::into_raw(Box::new(SignalRecord {
                epoch: AtomicUsize::new(self.global_epoch.load(Ordering::Acquire)),
                in_cs: AtomicUsize::new(0),
                next: AtomicPtr::new(ptr::null_mut()),
                active: std::sync::atomic::AtomicBool::new(true),
            }));
            loop {
                let head = self.records.load(Ordering::Relaxed);
                unsafe { (*boxed).next.store(head, Ordering::Relaxed) };
                if self
                    .records
                    .compare_exchange_weak(head, boxed, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
            local.push((key, boxed));
            boxed
        })
    }
}

impl super::RcuDomain for SignalRcu {
    fn read_lock(&self) {
        let rec = unsafe { &*self.local_record() };
        // "quiesce" the reader by stamping the epoch it observed, standing
        // in for the signal handler's epoch stamp.
        rec.epoch
            .store(self.global_epoch.load(Ordering::Acquire), Ordering::Release);
        rec.in_cs.fetch_add(1, Ordering::AcqRel);
    }

    fn read_unlock(&self) {
        let rec = unsafe { &*self.local_record() };
        rec.in_cs.fetch_sub(1, Ordering::AcqRel);
    }

    unsafe fn retire<T>(&self, ptr: *mut T) {
        self.retired.lock().unwrap().push(DeferredFree {
            ptr: ptr as *mut (),
            deleter: crate::gc::drop_box::<T>,
        });
    }

    fn synchronize(&self) -> SmrResult<()> {
        let rec = unsafe { &*self.local_record() };
        if rec.in_cs.load(Ordering::Acquire) > 0 {
            log::error!("concurrent_ds::gc::rcu::signal: synchronize() called from within a read-side critical section");
            return match self.deadlock_policy {
                DeadlockPolicy::Return => Err(SmrError::RcuRecursiveSynchronize),
                DeadlockPolicy::Assert => {
                    panic!("synchronize() called from within an RCU read-side critical section")
                }
                DeadlockPolicy::Ignore => Ok(()),
            };
        }

        let target = self.global_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let mut backoff = crate::backoff::Exponential::new();
        use crate::backoff::BackOff;
        loop {
            let mut all_quiesced = true;
            let mut cur = self.records.load(Ordering::Acquire);
            while !cur.is_null() {
                let r = unsafe { &*cur };
                if r.active.load(Ordering::Acquire)
                    && r.in_cs.load(Ordering::Acquire) > 0
                    && r.epoch.load(Ordering::Acquire) < target
                {
                    all_quiesced = false;
                    break;
                }
                cur = r.next.load(Ordering::Acquire);
            }
            if all_quiesced {
                break;
            }
            backoff.spin();
        }

        let drained: Vec<DeferredFree> = self.retired.lock().unwrap().drain(..).collect();
        for node in drained {
            unsafe { (node.deleter)(node.ptr) };
        }
        Ok(())
    }
}

impl Drop for SignalRcu {
    fn drop(&mut self) {
        let mut cur = *self.records.get_mut();
        while !cur.is_null() {
            let rec = unsafe { Box::from_raw(cur) };
            cur = rec.next.load(Ordering::Relaxed);
        }
        for node in self.retired.get_mut().unwrap().drain(..) {
            unsafe { (node.deleter)(node.ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::RcuDomain;
    use super::*;

    #[test]
    fn read_section_round_trips() {
        let rcu = SignalRcu::new(8);
        rcu.read_lock();
        rcu.read_unlock();
        assert!(rcu.synchronize().is_ok());
    }

    #[test]
    fn synchronize_from_inside_cs_is_rejected_by_default() {
        let rcu = SignalRcu::new(8);
        rcu.read_lock();
        assert!(matches!(
            rcu.synchronize(),
            Err(SmrError::RcuRecursiveSynchronize)
        ));
        rcu.read_unlock();
    }

    #[test]
    fn synchronize_reclaims_retired_pointers() {
        let rcu = SignalRcu::new(8);
        let raw = Box::into_raw(Box::new(4i32));
        unsafe { rcu.retire(raw) };
        assert!(rcu.synchronize().is_ok());
    }
}
