//! Hazard pointer memory reclamation (spec.md §4.1).
//!
//! A [`HazardPointerDomain`] is the process-wide (or scope-wide) registry
//! threads attach to. Each attached thread gets a fixed-width array of
//! hazard slots (`max_hps_per_thread`, spec.md §6: default 8) plus a
//! private retired-pointer buffer. `guard` publishes a pointer read from an
//! atomic source using the classic read-publish-reread protocol so that no
//! other thread's `scan` will free it out from under the reader; `retire`
//! hands a logically-unlinked pointer to the domain for eventual `scan`-time
//! reclamation.
//!
//! Grounded on the teacher's `hp.rs` (CAS-linked publication list of
//! per-thread records, snapshot-then-retain `scan`), generalized to a
//! construction-time slot count, an explicit scan threshold, and the
//! detach-time orphan buffer spec.md §4.1.3 requires.

use crate::error::{SmrError, SmrResult};
use std::cell::RefCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;

use super::Deleter;

thread_local! {
    static LOCAL: RefCell<Vec<(usize, *mut HpRecord)>> = RefCell::new(Vec::new());
}

struct RetiredNode {
    ptr: *mut (),
    deleter: Deleter,
}

// SAFETY: the pointer is only ever dereferenced by the deleter, which is
// `unsafe fn` and whose safety contract is upheld by `retire`'s caller.
unsafe impl Send for RetiredNode {}

struct HpRecord {
    hazards: Box<[AtomicPtr<()>]>,
    next: AtomicPtr<HpRecord>,
    active: AtomicBool,
    retired: Mutex<Vec<RetiredNode>>,
}

impl HpRecord {
    fn new(max_hps: usize) -> Self {
        Self {
            hazards: (0..max_hps).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
            retired: Mutex::new(Vec::new()),
        }
    }
}

/// The process-wide hazard pointer registry.
///
/// Construct one per logical domain of containers that should share a
/// reclamation budget (most applications want exactly one, shared via
/// `Arc<HazardPointerDomain>` or a `'static` reference).
pub struct HazardPointerDomain {
    max_hps_per_thread: usize,
    scan_threshold: usize,
    records: AtomicPtr<HpRecord>,
    orphaned: Mutex<Vec<RetiredNode>>,
}

impl HazardPointerDomain {
    /// Create a new domain.
    ///
    /// `max_hps_per_thread` is clamped to at least 1; `scan_threshold`
    /// (the retired-buffer length that triggers a `scan`, spec.md §4.1.1)
    /// is clamped to at least `max_hps_per_thread`.
    pub fn new(max_hps_per_thread: usize, scan_threshold: usize) -> Self {
        let max_hps_per_thread = max_hps_per_thread.max(1);
        if max_hps_per_thread == 0 {
            log::warn!("concurrent_ds::gc::hp: max_hps_per_thread clamped to 1");
        }
        Self {
            max_hps_per_thread,
            scan_threshold: scan_threshold.max(max_hps_per_thread),
            records: AtomicPtr::new(ptr::null_mut()),
            orphaned: Mutex::new(Vec::new()),
        }
    }

    /// Attach the current thread, returning an RAII handle. Detach happens
    /// on drop and drains the thread's retired buffer (spec.md §4.1.3).
    pub fn attach(&self) -> HpThread<'_> {
        let record = Box::into_raw(Box::new(HpRecord::new(self.max_hps_per_thread)));
        loop {
            let head = self.records.load(Ordering::Relaxed);
            unsafe {
                (*record).next.store(head, Ordering::Relaxed);
            }
            if self
                .records
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        HpThread { domain: self, record }
    }

    fn domain_key(&self) -> usize {
        self as *const Self as usize
    }

    /// Return this thread's cached attachment, registering one on first
    /// use. Unlike `attach`, the registration is never detached (and so
    /// never scanned) until the calling thread exits, so a container can
    /// call this once per operation without turning every `insert`/`erase`
    /// into a full domain-wide scan (spec.md §6.2's bounded-reclamation-
    /// latency invariant). Mirrors `gc::rcu::buffered`'s thread-local
    /// reader-record cache.
    pub fn local_thread(&self) -> HpThreadRef<'_> {
        let key = self.domain_key();
        let record = LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            if let Some((_, rec)) = local.iter().find(|(k, _)| *k == key) {
                return *rec;
            }
            let boxed = Box::into_raw(Box::new(HpRecord::new(self.max_hps_per_thread)));
            loop {
                let head = self.records.load(Ordering::Relaxed);
                unsafe {
                    (*boxed).next.store(head, Ordering::Relaxed);
                }
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
        });
        HpThreadRef { domain: self, record }
    }

    fn collect_hazards(&self) -> HashSet<*mut ()> {
        let mut hazards = HashSet::new();
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let rec = unsafe { &*current };
            if rec.active.load(Ordering::Acquire) {
                for slot in rec.hazards.iter() {
                    let p = slot.load(Ordering::Acquire);
                    if !p.is_null() {
                        hazards.insert(p);
                    }
                }
            }
            current = rec.next.load(Ordering::Acquire);
        }
        hazards
    }
}

impl Default for HazardPointerDomain {
    fn default() -> Self {
        Self::new(8, 16)
    }
}

// SAFETY: all mutation of shared state goes through atomics or the
// `Mutex`-guarded retired buffers.
unsafe impl Send for HazardPointerDomain {}
unsafe impl Sync for HazardPointerDomain {}

/// A thread's attachment to a [`HazardPointerDomain`].
pub struct HpThread<'d> {
    domain: &'d HazardPointerDomain,
    record: *mut HpRecord,
}

impl<'d> HpThread<'d> {
    /// Read `source`, publish it into hazard slot `index`, and re-read
    /// `source` to confirm it did not change underneath the publication
    /// (spec.md §4.1.1). Retries until stable; never fails except on a
    /// bad slot index.
    pub fn guard<T>(&self, index: usize, source: &AtomicPtr<T>) -> SmrResult<*mut T> {
        if index >= self.domain.max_hps_per_thread {
            return Err(SmrError::HazardSlotsExhausted {
                max: self.domain.max_hps_per_thread,
            });
        }
        let rec = unsafe { &*self.record };
        loop {
            let p = source.load(Ordering::Acquire);
            rec.hazards[index].store(p as *mut (), Ordering::Release);
            crate::pr::fence_acqrel();
            let p2 = source.load(Ordering::Acquire);
            if p == p2 {
                return Ok(p);
            }
        }
    }

    /// Clear hazard slot `index`.
    pub fn release(&self, index: usize) {
        if index < self.domain.max_hps_per_thread {
            let rec = unsafe { &*self.record };
            rec.hazards[index].store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Retire a logically-unlinked pointer. Runs `scan` once the
    /// thread-local retired buffer reaches the domain's scan threshold.
    ///
    /// # Safety
    ///
    /// `ptr` must not be dereferenced again by the caller, must not be
    /// retired twice, and must have been allocated with `Box`.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let rec = &*self.record;
        let mut retired = rec.retired.lock().unwrap();
        retired.push(RetiredNode {
            ptr: ptr as *mut (),
            deleter: super::drop_box::<T>,
        });
        let len = retired.len();
        drop(retired);
        if len >= self.domain.scan_threshold {
            self.scan();
        }
    }

    /// Snapshot all hazard slots across all attached threads and reclaim
    /// any retired pointer no longer present in the snapshot. Wait-free
    /// with respect to other threads (spec.md §4.1.1).
    pub fn scan(&self) {
        let hazards = self.domain.collect_hazards();

        // Pull in anything orphaned by threads that detached earlier.
        {
            let mut orphaned = self.domain.orphaned.lock().unwrap();
            if !orphaned.is_empty() {
                let rec = unsafe { &*self.record };
                rec.retired.lock().unwrap().append(&mut orphaned);
            }
        }

        let rec = unsafe { &*self.record };
        let mut retired = rec.retired.lock().unwrap();
        let mut i = 0;
        while i < retired.len() {
            if hazards.contains(&retired[i].ptr) {
                i += 1;
            } else {
                let node = retired.swap_remove(i);
                unsafe { (node.deleter)(node.ptr) };
            }
        }
    }

    /// Number of pointers still awaiting reclamation on this thread.
    pub fn retired_len(&self) -> usize {
        unsafe { &*self.record }.retired.lock().unwrap().len()
    }
}

impl Drop for HpThread<'_> {
    fn drop(&mut self) {
        let rec = unsafe { &*self.record };
        for slot in rec.hazards.iter() {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
        self.scan();
        let remaining: Vec<RetiredNode> = rec.retired.lock().unwrap().drain(..).collect();
        if !remaining.is_empty() {
            self.domain.orphaned.lock().unwrap().extend(remaining);
        }
        rec.active.store(false, Ordering::Release);
    }
}

/// A thread's cached, long-lived attachment to a [`HazardPointerDomain`],
/// obtained from [`HazardPointerDomain::local_thread`]. Unlike [`HpThread`],
/// dropping this does not detach the thread or scan — the underlying
/// record stays registered for reuse by the next call on this thread.
pub struct HpThreadRef<'d> {
    domain: &'d HazardPointerDomain,
    record: *mut HpRecord,
}

impl<'d> HpThreadRef<'d> {
    /// See [`HpThread::guard`].
    pub fn guard<T>(&self, index: usize, source: &AtomicPtr<T>) -> SmrResult<*mut T> {
        if index >= self.domain.max_hps_per_thread {
            return Err(SmrError::HazardSlotsExhausted {
                max: self.domain.max_hps_per_thread,
            });
        }
        let rec = unsafe { &*self.record };
        loop {
            let p = source.load(Ordering::Acquire);
            rec.hazards[index].store(p as *mut (), Ordering::Release);
            crate::pr::fence_acqrel();
            let p2 = source.load(Ordering::Acquire);
            if p == p2 {
                return Ok(p);
            }
        }
    }

    /// See [`HpThread::release`].
    pub fn release(&self, index: usize) {
        if index < self.domain.max_hps_per_thread {
            let rec = unsafe { &*self.record };
            rec.hazards[index].store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// See [`HpThread::retire`].
    ///
    /// # Safety
    ///
    /// Same contract as [`HpThread::retire`].
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let rec = &*self.record;
        let mut retired = rec.retired.lock().unwrap();
        retired.push(RetiredNode {
            ptr: ptr as *mut (),
            deleter: super::drop_box::<T>,
        });
        let len = retired.len();
        drop(retired);
        if len >= self.domain.scan_threshold {
            self.scan();
        }
    }

    /// See [`HpThread::scan`].
    pub fn scan(&self) {
        let hazards = self.domain.collect_hazards();

        {
            let mut orphaned = self.domain.orphaned.lock().unwrap();
            if !orphaned.is_empty() {
                let rec = unsafe { &*self.record };
                rec.retired.lock().unwrap().append(&mut orphaned);
            }
        }

        let rec = unsafe { &*self.record };
        let mut retired = rec.retired.lock().unwrap();
        let mut i = 0;
        while i < retired.len() {
            if hazards.contains(&retired[i].ptr) {
                i += 1;
            } else {
                let node = retired.swap_remove(i);
                unsafe { (node.deleter)(node.ptr) };
            }
        }
    }

    /// See [`HpThread::retired_len`].
    pub fn retired_len(&self) -> usize {
        unsafe { &*self.record }.retired.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicPtr;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn guard_and_release_round_trip() {
        let domain = HazardPointerDomain::new(4, 8);
        let t = domain.attach();
        let mut value = 42i32;
        let source = AtomicPtr::new(&mut value as *mut i32);
        let guarded = t.guard(0, &source).unwrap();
        assert_eq!(unsafe { *guarded }, 42);
        t.release(0);
    }

    #[test]
    fn guard_beyond_capacity_is_an_error() {
        let domain = HazardPointerDomain::new(2, 8);
        let t = domain.attach();
        let source: AtomicPtr<i32> = AtomicPtr::new(ptr::null_mut());
        assert!(matches!(
            t.guard(2, &source),
            Err(SmrError::HazardSlotsExhausted { max: 2 })
        ));
    }

    #[test]
    fn retire_below_threshold_keeps_node_alive() {
        let domain = HazardPointerDomain::new(4, 100);
        let t = domain.attach();
        let raw = Box::into_raw(Box::new(7i32));
        unsafe { t.retire(raw) };
        assert_eq!(t.retired_len(), 1);
    }

    #[test]
    fn scan_reclaims_unguarded_pointers() {
        let domain = HazardPointerDomain::new(4, 100);
        let t = domain.attach();
        let raw = Box::into_raw(Box::new(7i32));
        unsafe { t.retire(raw) };
        t.scan();
        assert_eq!(t.retired_len(), 0);
    }

    #[test]
    fn scan_preserves_guarded_pointer_across_threads() {
        // Thread A guards a node; Thread B retires it and scans. The node
        // must survive until A releases its guard and scans itself.
        let domain = Arc::new(HazardPointerDomain::new(4, 1));
        let mut value = 99i32;
        let source = Arc::new(AtomicPtr::new(&mut value as *mut i32));
        let barrier = Arc::new(Barrier::new(2));

        let d_a = Arc::clone(&domain);
        let src_a = Arc::clone(&source);
        let b_a = Arc::clone(&barrier);
        let a = thread::spawn(move || {
            let t = d_a.attach();
            let guarded = t.guard(0, &src_a).unwrap();
            b_a.wait(); // let B retire + scan while we still hold the guard
            b_a.wait();
            assert_eq!(unsafe { *guarded }, 99);
            t.release(0);
        });

        let d_b = Arc::clone(&domain);
        let b_b = Arc::clone(&barrier);
        let b = thread::spawn(move || {
            let t = d_b.attach();
            b_b.wait();
            t.scan();
            b_b.wait();
        });

        a.join().unwrap();
        b.join().unwrap();
        // leaked `value` is stack-owned in this test; nothing retired it.
    }

    #[test]
    fn local_thread_reuses_the_same_record_on_repeated_calls() {
        let domain = HazardPointerDomain::new(4, 100);
        let raw = Box::into_raw(Box::new(1i32));
        unsafe { domain.local_thread().retire(raw) };
        // A second call on the same thread must see the first call's
        // retired node rather than starting from a fresh, empty record.
        assert_eq!(domain.local_thread().retired_len(), 1);
        domain.local_thread().scan();
        assert_eq!(domain.local_thread().retired_len(), 0);
    }
}
