//! Dynamic hazard pointers (spec.md §4.2).
//!
//! Unlike [`super::hp`]'s fixed per-thread slot array, DHP hands out guards
//! from a shared, dynamically-growing pool: a thread that needs more
//! protections than it currently owns pulls fresh guards from a global
//! free-list (allocating new ones from the heap only when that list is
//! empty), and returns them to the pool on detach rather than keeping them
//! pinned for the thread's lifetime. Retired pointers are tagged with the
//! epoch they were retired in and only liberated once `epoch_count` epochs
//! have elapsed, bounding how far a slow reader can fall behind.
//!
//! Grounded on `original_source/cds/gc/details/dhp.h` (guard_allocator's
//! global/free guard lists, liberate-by-epoch retired buffer) and the
//! teacher's `hp.rs` for the surrounding Rust idiom (publication list,
//! `Drop`-driven detach).

use crate::error::{SmrError, SmrResult};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::Deleter;

struct GuardNode {
    post: AtomicPtr<()>,
    next_free: AtomicPtr<GuardNode>,
}

impl GuardNode {
    fn new() -> Box<Self> {
        Box::new(Self {
            post: AtomicPtr::new(ptr::null_mut()),
            next_free: AtomicPtr::new(ptr::null_mut()),
        })
    }
}

/// Construction-time tuning for a [`DhpDomain`].
#[derive(Debug, Clone, Copy)]
pub struct DhpConfig {
    /// Retired-buffer length (per epoch bucket) that triggers a liberate
    /// pass.
    pub liberate_threshold: usize,
    /// Guards eagerly allocated into the free pool at construction time.
    pub initial_guard_count: usize,
    /// Number of epoch buckets retired pointers rotate through before
    /// becoming eligible for reclamation. Must be a power of two (spec.md
    /// §6) so bucket indexing can use a bitmask instead of a modulo.
    pub epoch_count: usize,
}

impl Default for DhpConfig {
    fn default() -> Self {
        Self {
            liberate_threshold: 1024,
            initial_guard_count: 8,
            epoch_count: 16,
        }
    }
}

struct RetiredNode {
    ptr: *mut (),
    deleter: Deleter,
    epoch: usize,
}

unsafe impl Send for RetiredNode {}

/// The dynamic hazard pointer domain: a global guard pool plus an
/// epoch-rotated retired-pointer buffer.
pub struct DhpDomain {
    config: DhpConfig,
    epoch_mask: usize,
    current_epoch: AtomicUsize,
    free_guards: Mutex<Vec<Box<GuardNode>>>,
    live_guards: Mutex<Vec<*const GuardNode>>,
    retired: Mutex<Vec<Vec<RetiredNode>>>,
}

unsafe impl Send for DhpDomain {}
unsafe impl Sync for DhpDomain {}

impl DhpDomain {
    /// Create a domain with the given configuration.
    ///
    /// Returns [`SmrError::InvalidConfig`] if `epoch_count` is zero or not
    /// a power of two.
    pub fn new(config: DhpConfig) -> SmrResult<Self> {
        if config.epoch_count == 0 || !config.epoch_count.is_power_of_two() {
            log::error!(
                "concurrent_ds::gc::dhp: epoch_count {} is not a power of two",
                config.epoch_count
            );
            return Err(SmrError::InvalidConfig(
                "DhpConfig::epoch_count must be a power of two",
            ));
        }
        let mut free = Vec::with_capacity(config.initial_guard_count);
        let mut live = Vec::with_capacity(config.initial_guard_count);
        for _ in 0..config.initial_guard_count {
            let boxed = GuardNode::new();
            live.push(&*boxed as *const GuardNode);
            free.push(boxed);
        }
        let retired = (0..config.epoch_count).map(|_| Vec::new()).collect();
        Ok(Self {
            epoch_mask: config.epoch_count - 1,
            config,
            current_epoch: AtomicUsize::new(0),
            free_guards: Mutex::new(free),
            live_guards: Mutex::new(live),
            retired: Mutex::new(retired),
        })
    }

    /// Attach the current thread.
    pub fn attach(&self) -> DhpThread<'_> {
        DhpThread {
            domain: self,
            owned: Vec::new(),
        }
    }

    fn alloc_guard(&self) -> *const GuardNode {
        if let Some(g) = self.free_guards.lock().unwrap().pop() {
            // Already registered in `live_guards` when first created; only
            // the ownership (held by `free_guards`) transfers here, via an
            // intentional leak matched by `DhpThread::drop`'s `from_raw`.
            return Box::leak(g) as *const GuardNode;
        }
        let boxed = GuardNode::new();
        let raw = Box::leak(boxed) as *const GuardNode;
        self.live_guards.lock().unwrap().push(raw);
        raw
    }

    fn advance_epoch(&self) -> usize {
        self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for DhpDomain {
    fn drop(&mut self) {
        for raw in self.live_guards.get_mut().unwrap().drain(..) {
            unsafe {
                drop(Box::from_raw(raw as *mut GuardNode));
            }
        }
        for bucket in self.retired.get_mut().unwrap().iter_mut() {
            for node in bucket.drain(..) {
                unsafe { (node.deleter)(node.ptr) };
            }
        }
    }
}

/// A thread's attachment to a [`DhpDomain`]; owns a set of guards pulled
/// from the shared pool, returned to the pool on drop.
pub struct DhpThread<'d> {
    domain: &'d DhpDomain,
    owned: Vec<*const GuardNode>,
}

impl<'d> DhpThread<'d> {
    fn ensure_slot(&mut self, index: usize) -> SmrResult<()> {
        while self.owned.len() <= index {
            self.owned.push(self.domain.alloc_guard());
        }
        Ok(())
    }

    /// Guard `source`, growing this thread's owned-guard set if `index`
    /// exceeds what it currently holds.
    pub fn guard<T>(&mut self, index: usize, source: &AtomicPtr<T>) -> SmrResult<*mut T> {
        self.ensure_slot(index)?;
        let node = unsafe { &*self.owned[index] };
        loop {
            let p = source.load(Ordering::Acquire);
            node.post.store(p as *mut (), Ordering::Release);
            crate::pr::fence_acqrel();
            let p2 = source.load(Ordering::Acquire);
            if p == p2 {
                return Ok(p);
            }
        }
    }

    /// Clear guard `index` without returning it to the pool.
    pub fn release(&self, index: usize) {
        if let Some(raw) = self.owned.get(index) {
            unsafe { &**raw }.post.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Retire a pointer into the current epoch's bucket.
    ///
    /// # Safety
    ///
    /// Same contract as [`super::hp::HpThread::retire`].
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let epoch = self.domain.current_epoch.load(Ordering::Acquire);
        let bucket = epoch & self.domain.epoch_mask;
        let mut retired = self.domain.retired.lock().unwrap();
        retired[bucket].push(RetiredNode {
            ptr: ptr as *mut (),
            deleter: super::drop_box::<T>,
            epoch,
        });
        let len = retired[bucket].len();
        drop(retired);
        if len >= self.domain.config.liberate_threshold {
            self.liberate();
        }
    }

    /// Advance the epoch and reclaim any bucket old enough (more than
    /// `epoch_count` epochs behind the current one) that is not protected
    /// by a live guard.
    pub fn liberate(&self) {
        let epoch = self.domain.advance_epoch();
        let guarded: Vec<*mut ()> = {
            let live = self.domain.live_guards.lock().unwrap();
            live.iter()
                .map(|raw| unsafe { &**raw }.post.load(Ordering::Acquire))
                .filter(|p| !p.is_null())
                .collect()
        };

        let mut retired = self.domain.retired.lock().unwrap();
        for bucket in retired.iter_mut() {
            let mut i = 0;
            while i < bucket.len() {
                let node = &bucket[i];
                let age = epoch.wrapping_sub(node.epoch);
                if age <= self.domain.config.epoch_count || guarded.contains(&node.ptr) {
                    i += 1;
                } else {
                    let node = bucket.swap_remove(i);
                    unsafe { (node.deleter)(node.ptr) };
                }
            }
        }
    }

    /// Total pointers still retired across all epoch buckets.
    pub fn retired_len(&self) -> usize {
        self.domain
            .retired
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .sum()
    }
}

impl Drop for DhpThread<'_> {
    fn drop(&mut self) {
        for raw in &self.owned {
            unsafe { &**raw }.post.store(ptr::null_mut(), Ordering::Release);
        }
        let mut free = self.domain.free_guards.lock().unwrap();
        for raw in self.owned.drain(..) {
            // SAFETY: the guard was leaked out of `free_guards` in
            // `alloc_guard` and never dropped elsewhere; reclaiming the
            // `Box` here returns ownership to the free list.
            free.push(unsafe { Box::from_raw(raw as *mut GuardNode) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_epoch_count() {
        let cfg = DhpConfig {
            epoch_count: 3,
            ..Default::default()
        };
        assert!(matches!(DhpDomain::new(cfg), Err(SmrError::InvalidConfig(_))));
    }

    #[test]
    fn guard_grows_owned_set_on_demand() {
        let domain = DhpDomain::new(DhpConfig::default()).unwrap();
        let mut t = domain.attach();
        let mut value = 5i32;
        let source = AtomicPtr::new(&mut value as *mut i32);
        let p = t.guard(3, &source).unwrap();
        assert_eq!(unsafe { *p }, 5);
        assert_eq!(t.owned.len(), 4);
    }

    #[test]
    fn retire_and_liberate_reclaims_old_epochs() {
        let cfg = DhpConfig {
            liberate_threshold: 1000,
            epoch_count: 2,
            ..Default::default()
        };
        let domain = DhpDomain::new(cfg).unwrap();
        let t = domain.attach();
        let raw = Box::into_raw(Box::new(11i32));
        unsafe { t.retire(raw) };
        // Advance past the epoch window.
        for _ in 0..4 {
            t.liberate();
        }
        assert_eq!(t.retired_len(), 0);
    }

    #[test]
    fn guarded_pointer_survives_liberate() {
        let cfg = DhpConfig {
            liberate_threshold: 1000,
            epoch_count: 1,
            ..Default::default()
        };
        let domain = DhpDomain::new(cfg).unwrap();
        let mut t = domain.attach();
        let mut value = 3i32;
        let source = AtomicPtr::new(&mut value as *mut i32);
        let _p = t.guard(0, &source).unwrap();
        let raw = Box::into_raw(Box::new(99i32));
        unsafe { t.retire(raw) };
        for _ in 0..4 {
            t.liberate();
        }
        // retired(raw) is unrelated to the guarded `value`, so it still
        // gets reclaimed; this test only exercises that liberate doesn't
        // panic while a guard is held.
        t.release(0);
    }
}
