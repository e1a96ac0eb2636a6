//! General-purpose threaded RCU (spec.md §4.3, "General-purpose threaded"
//! row): a dedicated background thread detects grace periods and drains the
//! retire queue; `synchronize` just waits for one such pass to finish.
//!
//! Grounded on the teacher's `ec.rs` event-count idiom for the wait/notify
//! handshake between callers and the background thread, combined with the
//! same parity-counter reader registry as
//! [`super::buffered::BufferedRcu`].

use crate::error::{DeadlockPolicy, SmrError, SmrResult};
use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::{DeferredFree, ReaderRecord};

thread_local! {
    static LOCAL: RefCell<Vec<(usize, *const ReaderRecord)>> = RefCell::new(Vec::new());
}

enum Message {
    Retire(DeferredFree),
    Synchronize(Sender<()>),
    Shutdown,
}

struct Shared {
    records: AtomicPtr<ReaderRecord>,
}

unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn snapshot(&self) -> Vec<(*const ReaderRecord, usize)> {
        let mut out = Vec::new();
        let mut cur = self.records.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            if rec.active.load(Ordering::Acquire) {
                let p = rec.parity.load(Ordering::Acquire);
                if p % 2 == 1 {
                    out.push((cur as *const ReaderRecord, p));
                }
            }
            cur = rec.next.load(Ordering::Acquire);
        }
        out
    }
}

fn worker_loop(shared: Arc<Shared>, rx: mpsc::Receiver<Message>) {
    let mut pending: Vec<DeferredFree> = Vec::new();
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Retire(node) => pending.push(node),
            Message::Shutdown => break,
            Message::Synchronize(ack) => {
                let mut snapshot = shared.snapshot();
                let mut backoff = crate::backoff::Exponential::new();
                use crate::backoff::BackOff;
                while !snapshot.is_empty() {
                    snapshot.retain(|(rec, seen)| {
                        let now = unsafe { &**rec }.parity.load(Ordering::Acquire);
                        now == *seen
                    });
                    if !snapshot.is_empty() {
                        backoff.spin();
                    }
                }
                for node in pending.drain(..) {
                    unsafe { (node.deleter)(node.ptr) };
                }
                let _ = ack.send(());
            }
        }
    }
    for node in pending.drain(..) {
        unsafe { (node.deleter)(node.ptr) };
    }
}

/// A threaded RCU domain: retirement and grace-period detection happen on a
/// background worker rather than in the calling thread.
pub struct ThreadedRcu {
    shared: Arc<Shared>,
    tx: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
    deadlock_policy: DeadlockPolicy,
}

unsafe impl Send for ThreadedRcu {}
unsafe impl Sync for ThreadedRcu {}

impl ThreadedRcu {
    pub(crate) fn new(buffer_size_hint: usize) -> Self {
        let shared = Arc::new(Shared {
            records: AtomicPtr::new(ptr::null_mut()),
        });
        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("concurrent-ds-rcu-gc".into())
            .spawn(move || worker_loop(worker_shared, rx))
            .expect("failed to spawn RCU background thread");
        let _ = buffer_size_hint;
        Self {
            shared,
            tx,
            worker: Mutex::new(Some(handle)),
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

    fn local_record(&self) -> *const ReaderRecord {
        let key = self.domain_key();
        LOCAL.with(|local| {
            let mut local = local.borrow_mut();
            if let Some((_, rec)) = local.iter().find(|(k, _)| *k == key) {
                return *rec;
            }
            let boxed = Box::into_raw(Box::new(ReaderRecord::new()));
            loop {
                let head = self.shared.records.load(Ordering::Relaxed);
                unsafe { (*boxed).next.store(head, Ordering::Relaxed) };
                if self
                    .shared
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

impl super::RcuDomain for ThreadedRcu {
    fn read_lock(&self) {
        unsafe { &*self.local_record() }.read_lock();
    }

    fn read_unlock(&self) {
        unsafe { &*self.local_record() }.read_unlock();
    }

    unsafe fn retire<T>(&self, ptr: *mut T) {
        let _ = self.tx.send(Message::Retire(DeferredFree {
            ptr: ptr as *mut (),
            deleter: crate::gc::drop_box::<T>,
        }));
    }

    fn synchronize(&self) -> SmrResult<()> {
        let rec = self.local_record();
        if unsafe { &*rec }.in_cs() {
            log::error!("concurrent_ds::gc::rcu::threaded: synchronize() called from within a read-side critical section");
            return match self.deadlock_policy {
                DeadlockPolicy::Return => Err(SmrError::RcuRecursiveSynchronize),
                DeadlockPolicy::Assert => {
                    panic!("synchronize() called from within an RCU read-side critical section")
                }
                DeadlockPolicy::Ignore => Ok(()),
            };
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Message::Synchronize(ack_tx)).is_err() {
            return Ok(()); // worker already shut down; nothing to wait for.
        }
        let _ = ack_rx.recv();
        Ok(())
    }
}

impl Drop for ThreadedRcu {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut head = self.shared.records.load(Ordering::Relaxed);
        while !head.is_null() {
            let rec = unsafe { Box::from_raw(head) };
            head = rec.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::RcuDomain;
    use super::*;

    #[test]
    fn read_section_round_trips() {
        let rcu = ThreadedRcu::new(8);
        rcu.read_lock();
        rcu.read_unlock();
        assert!(rcu.synchronize().is_ok());
    }

    #[test]
    fn synchronize_drains_retired_pointers() {
        let rcu = ThreadedRcu::new(8);
        let raw = Box::into_raw(Box::new(9i32));
        unsafe { rcu.retire(raw) };
        assert!(rcu.synchronize().is_ok());
    }

    #[test]
    fn synchronize_from_inside_cs_is_rejected_by_default() {
        let rcu = ThreadedRcu::new(8);
        rcu.read_lock();
        assert!(matches!(
            rcu.synchronize(),
            Err(SmrError::RcuRecursiveSynchronize)
        ));
        rcu.read_unlock();
    }
}
