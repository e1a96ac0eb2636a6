//! Split-ordered list set (spec.md §4.7).
//!
//! Incrementally resizable hash set built atop a single [`MichaelList`]
//! whose keys are bit-reversed so that doubling the logical bucket count
//! never requires relinking existing nodes. Dummy nodes partition the list
//! at bit-reversed bucket indices; real nodes carry a bit-reversed hash
//! with a trailing 1 bit so they always sort after their owning dummy.
//!
//! Simplification against `examples/original_source/cds/container/split_list_set.h`:
//! the original keeps an explicit trie/array of *pointers* to each bucket's
//! dummy node so a lookup can jump straight to its segment. This crate
//! tracks only *whether* a bucket has been initialized (`AtomicBool` per
//! slot) and always searches the underlying list from its head; still
//! linearizable and lock-free, just O(n) instead of O(1) to the segment
//! start. Noted in `DESIGN.md`.

use crate::cc::{clear_highest_set_bit, reverse_bits};
use crate::gc::hp::HazardPointerDomain;
use crate::item_counter::{AtomicItemCounter, EmptyItemCounter, ItemCounter};
use crate::michael_list::MichaelList;
use crate::traits::{DefaultHash, DefaultHashSplitter, HashFn, NaturalOrder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

enum Entry<K, V> {
    Dummy,
    Real(K, V),
}

/// A lock-free, incrementally resizable hash set.
///
/// Counts only real entries through `item_counter`, via `insert`/`erase`
/// here; the underlying `MichaelList` is built with an [`EmptyItemCounter`]
/// so dummy-node bookkeeping never shows up in `len()`.
pub struct SplitListSet<K, V, H = DefaultHash, I = AtomicItemCounter> {
    list: MichaelList<u64, Entry<K, V>, NaturalOrder, H, DefaultHashSplitter, EmptyItemCounter>,
    hash: H,
    capacity: AtomicUsize,
    max_capacity: usize,
    load_factor: f64,
    initialized: Vec<AtomicBool>,
    item_counter: I,
}

fn dummy_key(bucket: usize) -> u64 {
    reverse_bits(bucket as u64)
}

fn real_key(hash: u64) -> u64 {
    reverse_bits(hash) | 1
}

impl<K, V, H: HashFn<K> + Default + Clone, I: ItemCounter> SplitListSet<K, V, H, I> {
    /// Build a set starting with `initial_capacity` buckets (rounded up to
    /// a power of two), growing on demand up to `max_capacity` buckets
    /// whenever the load factor is exceeded.
    pub fn new(
        domain: Arc<HazardPointerDomain>,
        initial_capacity: usize,
        max_capacity: usize,
        load_factor: f64,
    ) -> Self {
        let initial_capacity = initial_capacity.max(1).next_power_of_two();
        let max_capacity = max_capacity.max(initial_capacity).next_power_of_two();
        let hash = H::default();
        let list = MichaelList::with_traits(
            domain,
            crate::traits::Traits {
                hash: hash.clone(),
                ..crate::traits::Traits::default()
            },
        );
        // Bucket 0's dummy is the list head in the original; here it is a
        // physical dummy node like any other, inserted eagerly so bucket 0
        // is always considered initialized.
        list.insert(dummy_key(0), Entry::Dummy);
        let initialized: Vec<AtomicBool> = (0..max_capacity)
            .map(|i| AtomicBool::new(i == 0))
            .collect();
        Self {
            list,
            hash,
            capacity: AtomicUsize::new(initial_capacity),
            max_capacity,
            load_factor,
            initialized,
            item_counter: I::default(),
        }
    }

    /// Current logical bucket count.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.item_counter.value()
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_bucket(&self, bucket: usize) {
        if self.initialized[bucket].load(Ordering::Acquire) {
            return;
        }
        let parent = clear_highest_set_bit(bucket);
        if parent != bucket {
            self.ensure_bucket(parent);
        }
        self.list.insert(dummy_key(bucket), Entry::Dummy);
        self.initialized[bucket].store(true, Ordering::Release);
    }

    fn maybe_grow(&self) {
        let cap = self.capacity.load(Ordering::Acquire);
        if cap >= self.max_capacity {
            return;
        }
        if self.item_counter.value() as f64 / cap as f64 > self.load_factor {
            let _ = self.capacity.compare_exchange(
                cap,
                (cap * 2).min(self.max_capacity),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Insert `key` if absent.
    pub fn insert(&self, key: K, value: V) -> bool {
        let h = self.hash.hash(&key);
        let bucket = (h as usize) & (self.capacity() - 1);
        self.ensure_bucket(bucket);
        let inserted = self.list.insert(real_key(h), Entry::Real(key, value));
        if inserted {
            self.item_counter.inc();
            self.maybe_grow();
        }
        inserted
    }

    /// Remove `key` if present.
    pub fn erase(&self, key: &K) -> bool {
        let h = self.hash.hash(key);
        let bucket = (h as usize) & (self.capacity() - 1);
        self.ensure_bucket(bucket);
        let removed = self.list.erase(&real_key(h));
        if removed {
            self.item_counter.dec();
        }
        removed
    }

    /// Locate `key` and call `f` on it while guarded.
    pub fn find<F: FnOnce(&K, &V)>(&self, key: &K, f: F) -> bool {
        let h = self.hash.hash(key);
        let bucket = (h as usize) & (self.capacity() - 1);
        self.ensure_bucket(bucket);
        self.list.find(&real_key(h), |_, entry| {
            if let Entry::Real(k, v) = entry {
                f(k, v);
            }
        })
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.find(key, |_, _| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> SplitListSet<u32, &'static str> {
        SplitListSet::new(Arc::new(HazardPointerDomain::new(4, 16)), 4, 64, 0.75)
    }

    #[test]
    fn bucket_zero_is_initialized_eagerly() {
        let s = set();
        assert_eq!(s.capacity(), 4);
    }

    #[test]
    fn insert_find_erase_round_trip() {
        let s = set();
        assert!(s.insert(1, "one"));
        assert!(s.insert(2, "two"));
        assert!(!s.insert(1, "dup"));
        assert_eq!(s.len(), 2);

        let mut seen = None;
        assert!(s.find(&2, |_, v| seen = Some(*v)));
        assert_eq!(seen, Some("two"));

        assert!(s.erase(&1));
        assert!(!s.contains(&1));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn grows_capacity_past_load_factor() {
        let s = set();
        for k in 0..10u32 {
            s.insert(k, "x");
        }
        assert!(s.capacity() > 4);
        for k in 0..10u32 {
            assert!(s.contains(&k));
        }
    }

    #[test]
    fn capacity_never_exceeds_max() {
        let s = SplitListSet::<u32, &str>::new(Arc::new(HazardPointerDomain::new(4, 16)), 2, 8, 0.5);
        for k in 0..200u32 {
            s.insert(k, "x");
        }
        assert_eq!(s.capacity(), 8);
    }
}
