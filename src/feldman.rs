//! Feldman hash map — a concurrent hash-array-mapped trie (spec.md §4.8).
//!
//! The hash is consumed by a [`HashSplitter`] that yields successive
//! bit-slices: `head_bits` wide for the root, `array_bits` wide for every
//! array node below it. A slot holds a tagged pointer: untagged points to a
//! [`Leaf`], tagged (low bit set) points to a child [`ArrayNode`]; null
//! means empty. Grounded on
//! `examples/original_source/test/unit/map/test_feldman_hashmap_hp.h` for
//! operation semantics and on
//! `examples/other_examples/28fbb34f_skytable-skytable__server-src-engine-idx-mtchm-mod.rs.rs`
//! for the tagged-slot trie-of-arrays representation in safe-ish Rust.

use crate::error::{SmrError, SmrResult};
use crate::gc::hp::HazardPointerDomain;
use crate::item_counter::{AtomicItemCounter, ItemCounter};
use crate::traits::{DefaultHash, DefaultHashSplitter, HashFn, HashSplitter};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

struct Leaf<K, V> {
    key: K,
    value: V,
}

struct ArrayNode {
    slots: Box<[AtomicPtr<()>]>,
}

impl ArrayNode {
    fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }
}

const TAG_ARRAY: usize = 1;

#[inline]
fn is_array(p: *mut ()) -> bool {
    (p as usize) & TAG_ARRAY != 0
}

#[inline]
fn untag(p: *mut ()) -> *mut () {
    ((p as usize) & !TAG_ARRAY) as *mut ()
}

#[inline]
fn tag_array(p: *mut ArrayNode) -> *mut () {
    ((p as usize) | TAG_ARRAY) as *mut ()
}

/// A concurrent HAMT set/map reclaimed through hazard pointers.
pub struct FeldmanHashMap<K, V, H = DefaultHash, S = DefaultHashSplitter, I = AtomicItemCounter> {
    root: ArrayNode,
    head_bits: u32,
    array_bits: u32,
    max_depth: u32,
    domain: Arc<HazardPointerDomain>,
    hash: H,
    item_counter: I,
    _splitter: PhantomData<S>,
    _kv: PhantomData<fn() -> (K, V)>,
}

impl<K, V, H: HashFn<K> + Default, S: HashSplitter, I: ItemCounter> FeldmanHashMap<K, V, H, S, I> {
    /// Build an empty map. `hash_size` is the number of meaningful bits the
    /// configured hash produces (64 for the default [`HashFn`]); the trie's
    /// maximum depth is derived from it so a fully-covering splitter never
    /// hits the unbounded-collision path (spec.md §4.8.2).
    pub fn new(
        domain: Arc<HazardPointerDomain>,
        head_bits: u32,
        array_bits: u32,
        hash_size: u32,
    ) -> SmrResult<Self> {
        if head_bits == 0 || array_bits == 0 || hash_size < head_bits {
            log::error!("concurrent_ds::feldman: invalid trie geometry (head_bits={head_bits}, array_bits={array_bits}, hash_size={hash_size})");
            return Err(SmrError::InvalidConfig(
                "head_bits and array_bits must be nonzero and hash_size >= head_bits",
            ));
        }
        let remaining = hash_size - head_bits;
        let max_depth = remaining.div_ceil(array_bits) + 1;
        Ok(Self {
            root: ArrayNode::new(1usize << head_bits),
            head_bits,
            array_bits,
            max_depth,
            domain,
            hash: H::default(),
            item_counter: I::default(),
            _splitter: PhantomData,
            _kv: PhantomData,
        })
    }

    fn bits_at(&self, level: u32) -> u32 {
        if level == 0 {
            self.head_bits
        } else {
            self.array_bits
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.item_counter.value()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `key`/`value` if absent.
    pub fn insert(&self, key: K, value: V) -> bool
    where
        K: PartialEq,
    {
        let h = self.hash.hash(&key);
        let leaf_ptr = Box::into_raw(Box::new(Leaf { key, value }));
        let t = self.domain.local_thread();
        let mut node = &self.root;
        let mut level = 0u32;
        let mut offset = 0u32;
        loop {
            let bits = self.bits_at(level);
            let idx = S::slice(h, offset, bits);
            let slot = &node.slots[idx];
            let raw = t
                .guard(0, slot)
                .expect("feldman requires >= 1 hazard slot per thread");

            if raw.is_null() {
                if slot
                    .compare_exchange(ptr::null_mut(), leaf_ptr as *mut (), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.item_counter.inc();
                    return true;
                }
                continue;
            }

            if is_array(raw) {
                node = unsafe { &*(untag(raw) as *const ArrayNode) };
                offset += bits;
                level += 1;
                continue;
            }

            let existing = unsafe { &*(raw as *const Leaf<K, V>) };
            if &existing.key == unsafe { &(*leaf_ptr).key } {
                unsafe { drop(Box::from_raw(leaf_ptr)) };
                return false;
            }
            if level >= self.max_depth {
                unsafe { drop(Box::from_raw(leaf_ptr)) };
                return false;
            }

            let next_offset = offset + bits;
            let next_level = level + 1;
            let next_bits = self.bits_at(next_level);
            let new_array = Box::new(ArrayNode::new(1usize << next_bits));
            let existing_h = self.hash.hash(&existing.key);
            let existing_idx = S::slice(existing_h, next_offset, next_bits);
            let new_idx = S::slice(h, next_offset, next_bits);
            new_array.slots[existing_idx].store(raw, Ordering::Relaxed);
            let placed_leaf_here = existing_idx != new_idx;
            if placed_leaf_here {
                new_array.slots[new_idx].store(leaf_ptr as *mut (), Ordering::Relaxed);
            }
            let new_array_ptr = Box::into_raw(new_array);
            let tagged = tag_array(new_array_ptr);

            if slot
                .compare_exchange(raw, tagged, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if placed_leaf_here {
                    self.item_counter.inc();
                    return true;
                }
                // Both leaves collided at `next_offset`'s slice; descend
                // into the freshly-linked array and keep splitting.
                node = unsafe { &*new_array_ptr };
                level = next_level;
                offset = next_offset;
                continue;
            }
            unsafe { drop(Box::from_raw(new_array_ptr)) };
        }
    }

    fn locate(&self, t: &crate::gc::hp::HpThreadRef<'_>, key: &K) -> *mut ()
    where
        K: PartialEq,
    {
        let h = self.hash.hash(key);
        let mut node = &self.root;
        let mut level = 0u32;
        let mut offset = 0u32;
        loop {
            let bits = self.bits_at(level);
            let idx = S::slice(h, offset, bits);
            let raw = t
                .guard(0, &node.slots[idx])
                .expect("feldman requires >= 1 hazard slot per thread");
            if raw.is_null() {
                return ptr::null_mut();
            }
            if is_array(raw) {
                node = unsafe { &*(untag(raw) as *const ArrayNode) };
                offset += bits;
                level += 1;
                continue;
            }
            let existing = unsafe { &*(raw as *const Leaf<K, V>) };
            if &existing.key == key {
                return raw;
            }
            return ptr::null_mut();
        }
    }

    /// Locate `key` and call `f` on it while guarded.
    pub fn find<F: FnOnce(&K, &V)>(&self, key: &K, f: F) -> bool
    where
        K: PartialEq,
    {
        let t = self.domain.local_thread();
        let raw = self.locate(&t, key);
        if raw.is_null() {
            return false;
        }
        let leaf = unsafe { &*(raw as *const Leaf<K, V>) };
        f(&leaf.key, &leaf.value);
        true
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool
    where
        K: PartialEq,
    {
        self.find(key, |_, _| {})
    }

    /// Remove `key` if present.
    pub fn erase(&self, key: &K) -> bool
    where
        K: PartialEq,
    {
        let h = self.hash.hash(key);
        let t = self.domain.local_thread();
        let mut node = &self.root;
        let mut level = 0u32;
        let mut offset = 0u32;
        loop {
            let bits = self.bits_at(level);
            let idx = S::slice(h, offset, bits);
            let slot = &node.slots[idx];
            let raw = t
                .guard(0, slot)
                .expect("feldman requires >= 1 hazard slot per thread");
            if raw.is_null() {
                return false;
            }
            if is_array(raw) {
                node = unsafe { &*(untag(raw) as *const ArrayNode) };
                offset += bits;
                level += 1;
                continue;
            }
            let existing = unsafe { &*(raw as *const Leaf<K, V>) };
            if &existing.key != key {
                return false;
            }
            if slot
                .compare_exchange(raw, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe { t.retire(raw as *mut Leaf<K, V>) };
                self.item_counter.dec();
                return true;
            }
            // Lost the race; re-read and retry at the same slot.
        }
    }

    /// Remove `key` if present and return a clone of its value.
    pub fn extract(&self, key: &K) -> Option<V>
    where
        K: PartialEq + Clone,
        V: Clone,
    {
        let t = self.domain.local_thread();
        let raw = self.locate(&t, key);
        if raw.is_null() {
            return None;
        }
        // Re-run as an erase so the CAS and retire stay paired; `locate`
        // above only proves presence at the time of the snapshot read.
        let leaf = unsafe { &*(raw as *const Leaf<K, V>) };
        let value = leaf.value.clone();
        if self.erase(key) {
            Some(value)
        } else {
            None
        }
    }
}

fn free_array_node_recursive(node: *mut ArrayNode) {
    if node.is_null() {
        return;
    }
    let boxed = unsafe { Box::from_raw(node) };
    for slot in boxed.slots.iter() {
        let raw = slot.load(Ordering::Relaxed);
        if raw.is_null() {
            continue;
        }
        if is_array(raw) {
            free_array_node_recursive(untag(raw) as *mut ArrayNode);
        }
        // Leaves are dropped by `FeldmanHashMap::drop`'s caller, which
        // knows `K`/`V`; this free-standing helper only owns `ArrayNode`s.
    }
}

impl<K, V, H, S, I> Drop for FeldmanHashMap<K, V, H, S, I> {
    fn drop(&mut self) {
        fn free_leaves_recursive<K, V>(node: &ArrayNode) {
            for slot in node.slots.iter() {
                let raw = slot.load(Ordering::Relaxed);
                if raw.is_null() {
                    continue;
                }
                if is_array(raw) {
                    let child = unsafe { &*(untag(raw) as *const ArrayNode) };
                    free_leaves_recursive::<K, V>(child);
                } else {
                    unsafe { drop(Box::from_raw(raw as *mut Leaf<K, V>)) };
                }
            }
        }
        free_leaves_recursive::<K, V>(&self.root);
        for slot in self.root.slots.iter() {
            let raw = slot.load(Ordering::Relaxed);
            if is_array(raw) {
                free_array_node_recursive(untag(raw) as *mut ArrayNode);
            }
        }
    }
}

// SAFETY: all shared mutation goes through atomics and the HP domain.
unsafe impl<K: Send, V: Send, H: Send, S: Send, I: Send> Send
    for FeldmanHashMap<K, V, H, S, I>
{
}
unsafe impl<K: Send, V: Send, H: Sync, S: Sync, I: Sync> Sync
    for FeldmanHashMap<K, V, H, S, I>
{
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> FeldmanHashMap<u32, &'static str> {
        FeldmanHashMap::new(Arc::new(HazardPointerDomain::new(4, 16)), 4, 4, 64).unwrap()
    }

    #[test]
    fn rejects_zero_bit_geometry() {
        let r = FeldmanHashMap::<u32, &str>::new(Arc::new(HazardPointerDomain::new(4, 16)), 0, 4, 64);
        assert!(matches!(r, Err(SmrError::InvalidConfig(_))));
    }

    #[test]
    fn insert_find_erase_round_trip() {
        let m = map();
        assert!(m.insert(1, "one"));
        assert!(m.insert(2, "two"));
        assert!(!m.insert(1, "dup"));
        assert_eq!(m.len(), 2);

        let mut seen = None;
        assert!(m.find(&2, |_, v| seen = Some(*v)));
        assert_eq!(seen, Some("two"));

        assert!(m.erase(&1));
        assert!(!m.contains(&1));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn extract_returns_owned_value() {
        let m = map();
        m.insert(9, "nine");
        assert_eq!(m.extract(&9), Some("nine"));
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn many_keys_split_the_trie_without_loss() {
        let m = map();
        for k in 0..500u32 {
            assert!(m.insert(k, "x"));
        }
        assert_eq!(m.len(), 500);
        for k in 0..500u32 {
            assert!(m.contains(&k));
        }
    }
}
