//! The trait-bundle / configuration-record pattern (spec.md §4.10).
//!
//! The original's containers compose their policy knobs via C++ template
//! inheritance (`struct my_traits : public cds::container::michael_map::traits`).
//! Safe Rust has no zero-cost analog, so every container here is generic
//! over one concrete [`Traits`] struct instead, configured with struct-update
//! syntax: `Traits { compare: MyCompare, ..Default::default() }`.

use crate::backoff::BackOffKind;
use crate::item_counter::{AtomicItemCounter, ItemCounter};
use crate::stat::EmptyStat;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A key comparator, pluggable independently of `Ord` so containers can be
/// instantiated with reverse or custom orderings without a newtype wrapper.
pub trait Compare<K: ?Sized> {
    /// Compare `a` to `b`.
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The default comparator: delegates to `K`'s own `Ord` impl.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<K: Ord + ?Sized> Compare<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// A hash function, pluggable independently of `std::hash::Hash`'s own
/// hasher selection.
pub trait HashFn<K: ?Sized> {
    /// Hash `key` to a 64-bit digest.
    fn hash(&self, key: &K) -> u64;
}

/// The default hash function: `std::hash::Hash` through `DefaultHasher`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHash;

impl<K: Hash + ?Sized> HashFn<K> for DefaultHash {
    fn hash(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

/// Decomposes a 64-bit hash into fixed-width bit groups for HAMT trie
/// navigation (Feldman set/map only). `slice(hash, offset, bits)` extracts
/// the `bits`-wide group starting at bit `offset` (0 = least significant),
/// matching how `cds::container::FeldmanHashSet` walks array nodes:
/// the root consumes bits `[0, head_bits)`, and each array node below it
/// consumes the next `array_bits`-wide group. `offset` is the cumulative
/// bit count consumed by all levels above the caller's, not `level * bits`
/// — the two only coincide when `head_bits == array_bits`.
pub trait HashSplitter {
    /// Extract the `bits`-wide group starting at bit `offset`.
    fn slice(hash: u64, offset: u32, bits: u32) -> usize;
}

/// The default splitter: least-significant-bit-first group extraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHashSplitter;

impl HashSplitter for DefaultHashSplitter {
    fn slice(hash: u64, offset: u32, bits: u32) -> usize {
        let mask = (1u64 << bits) - 1;
        ((hash >> offset) & mask) as usize
    }
}

/// Which `std::sync::atomic::Ordering`s the atomics shim (layer 1) uses for
/// load/store/CAS. `Relaxed` is safe only when paired with an SMR scheme
/// that supplies its own fences (HP/DHP guard loops, RCU grace periods);
/// `SeqCst` is the conservative default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryModel {
    /// Use `Ordering::Relaxed` where the algorithm allows it, relying on the
    /// SMR scheme's own fences for visibility.
    Relaxed,
    /// Use `Ordering::SeqCst` everywhere; the conservative default.
    #[default]
    SeqCst,
}

impl MemoryModel {
    /// The load ordering to use for this model.
    pub fn load(self) -> std::sync::atomic::Ordering {
        match self {
            MemoryModel::Relaxed => std::sync::atomic::Ordering::Acquire,
            MemoryModel::SeqCst => std::sync::atomic::Ordering::SeqCst,
        }
    }

    /// The store ordering to use for this model.
    pub fn store(self) -> std::sync::atomic::Ordering {
        match self {
            MemoryModel::Relaxed => std::sync::atomic::Ordering::Release,
            MemoryModel::SeqCst => std::sync::atomic::Ordering::SeqCst,
        }
    }
}

/// The configuration record every container in this crate is generic over.
///
/// Construct with `Traits::default()` or struct-update syntax:
/// `Traits { back_off: BackOffKind::Sleep(Sleep::default()), ..Default::default() }`.
/// Every `insert`/`erase`/`extract` in this crate's containers routes through
/// `item_counter` to maintain `len()`; swap in
/// [`EmptyItemCounter`](crate::item_counter::EmptyItemCounter) to measurably
/// disable counting (spec.md §3.12), or any other [`ItemCounter`]
/// implementation for a different cost/accuracy trade-off.
pub struct Traits<C = NaturalOrder, H = DefaultHash, S = DefaultHashSplitter, I = AtomicItemCounter>
{
    /// Key comparator.
    pub compare: C,
    /// Key hash function.
    pub hash: H,
    /// Element-count tracker, consulted by every mutating operation.
    pub item_counter: I,
    /// Statistics collector.
    pub stat: EmptyStat,
    /// Back-off strategy used by retry loops.
    pub back_off: BackOffKind,
    /// Atomic ordering policy.
    pub memory_model: MemoryModel,
    pub(crate) _splitter: PhantomData<S>,
}

impl<C: Default, H: Default, S, I: ItemCounter> Default for Traits<C, H, S, I> {
    fn default() -> Self {
        Self {
            compare: C::default(),
            hash: H::default(),
            item_counter: I::default(),
            stat: EmptyStat,
            back_off: BackOffKind::default(),
            memory_model: MemoryModel::default(),
            _splitter: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_traits_use_natural_order_and_default_hash() {
        let t: Traits = Traits::default();
        assert_eq!(t.compare.compare(&1, &2), Ordering::Less);
        assert_eq!(t.hash.hash(&1u32), t.hash.hash(&1u32));
    }

    #[test]
    fn struct_update_overrides_a_single_field() {
        let t: Traits = Traits {
            memory_model: MemoryModel::Relaxed,
            ..Default::default()
        };
        assert_eq!(t.memory_model, MemoryModel::Relaxed);
    }

    #[test]
    fn hash_splitter_round_trips_bit_groups() {
        let hash: u64 = 0xABCD_1234_0000_0001;
        let bits = 8;
        let levels = 64 / bits;
        let mut rebuilt: u64 = 0;
        for level in 0..levels {
            let offset = level * bits;
            let slice = DefaultHashSplitter::slice(hash, offset, bits) as u64;
            rebuilt |= slice << offset;
        }
        assert_eq!(rebuilt, hash);
    }

    #[test]
    fn hash_splitter_is_least_significant_bit_first() {
        // spec.md §8 Scenario 2: head_bits=4, array_bits=2, hash=0x12 must
        // select root slot 2 (bits [0,4) of 0x12 = 0b0010).
        assert_eq!(DefaultHashSplitter::slice(0x12, 0, 4), 2);
        // Depth-1 array node consumes bits [4,6): both 0x12 and 0x13 yield
        // slice 0b01, so they still collide one level deeper.
        assert_eq!(DefaultHashSplitter::slice(0x12, 4, 2), 0b01);
        assert_eq!(DefaultHashSplitter::slice(0x13, 4, 2), 0b01);
    }
}
