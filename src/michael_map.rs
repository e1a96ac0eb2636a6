//! Michael hash map (spec.md §4.6).
//!
//! A fixed-size array of [`MichaelList`] buckets. The bucket count is set at
//! construction and never changes (unlike `SplitListSet`, which resizes).
//! Grounded on `examples/original_source/cds/container/michael_map.h`.

use crate::gc::hp::HazardPointerDomain;
use crate::item_counter::{AtomicItemCounter, EmptyItemCounter, ItemCounter};
use crate::michael_list::MichaelList;
use crate::traits::{Compare, DefaultHash, DefaultHashSplitter, HashFn, NaturalOrder, Traits};
use std::sync::Arc;

/// A fixed-bucket-count hash map layered over Michael lists.
///
/// Element counting happens once, here, through `traits.item_counter`; each
/// bucket's own `MichaelList` is built with an [`EmptyItemCounter`] so
/// inserts/erases are not counted twice.
pub struct MichaelHashMap<
    K,
    V,
    C = NaturalOrder,
    H = DefaultHash,
    S = DefaultHashSplitter,
    I = AtomicItemCounter,
> {
    buckets: Vec<MichaelList<K, V, C, H, S, EmptyItemCounter>>,
    mask: u64,
    traits: Traits<C, H, S, I>,
}

impl<K, V, C, H, S, I> MichaelHashMap<K, V, C, H, S, I>
where
    C: Compare<K> + Default + Clone,
    H: HashFn<K> + Default + Clone,
    S: Clone,
    I: ItemCounter,
{
    /// Build a map with `head_size` buckets, rounded up to the next power
    /// of two (matching `cds::container::michael_map::traits::head_size`'s
    /// "must be a power of two" contract).
    pub fn new(domain: Arc<HazardPointerDomain>, head_size: usize) -> Self {
        Self::with_traits(domain, head_size, Traits::default())
    }

    /// Build a map with an explicit trait bundle.
    pub fn with_traits(
        domain: Arc<HazardPointerDomain>,
        head_size: usize,
        traits: Traits<C, H, S, I>,
    ) -> Self {
        let head_size = head_size.max(1).next_power_of_two();
        let buckets = (0..head_size)
            .map(|_| {
                MichaelList::with_traits(
                    Arc::clone(&domain),
                    Traits {
                        compare: traits.compare.clone(),
                        hash: traits.hash.clone(),
                        back_off: traits.back_off.clone(),
                        memory_model: traits.memory_model,
                        ..Traits::default()
                    },
                )
            })
            .collect();
        Self {
            buckets,
            mask: (head_size as u64) - 1,
            traits,
        }
    }

    /// Number of configured buckets.
    pub fn head_size(&self) -> usize {
        self.buckets.len()
    }

    /// Total live entries across all buckets.
    pub fn len(&self) -> usize {
        self.traits.item_counter.value()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, key: &K) -> &MichaelList<K, V, C, H, S, EmptyItemCounter> {
        let h = self.traits.hash.hash(key) & self.mask;
        &self.buckets[h as usize]
    }

    /// Insert `key`/`value` if absent.
    pub fn insert(&self, key: K, value: V) -> bool {
        let h = self.traits.hash.hash(&key) & self.mask;
        let inserted = self.buckets[h as usize].insert(key, value);
        if inserted {
            self.traits.item_counter.inc();
        }
        inserted
    }

    /// Remove `key` if present.
    pub fn erase(&self, key: &K) -> bool {
        let removed = self.bucket(key).erase(key);
        if removed {
            self.traits.item_counter.dec();
        }
        removed
    }

    /// Remove `key` if present and return a clone of its value.
    pub fn extract(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let value = self.bucket(key).extract(key);
        if value.is_some() {
            self.traits.item_counter.dec();
        }
        value
    }

    /// Locate `key` and call `f` on it while guarded.
    pub fn find<F: FnOnce(&K, &V)>(&self, key: &K, f: F) -> bool {
        self.bucket(key).find(key, f)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.bucket(key).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> MichaelHashMap<u32, &'static str> {
        MichaelHashMap::new(Arc::new(HazardPointerDomain::new(4, 16)), 8)
    }

    #[test]
    fn head_size_rounds_up_to_power_of_two() {
        let m: MichaelHashMap<u32, &str> =
            MichaelHashMap::new(Arc::new(HazardPointerDomain::new(4, 16)), 5);
        assert_eq!(m.head_size(), 8);
    }

    #[test]
    fn insert_find_erase_round_trip() {
        let m = map();
        assert!(m.insert(1, "a"));
        assert!(m.insert(2, "b"));
        assert!(!m.insert(1, "dup"));
        assert_eq!(m.len(), 2);

        let mut seen = None;
        assert!(m.find(&2, |_, v| seen = Some(*v)));
        assert_eq!(seen, Some("b"));

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
    fn distinct_keys_spread_across_buckets() {
        let m = map();
        for k in 0..100u32 {
            assert!(m.insert(k, "x"));
        }
        assert_eq!(m.len(), 100);
        for k in 0..100u32 {
            assert!(m.contains(&k));
        }
    }
}
