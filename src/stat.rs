//! Pluggable statistics counters (spec.md §3.11).
//!
//! Every counter is a debug/introspection surface only — no container or
//! SMR scheme branches on a `Stat` value, so swapping `EmptyStat` in for
//! `AtomicStat` never changes behavior, only whether the numbers are kept.
//! Mirrors `cds::atomicity::event_counter` / `cds::algo::flat_combining::stat`
//! and its `empty_stat` twin.

use std::sync::atomic::{AtomicUsize, Ordering};

/// The counters the flat-combining kernel and SMR schemes report through.
/// Field names match `cds::algo::flat_combining::stat`.
pub trait Stat: Default {
    /// A publication-list request was executed by the combiner.
    fn on_operation(&self);
    /// A thread ran one full combining pass as the combiner.
    fn on_combining(&self);
    /// The publication list was compacted.
    fn on_compact_publication_list(&self);
    /// A publication record was marked `Inactive`.
    fn on_deactivate_pub_record(&self);
    /// A publication record was reactivated after having been `Inactive`.
    fn on_activate_pub_record(&self);
    /// A new publication record was allocated.
    fn on_pub_record_created(&self);
    /// A publication record was freed.
    fn on_pub_record_deleted(&self);
    /// A thread acquired a publication record (new or reused).
    fn on_acquire_pub_record(&self);
    /// A thread released a publication record back to the pool.
    fn on_release_pub_record(&self);

    /// Snapshot of `(operation_count, combining_count)`, used to compute the
    /// combining factor (operations per combining pass).
    fn combining_factor(&self) -> f64;
}

/// No-op counters; every method is a zero-cost inline no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyStat;

impl Stat for EmptyStat {
    #[inline]
    fn on_operation(&self) {}
    #[inline]
    fn on_combining(&self) {}
    #[inline]
    fn on_compact_publication_list(&self) {}
    #[inline]
    fn on_deactivate_pub_record(&self) {}
    #[inline]
    fn on_activate_pub_record(&self) {}
    #[inline]
    fn on_pub_record_created(&self) {}
    #[inline]
    fn on_pub_record_deleted(&self) {}
    #[inline]
    fn on_acquire_pub_record(&self) {}
    #[inline]
    fn on_release_pub_record(&self) {}
    #[inline]
    fn combining_factor(&self) -> f64 {
        0.0
    }
}

/// Atomic counters, one `AtomicUsize` per event.
#[derive(Debug, Default)]
pub struct AtomicStat {
    operation_count: AtomicUsize,
    combining_count: AtomicUsize,
    compact_publication_list: AtomicUsize,
    deactivate_pub_record: AtomicUsize,
    activate_pub_record: AtomicUsize,
    pub_record_created: AtomicUsize,
    pub_record_deleted: AtomicUsize,
    acquire_pub_record: AtomicUsize,
    release_pub_record: AtomicUsize,
}

impl AtomicStat {
    /// Current operation count.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Current combining-pass count.
    pub fn combining_count(&self) -> usize {
        self.combining_count.load(Ordering::Relaxed)
    }
}

impl Stat for AtomicStat {
    fn on_operation(&self) {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
    }
    fn on_combining(&self) {
        self.combining_count.fetch_add(1, Ordering::Relaxed);
    }
    fn on_compact_publication_list(&self) {
        self.compact_publication_list.fetch_add(1, Ordering::Relaxed);
    }
    fn on_deactivate_pub_record(&self) {
        self.deactivate_pub_record.fetch_add(1, Ordering::Relaxed);
    }
    fn on_activate_pub_record(&self) {
        self.activate_pub_record.fetch_add(1, Ordering::Relaxed);
    }
    fn on_pub_record_created(&self) {
        self.pub_record_created.fetch_add(1, Ordering::Relaxed);
    }
    fn on_pub_record_deleted(&self) {
        self.pub_record_deleted.fetch_add(1, Ordering::Relaxed);
    }
    fn on_acquire_pub_record(&self) {
        self.acquire_pub_record.fetch_add(1, Ordering::Relaxed);
    }
    fn on_release_pub_record(&self) {
        self.release_pub_record.fetch_add(1, Ordering::Relaxed);
    }

    fn combining_factor(&self) -> f64 {
        let combining = self.combining_count() as f64;
        if combining == 0.0 {
            0.0
        } else {
            self.operation_count() as f64 / combining
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stat_combining_factor_is_zero() {
        let s = EmptyStat;
        s.on_operation();
        assert_eq!(s.combining_factor(), 0.0);
    }

    #[test]
    fn atomic_stat_tracks_combining_factor() {
        let s = AtomicStat::default();
        for _ in 0..10 {
            s.on_operation();
        }
        s.on_combining();
        s.on_combining();
        assert_eq!(s.operation_count(), 10);
        assert_eq!(s.combining_count(), 2);
        assert_eq!(s.combining_factor(), 5.0);
    }
}
