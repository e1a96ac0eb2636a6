//! # concurrent-ds
//!
//! Safe memory reclamation schemes, a flat-combining kernel, and a family
//! of lock-free data structures built on top of them.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`cc`] - Bit manipulation primitives (ffs, ctz, popcount, bit-reversal)
//! - [`error`] - The SMR substrate's error taxonomy
//!
//! ### Core Primitives
//! - [`pr`] - Atomic primitives and memory barriers
//! - [`mod@backoff`] - Back-off strategies for contention management
//! - [`spinlock`] - The flat-combining kernel's combiner lock
//! - [`stat`] - Pluggable statistics counters
//! - [`item_counter`] - Pluggable element-count tracking
//! - [`traits`] - The container trait-bundle / configuration record
//!
//! ### Safe Memory Reclamation
//! - [`gc::hp`] - Hazard pointers
//! - [`gc::dhp`] - Dynamic hazard pointers
//! - [`gc::rcu`] - Buffered, threaded, and signal-flavored RCU
//!
//! ### Flat Combining
//! - [`flat_combining`] - Turns a sequential container into a concurrent one
//!
//! ### Containers
//! - [`michael_list`] - Lock-free sorted linked list
//! - [`michael_map`] - Fixed-bucket-count hash map over Michael lists
//! - [`split_list`] - Incrementally resizable hash set
//! - [`feldman`] - Concurrent hash-array-mapped trie
//! - [`mspriority_queue`] - Bounded array-backed concurrent priority queue

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

/// Bit manipulation primitives.
///
/// Provides `ffs`/`ctz`/`popcount` plus the bit-reversal and
/// highest-bit-clearing helpers `split_list` uses for its bucket math.
pub mod cc;

/// Atomic primitives and memory barriers.
pub mod pr;

/// Back-off strategies for contention management.
pub mod backoff;

/// The flat-combining kernel's combiner lock.
pub mod spinlock;

/// The SMR substrate's error taxonomy.
pub mod error;

/// Pluggable statistics counters.
pub mod stat;

/// Pluggable element-count tracking.
pub mod item_counter;

/// The container trait-bundle / configuration record.
pub mod traits;

/// Safe memory reclamation schemes: hazard pointers, dynamic hazard
/// pointers, and RCU.
pub mod gc;

/// The flat-combining kernel.
pub mod flat_combining;

/// Lock-free sorted linked list.
pub mod michael_list;

/// Fixed-bucket-count hash map over Michael lists.
pub mod michael_map;

/// Incrementally resizable hash set.
pub mod split_list;

/// Concurrent hash-array-mapped trie.
pub mod feldman;

/// Bounded array-backed concurrent priority queue.
pub mod mspriority_queue;

pub use cc::{ctz, ffs, ffs_u64, popcount};
pub use error::{SmrError, SmrResult};
