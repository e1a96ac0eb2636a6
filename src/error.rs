//! Error taxonomy (spec.md §7).
//!
//! Container operations never fail through this type — key-present,
//! key-absent, and capacity-exhaustion outcomes are signalled through the
//! operation's own `bool`/`Option` return value, per spec.md §7. `SmrError`
//! is reserved for the SMR substrate's own resource failures and
//! configuration mistakes.

use thiserror::Error;

/// Errors raised by the safe-memory-reclamation substrate.
#[derive(Debug, Error)]
pub enum SmrError {
    /// A thread asked to guard more pointers than the domain was
    /// constructed to support (spec.md §4.1.3).
    #[error("hazard pointer slots exhausted (max {max} per thread)")]
    HazardSlotsExhausted {
        /// The configured per-thread slot limit.
        max: usize,
    },

    /// A construction-time parameter violated an invariant (e.g. DHP's
    /// `epoch_count` must be a power of two, spec.md §6).
    #[error("invalid SMR configuration: {0}")]
    InvalidConfig(&'static str),

    /// `synchronize()` (or an extracting operation that implies it) was
    /// called from within an RCU read-side critical section on the same
    /// thread, which would deadlock (spec.md §4.3.2, §7).
    #[error("synchronize() called from within an RCU read-side critical section")]
    RcuRecursiveSynchronize,
}

/// Result alias for SMR-substrate operations.
pub type SmrResult<T> = Result<T, SmrError>;

/// How an `RcuDomain` reacts to `synchronize()` being called from within a
/// read-side critical section on the same thread (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlockPolicy {
    /// Return `Err(SmrError::RcuRecursiveSynchronize)`.
    #[default]
    Return,
    /// Panic via `assert!`.
    Assert,
    /// Proceed anyway; the caller accepts the risk of deadlock.
    Ignore,
}
