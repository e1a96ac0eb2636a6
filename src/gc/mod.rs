//! Safe memory reclamation schemes (spec.md §4.1 – §4.3).
//!
//! Three families share the same conceptual surface — acquire a
//! protection, publish a retired pointer, and (for RCU) a read-side
//! critical section — but differ enough in their concrete APIs that this
//! crate does not force them behind one trait. Containers are written
//! against whichever scheme's module they need (`hp`, `dhp`, or `rcu`).

pub mod dhp;
pub mod hp;
pub mod rcu;

/// A type-erased deleter invoked by a reclamation scheme once it has
/// proven no protection references the pointer.
///
/// # Safety
///
/// The function must treat its argument as the same `*mut T` it was
/// paired with at retire time and must not be called more than once per
/// pointer.
pub(crate) type Deleter = unsafe fn(*mut ());

pub(crate) unsafe fn drop_box<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}
