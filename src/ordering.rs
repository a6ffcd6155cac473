//! Standard memory orderings for concurrent index access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for lock-free reader loads: hash-entry words, overflow-bucket
/// links, skiplist next pointers. Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publication stores performed under a slot lock or a
/// write-position lock set. Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success on next pointers.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure. Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for accesses already serialized by a lock or by
/// single-threaded construction (rebuild, teardown).
pub const RELAXED: Ordering = Ordering::Relaxed;
