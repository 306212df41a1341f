//! Memory orderings for the snapshot/commit protocol, named by role.
//!
//! Every atomic access in this crate is one of three things: a reader-side
//! load that must observe a prior commit store, a writer-side store that a
//! commit will publish, or an access already serialized by the writer lock
//! or by exclusive ownership of not-yet-reachable memory. Naming the
//! orderings after those roles keeps the intent visible at each call site.

use std::sync::atomic::Ordering;

/// Reader-side loads: state-word snapshots, record/sibling/leaf reads,
/// anchor and entrance reads. Pairs with [`WRITE_ORD`] stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Writer-side stores, staged data and the 8-byte commit store alike.
/// Pairs with [`READ_ORD`] loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Accesses serialized by a lock or touching memory no reader can reach
/// yet (pool cursor under the allocator mutex, build-time reads).
pub const RELAXED: Ordering = Ordering::Relaxed;
