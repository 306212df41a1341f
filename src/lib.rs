//! # pmtree
//!
//! A hybrid index for byte-addressable persistent memory, built from two
//! cooperating trees over one PM pool:
//!
//! - [`FixTree`]: the upper, search-optimized index. Bulk-built from a
//!   sorted record stream into dense, pointer-free arrays; leaves keep
//!   reserved gaps for in-place inserts and deletes are lazy.
//! - [`WriteTree`]: the lower, write-optimized B+-tree. 256-byte nodes
//!   with unordered slots; a packed 64-bit state word carries the sorted
//!   slot permutation, so every insert or delete commits with a single
//!   8-byte store.
//!
//! Durability comes from per-operation ordering (data flush, fence, state
//! commit, flush) instead of a write-ahead log: any committed state is
//! consistent and uncommitted work is unreachable. See the [`pmem`] module
//! for the primitives and the crash model.
//!
//! ## Concurrency
//!
//! Single writer, many readers, per tree. Readers snapshot a node's state
//! word once and derive every index from the snapshot; writers publish
//! exclusively through commit stores.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmtree::{Pool, WriteTree, InsertOutcome};
//!
//! let pool = Arc::new(Pool::anonymous(1 << 20)?);
//! let tree = WriteTree::create(Arc::clone(&pool), 8);
//! assert_eq!(tree.insert(42, 7), InsertOutcome::Done);
//! assert_eq!(tree.find(42), Some(7));
//! # Ok::<(), pmtree::TreeError>(())
//! ```

pub mod error;
pub mod fixtree;
mod node;
mod ordering;
pub mod pmem;
pub mod pool;
pub mod record;
pub mod state;
pub mod wotree;

mod trace;

pub use error::TreeError;
pub use fixtree::{FixError, FixTree};
pub use pmem::RelPtr;
pub use pool::Pool;
pub use record::{Key, MAX_KEY, Record};
pub use wotree::{InsertOutcome, WriteTree};
