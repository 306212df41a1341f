//! Write-optimized tree: the mutable lower index.
//!
//! [`WriteTree`] wraps a pool and the persisted root anchor, and drives the
//! recursive insert/remove paths over [`Node`]s. Inserts propagate splits
//! upward; while the tree height stays below the configured threshold, a
//! root split installs a fresh two-entry root, otherwise it is handed back
//! to the caller as [`InsertOutcome::RootSplit`] (typically the signal to
//! bulk-rebuild into the fix tree).
//!
//! Removes propagate underflow upward: a node that drops below
//! [`UNDERFLOW_CARD`] entries is merged into its left sibling when the
//! combined count fits, else its right, else left alone. When an inner
//! root runs out of separators it is replaced by its leftmost child.
//!
//! # Concurrency
//!
//! One writer, any number of readers. Mutating methods serialize on an
//! internal `parking_lot::Mutex`; [`WriteTree::find`] never blocks and
//! relies on the node-level snapshot protocol.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TreeError;
use crate::node::{Node, NODE_SIZE, Split, node_at};
use crate::ordering::READ_ORD;
use crate::pmem::{RelPtr, fence, flush, persist_assign};
use crate::pool::Pool;
use crate::record::{Key, MAX_KEY};
use crate::state::CARDINALITY;
use crate::trace::structure_event;

/// Nodes with fewer live entries than this ask their parent for a merge.
pub const UNDERFLOW_CARD: usize = 4;

/// Result of [`WriteTree::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key is stored; any splits were absorbed inside the tree.
    Done,

    /// The root split and the tree already stands at the height threshold.
    /// The caller owns the escalation (e.g. rebuilds into the fix tree);
    /// both halves remain reachable through the old root's sibling chain
    /// in the meantime.
    RootSplit {
        /// Separator between the old root and the new right node.
        split_key: Key,
        /// The new right node.
        right: RelPtr,
    },
}

/// Handle to a write tree living in `pool`.
pub struct WriteTree {
    pool: Arc<Pool>,
    /// Splits stop growing the tree at this height.
    height_threshold: u8,
    writer: Mutex<()>,
}

impl WriteTree {
    /// Create a fresh tree: a single empty leaf, persisted as the root.
    ///
    /// Overwrites whatever the pool's root anchor pointed at.
    pub fn create(pool: Arc<Pool>, height_threshold: u8) -> Self {
        let root = Node::alloc_in(&pool);
        fence();
        persist_assign(pool.tree_root_anchor(), pool.rel(root).raw());
        Self {
            pool,
            height_threshold,
            writer: Mutex::new(()),
        }
    }

    /// Re-attach to the tree persisted in `pool`, validating the root.
    pub fn open(pool: Arc<Pool>, height_threshold: u8) -> Result<Self, TreeError> {
        let root_rel = RelPtr::from_raw(pool.tree_root_anchor().load(READ_ORD));
        if root_rel.is_null() {
            return Err(TreeError::CorruptState("write-tree root anchor is null"));
        }
        let tree = Self {
            pool,
            height_threshold,
            writer: Mutex::new(()),
        };
        tree.root().validate()?;
        Ok(tree)
    }

    fn root(&self) -> &Node {
        let rel = RelPtr::from_raw(self.pool.tree_root_anchor().load(READ_ORD));
        // SAFETY: the root anchor always references a live node.
        unsafe { node_at(&self.pool, rel) }
    }

    // ========================================================================
    //  Lookup
    // ========================================================================

    /// Look up `k`. Lock-free.
    pub fn find(&self, k: Key) -> Option<u64> {
        debug_assert!(k < MAX_KEY);
        let mut node = self.root();
        while !node.is_leaf() {
            // SAFETY: inner-node routing always yields a live child.
            node = unsafe { node_at(&self.pool, node.get_child(&self.pool, k)) };
        }
        node.lookup(&self.pool, k)
    }

    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert `(k, v)`. Keys are expected to be fresh; overwriting an
    /// existing key goes through [`WriteTree::update`].
    pub fn insert(&self, k: Key, v: u64) -> InsertOutcome {
        debug_assert!(k < MAX_KEY);
        let _writer = self.writer.lock();

        let root = self.root();
        let mut height: u8 = 1;
        let Some(split) = Self::insert_recursive(&self.pool, root, k, v, &mut height) else {
            return InsertOutcome::Done;
        };

        if height < self.height_threshold {
            self.install_root(split);
            InsertOutcome::Done
        } else {
            structure_event!(split_key = split.key, height, "root split escalated");
            InsertOutcome::RootSplit {
                split_key: split.key,
                right: split.right,
            }
        }
    }

    fn insert_recursive(
        pool: &Pool,
        node: &Node,
        k: Key,
        v: u64,
        height: &mut u8,
    ) -> Option<Split> {
        if node.is_leaf() {
            return node.store(pool, k, v);
        }
        *height += 1;
        // SAFETY: routing from an inner node yields a live child.
        let child = unsafe { node_at(pool, node.get_child(pool, k)) };
        let split = Self::insert_recursive(pool, child, k, v, height)?;
        node.store(pool, split.key, split.right.raw())
    }

    /// Install a new root above the old one after a root split.
    fn install_root(&self, split: Split) {
        let old_root = self.root();
        let new_root = Node::alloc_in(&self.pool);
        new_root.set_leftmost(self.pool.rel(old_root));
        new_root.init_single_entry(split.key, split.right.raw());

        flush((new_root as *const Node).cast::<u8>(), 64);
        fence();
        persist_assign(self.pool.tree_root_anchor(), self.pool.rel(new_root).raw());
        structure_event!(
            split_key = split.key,
            root = self.pool.rel(new_root).raw(),
            "new root installed"
        );
    }

    // ========================================================================
    //  Update
    // ========================================================================

    /// Overwrite the value under `k`; false when absent.
    pub fn update(&self, k: Key, v: u64) -> bool {
        debug_assert!(k < MAX_KEY);
        let _writer = self.writer.lock();

        let mut node = self.root();
        while !node.is_leaf() {
            // SAFETY: as in `find`.
            node = unsafe { node_at(&self.pool, node.get_child(&self.pool, k)) };
        }
        node.update(&self.pool, k, v)
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    /// Remove `k`. Returns true iff the root is empty afterwards — a hint
    /// that the orchestrator may retire this tree.
    pub fn remove(&self, k: Key) -> bool {
        debug_assert!(k < MAX_KEY);
        let _writer = self.writer.lock();

        let root = self.root();
        if root.is_leaf() {
            root.remove(&self.pool, k);
            return root.state().count() == 0;
        }

        // SAFETY: as in `find`.
        let child = unsafe { node_at(&self.pool, root.get_child(&self.pool, k)) };
        if Self::remove_recursive(&self.pool, child, k) {
            Self::merge_underflowed_child(&self.pool, root, child, k);

            if root.state().count() == 0 {
                // All separators are gone; the leftmost child becomes the
                // root and the old root is recycled.
                let old_root = root;
                persist_assign(self.pool.tree_root_anchor(), old_root.leftmost().raw());
                structure_event!(root = old_root.leftmost().raw(), "root collapsed");
                // SAFETY: the anchor no longer references the old root.
                unsafe {
                    self.pool
                        .free((old_root as *const Node).cast_mut().cast::<u8>(), NODE_SIZE);
                }
            }
        }
        false
    }

    /// Returns whether `node` underflowed after the removal below it.
    fn remove_recursive(pool: &Pool, node: &Node, k: Key) -> bool {
        if node.is_leaf() {
            node.remove(pool, k);
            return node.state().count() < UNDERFLOW_CARD;
        }

        // SAFETY: as in `find`.
        let child = unsafe { node_at(pool, node.get_child(pool, k)) };
        if Self::remove_recursive(pool, child, k) {
            return Self::merge_underflowed_child(pool, node, child, k);
        }
        false
    }

    /// Merge an underflowed child into a sibling when one fits. The
    /// separator leaves the parent first, so a crash between the two
    /// commits leaves the child reachable through its left neighbour's
    /// sibling chain. Returns whether the parent itself underflowed.
    fn merge_underflowed_child(pool: &Pool, parent: &Node, child: &Node, k: Key) -> bool {
        let (left, right) = parent.get_lrchild(pool, k);
        let child_count = child.state().count();

        if let Some(left) = left {
            if child_count + left.state().count() < CARDINALITY {
                parent.remove(pool, child.first_key());
                Node::merge_nodes(pool, left, child);
                return parent.state().count() < UNDERFLOW_CARD;
            }
        }
        if let Some(right) = right {
            if child_count + right.state().count() < CARDINALITY {
                parent.remove(pool, right.first_key());
                Node::merge_nodes(pool, child, right);
                return parent.state().count() < UNDERFLOW_CARD;
            }
        }
        // No sibling fits; the underflow is tolerated.
        false
    }

    // ========================================================================
    //  Validation
    // ========================================================================

    /// Walk the tree checking every invariant a node can check locally
    /// plus key-range partitioning. Intended for quiescent trees (tests,
    /// recovery); concurrent writers may produce transient false alarms.
    pub fn check(&self) -> Result<(), TreeError> {
        Self::check_node(&self.pool, self.root(), None, None)
    }

    fn check_node(
        pool: &Pool,
        node: &Node,
        lo: Option<Key>,
        hi: Option<Key>,
    ) -> Result<(), TreeError> {
        node.validate()?;
        let st = node.state();
        let keys: Vec<Key> = (0..st.count()).map(|i| node.key_at_pos(i)).collect();

        for &k in &keys {
            if lo.is_some_and(|l| k < l) || hi.is_some_and(|h| k >= h) {
                return Err(TreeError::CorruptState("key outside its subtree range"));
            }
        }

        if !node.is_leaf() {
            let mut child_lo = lo;
            for (i, &sep) in keys.iter().enumerate() {
                let child = if i == 0 {
                    node.leftmost()
                } else {
                    node.child_at_pos(i - 1)
                };
                // SAFETY: validated inner nodes carry live children.
                Self::check_node(pool, unsafe { node_at(pool, child) }, child_lo, Some(sep))?;
                child_lo = Some(sep);
            }
            if let Some(&last) = keys.last() {
                let child = node.child_at_pos(keys.len() - 1);
                // SAFETY: as above.
                Self::check_node(pool, unsafe { node_at(pool, child) }, Some(last), hi)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for WriteTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn walk(
            pool: &Pool,
            node: &Node,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            let st = node.state();
            let keys: Vec<Key> = (0..st.count()).map(|i| node.key_at_pos(i)).collect();
            writeln!(
                f,
                "{:indent$}{} {:?} v{}",
                "",
                if node.is_leaf() { "leaf" } else { "inner" },
                keys,
                st.node_version(),
                indent = depth * 2
            )?;
            if !node.is_leaf() {
                // SAFETY: inner nodes carry live children.
                walk(pool, unsafe { node_at(pool, node.leftmost()) }, depth + 1, f)?;
                for i in 0..st.count() {
                    let child = node.child_at_pos(i);
                    walk(pool, unsafe { node_at(pool, child) }, depth + 1, f)?;
                }
            }
            Ok(())
        }
        writeln!(f, "WriteTree")?;
        walk(&self.pool, self.root(), 1, f)
    }
}
