//! Write-tree node: a 256-byte, crash-consistent B+-tree node with
//! unordered record slots and a packed state word.
//!
//! # Layout (one cache-line group)
//!
//! ```text
//! 0   ..8     state word (NodeState)
//! 8   ..16    leftmost child (RelPtr; null iff leaf)
//! 16  ..48    siblings[2]: shadow pair of (separator key, sibling RelPtr)
//! 48  ..256   recs[13]: unordered (key, val) slots
//! ```
//!
//! Logical order comes entirely from the state word's permutation, so an
//! insert or delete touches one 16-byte slot plus one 8-byte commit store —
//! records are never shifted or compacted, which would force whole-node
//! flushes and break slot-immutability for concurrent readers.
//!
//! # Shadow sibling pair
//!
//! `siblings[]` holds two entries; `state.sibling_version` selects the live
//! one. A split or merge stages the next (separator, pointer) pair in the
//! dead entry, flushes it, and then flips the selector bit as part of the
//! state commit. Readers that reach a key at or past the live separator
//! redirect to the sibling, which is how a split is visible before the
//! parent learns the new separator.
//!
//! # Crash model
//!
//! Every mutation persists its data (flush + fence) before the single
//! 8-byte state commit (flush + fence). A crash before the commit leaves
//! staged memory that no reader can reach; a crash after it leaves a fully
//! consistent node. Nothing in between exists.

use std::sync::atomic::AtomicU64;

use crate::error::TreeError;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::pmem::{RelPtr, fence, flush, persist_assign};
use crate::pool::Pool;
use crate::record::{Key, MAX_KEY};
use crate::state::{CARDINALITY, NodeState};
use crate::trace::{pm_event, structure_event};

/// Size of a write-tree node in bytes.
pub const NODE_SIZE: usize = 256;

/// A (key, word) pair stored in place; both halves are atomics so readers
/// may race the single writer without undefined behavior.
#[repr(C)]
pub(crate) struct Slot {
    key: AtomicU64,
    val: AtomicU64,
}

/// The node itself. All methods take `&self`: mutation is serialized by
/// the owning tree's writer lock, publication happens through the state
/// word.
#[repr(C, align(64))]
pub struct Node {
    state: AtomicU64,
    leftmost_child: AtomicU64,
    siblings: [Slot; 2],
    recs: [Slot; CARDINALITY],
}

const _: () = assert!(std::mem::size_of::<Node>() == NODE_SIZE);

/// A split result propagated to the parent: the promoted separator and the
/// new right node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub key: Key,
    pub right: RelPtr,
}

/// Materialize a node reference from a relative pointer.
///
/// # Safety
/// `rel` must reference a live node allocated from `pool`.
#[inline]
pub(crate) unsafe fn node_at<'p>(pool: &'p Pool, rel: RelPtr) -> &'p Node {
    // SAFETY: caller guarantees `rel` addresses a node in this pool; every
    // field is an atomic, valid for any bit pattern.
    unsafe { &*pool.abs::<Node>(rel) }
}

impl Node {
    // ========================================================================
    //  Construction
    // ========================================================================

    /// Allocate and initialize a node in `pool`. Both sibling entries start
    /// as `(MAX_KEY, null)`, so no key ever redirects. Record slots keep
    /// whatever bytes the block held; the zero count makes them unreachable.
    pub(crate) fn alloc_in(pool: &Pool) -> &Node {
        let ptr = pool.alloc(NODE_SIZE).cast::<Node>();
        // SAFETY: the block is 256-byte aligned, NODE_SIZE bytes, and all
        // fields are atomics.
        let node = unsafe { &*ptr };
        node.state.store(NodeState::empty().raw(), WRITE_ORD);
        node.leftmost_child.store(0, WRITE_ORD);
        for sib in &node.siblings {
            sib.key.store(MAX_KEY, WRITE_ORD);
            sib.val.store(0, WRITE_ORD);
        }
        flush((node as *const Node).cast::<u8>(), 64);
        node
    }

    // ========================================================================
    //  Field access
    // ========================================================================

    /// Snapshot the state word. Readers derive every index they use from
    /// one snapshot.
    #[inline]
    pub(crate) fn state(&self) -> NodeState {
        NodeState::from_raw(self.state.load(READ_ORD))
    }

    /// Commit a new state word: version bump, release store, flush, fence.
    /// This is the linearization point of every structural mutation.
    #[inline]
    fn commit_state(&self, new_state: NodeState) {
        persist_assign(&self.state, new_state.bump_version().raw());
    }

    /// Plain (unpublished) state store, for nodes not yet reachable.
    #[inline]
    fn store_state_unpublished(&self, new_state: NodeState) {
        self.state.store(new_state.raw(), WRITE_ORD);
    }

    /// Whether this node is a leaf (no leftmost child).
    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.leftmost_child.load(READ_ORD) == 0
    }

    /// The child covering keys below every separator in this node.
    #[inline]
    pub(crate) fn leftmost(&self) -> RelPtr {
        RelPtr::from_raw(self.leftmost_child.load(READ_ORD))
    }

    #[inline]
    pub(crate) fn set_leftmost(&self, child: RelPtr) {
        self.leftmost_child.store(child.raw(), WRITE_ORD);
    }

    /// Read sibling entry `version` (0 or 1).
    #[inline]
    fn sibling(&self, version: usize) -> (Key, RelPtr) {
        let s = &self.siblings[version];
        (
            s.key.load(READ_ORD),
            RelPtr::from_raw(s.val.load(READ_ORD)),
        )
    }

    /// Stage a sibling entry and flush it. The caller fences and flips the
    /// selector in its state commit.
    fn set_sibling(&self, version: usize, key: Key, ptr: RelPtr) {
        let s = &self.siblings[version];
        s.key.store(key, WRITE_ORD);
        s.val.store(ptr.raw(), WRITE_ORD);
        flush((s as *const Slot).cast::<u8>(), 16);
    }

    #[inline]
    fn rec_key(&self, slot: usize) -> Key {
        self.recs[slot].key.load(READ_ORD)
    }

    #[inline]
    fn rec_val(&self, slot: usize) -> u64 {
        self.recs[slot].val.load(READ_ORD)
    }

    /// Write a record slot without flushing (bulk paths flush in ranges).
    fn set_rec(&self, slot: usize, key: Key, val: u64) {
        self.recs[slot].key.store(key, WRITE_ORD);
        self.recs[slot].val.store(val, WRITE_ORD);
    }

    /// The key at logical position `pos` under state snapshot `st`.
    #[inline]
    fn key_at(&self, st: NodeState, pos: usize) -> Key {
        self.rec_key(st.get(pos))
    }

    /// The logically smallest key. Used by the parent to locate this
    /// node's separator during merges.
    pub(crate) fn first_key(&self) -> Key {
        let st = self.state();
        self.rec_key(st.get(0))
    }

    /// The key at logical position `pos` under a fresh snapshot. For
    /// validation and debug walks; operations snapshot once themselves.
    pub(crate) fn key_at_pos(&self, pos: usize) -> Key {
        self.key_at(self.state(), pos)
    }

    /// The child reference at logical position `pos` (inner nodes).
    pub(crate) fn child_at_pos(&self, pos: usize) -> RelPtr {
        RelPtr::from_raw(self.rec_val(self.state().get(pos)))
    }

    /// Set up a fresh, unpublished root holding one separator: used when a
    /// root split grows the tree by one level.
    pub(crate) fn init_single_entry(&self, key: Key, val: u64) {
        self.set_rec(0, key, val);
        self.store_state_unpublished(NodeState::empty().appended(0, 0).with_count(1));
    }

    /// Follow the live-sibling chain until `k` falls below the separator.
    /// Split completion is observed here: the parent may not yet know the
    /// new separator, but the chain always reaches the right subtree.
    fn redirect<'p>(&'p self, pool: &'p Pool, k: Key) -> (&'p Node, NodeState) {
        let mut node = self;
        loop {
            let st = node.state();
            let (sib_key, sib_ptr) = node.sibling(st.sibling_version());
            if k >= sib_key {
                pm_event!(key = k, sep = sib_key, "sibling redirect");
                // SAFETY: a live sibling entry always references a node.
                node = unsafe { node_at(pool, sib_ptr) };
                continue;
            }
            return (node, st);
        }
    }

    // ========================================================================
    //  Lookup / routing
    // ========================================================================

    /// Leaf lookup: the value stored under `k`, if present.
    pub(crate) fn lookup(&self, pool: &Pool, k: Key) -> Option<u64> {
        let (node, st) = self.redirect(pool, k);
        for pos in 0..st.count() {
            let slot = st.get(pos);
            let key = node.rec_key(slot);
            if key >= k {
                return (key == k).then(|| node.rec_val(slot));
            }
        }
        None
    }

    /// Inner routing: the child whose range covers `k`.
    pub(crate) fn get_child(&self, pool: &Pool, k: Key) -> RelPtr {
        debug_assert!(!self.is_leaf());
        let (node, st) = self.redirect(pool, k);
        let n = st.count();
        let mut pos = n;
        for i in 0..n {
            if node.key_at(st, i) > k {
                pos = i;
                break;
            }
        }
        if pos == 0 {
            node.leftmost()
        } else {
            RelPtr::from_raw(node.rec_val(st.get(pos - 1)))
        }
    }

    /// Left and right siblings of the child covering `k`, as reachable from
    /// this node. Either may be absent (the child is the first or last).
    pub(crate) fn get_lrchild<'p>(
        &self,
        pool: &'p Pool,
        k: Key,
    ) -> (Option<&'p Node>, Option<&'p Node>) {
        let st = self.state();
        let n = st.count();
        let mut i = n;
        for pos in 0..n {
            if self.key_at(st, pos) > k {
                i = pos;
                break;
            }
        }

        let left = match i {
            0 => None,
            // SAFETY: inner-node child pointers always reference nodes.
            1 => Some(unsafe { node_at(pool, self.leftmost()) }),
            _ => Some(unsafe { node_at(pool, RelPtr::from_raw(self.rec_val(st.get(i - 2)))) }),
        };
        let right = if i == n {
            None
        } else {
            // SAFETY: as above.
            Some(unsafe { node_at(pool, RelPtr::from_raw(self.rec_val(st.get(i)))) })
        };
        (left, right)
    }

    // ========================================================================
    //  Mutation
    // ========================================================================

    /// Insert into a node known to have room. Writes the record to a free
    /// physical slot, persists it, then commits the permutation update.
    pub(crate) fn insert_one(&self, k: Key, v: u64) {
        let st = self.state();
        debug_assert!(st.count() < CARDINALITY);

        let mut pos = st.count();
        for i in 0..st.count() {
            if k < self.key_at(st, i) {
                pos = i;
                break;
            }
        }

        let slot = st.alloc_slot();
        self.set_rec(slot, k, v);
        flush((&self.recs[slot] as *const Slot).cast::<u8>(), 16);
        fence();

        self.commit_state(st.inserted(pos, slot));
    }

    /// Insert, splitting first when the node is full.
    ///
    /// The split copies the upper half into a fresh right node, stages the
    /// (separator, right) pair in the dead sibling entry, and commits both
    /// the reduced count and the flipped sibling selector in one state
    /// store. A crash before that store leaves the new node unreachable
    /// (allocator leak only); a crash after it leaves the split complete,
    /// discoverable through the sibling chain until the parent is updated.
    pub(crate) fn store(&self, pool: &Pool, k: Key, v: u64) -> Option<Split> {
        let st = self.state();
        if st.count() < CARDINALITY {
            self.insert_one(k, v);
            return None;
        }

        let m = st.count() / 2;
        let split_key = self.key_at(st, m);
        debug_assert!(m >= 1, "odd cardinality keeps the midpoint off zero");

        let right = Node::alloc_in(pool);
        let mut right_state = NodeState::empty();
        let mut j: usize = 0;
        let new_state;
        if self.is_leaf() {
            // Logical entries [m, count) move; the separator stays in the
            // right leaf as its first key.
            for pos in m..st.count() {
                let slot = st.get(pos);
                right.set_rec(j, self.rec_key(slot), self.rec_val(slot));
                right_state = right_state.appended(j, j);
                j += 1;
            }
            new_state = st.with_count(st.count() - j);
        } else {
            // The separator is promoted: its child becomes the right
            // node's leftmost, entries [m + 1, count) follow.
            right.set_leftmost(RelPtr::from_raw(self.rec_val(st.get(m))));
            for pos in (m + 1)..st.count() {
                let slot = st.get(pos);
                right.set_rec(j, self.rec_key(slot), self.rec_val(slot));
                right_state = right_state.appended(j, j);
                j += 1;
            }
            new_state = st.with_count(st.count() - j - 1);
        }
        right.store_state_unpublished(right_state.with_count(j));

        // The right node inherits this node's old right neighbour.
        let (old_sib_key, old_sib_ptr) = self.sibling(st.sibling_version());
        right.set_sibling(0, old_sib_key, old_sib_ptr);

        // recs[0] shares the header cache lines; the rest flush as a range.
        flush((right as *const Node).cast::<u8>(), 64);
        if j > 1 {
            flush((&right.recs[1] as *const Slot).cast::<u8>(), 16 * (j - 1));
        }
        fence();

        // Stage the new neighbour in the dead sibling entry, then commit
        // the flip and the reduced count together.
        let dead = 1 - st.sibling_version();
        self.set_sibling(dead, split_key, pool.rel(right));
        fence();
        self.commit_state(new_state.with_sibling_version(dead));

        structure_event!(
            split_key,
            right = pool.rel(right).raw(),
            leaf = self.is_leaf(),
            "node split"
        );

        if k < split_key {
            self.insert_one(k, v);
        } else {
            right.insert_one(k, v);
        }
        Some(Split {
            key: split_key,
            right: pool.rel(right),
        })
    }

    /// Overwrite the value under `k`. No state commit: a record's value
    /// slot may be rewritten in place because readers tolerate seeing
    /// either value.
    pub(crate) fn update(&self, pool: &Pool, k: Key, v: u64) -> bool {
        let (node, st) = self.redirect(pool, k);
        for pos in 0..st.count() {
            let slot = st.get(pos);
            let key = node.rec_key(slot);
            if key >= k {
                if key != k {
                    return false;
                }
                node.recs[slot].val.store(v, WRITE_ORD);
                flush((&node.recs[slot] as *const Slot).cast::<u8>(), 16);
                fence();
                return true;
            }
        }
        false
    }

    /// Remove `k` from this node (leaf: the matching record; inner: the
    /// separator immediately below the first key greater than `k`).
    /// One commit store; the physical slot is left intact for reuse.
    pub(crate) fn remove(&self, pool: &Pool, k: Key) -> bool {
        let (node, st) = self.redirect(pool, k);

        if node.is_leaf() {
            for pos in 0..st.count() {
                let slot = st.get(pos);
                let key = node.rec_key(slot);
                if key >= k {
                    if key != k {
                        return false;
                    }
                    node.commit_state(st.removed(pos));
                    return true;
                }
            }
            false
        } else {
            let mut pos = st.count();
            for i in 0..st.count() {
                if node.key_at(st, i) > k {
                    pos = i;
                    break;
                }
            }
            // The leftmost child is never removed, so the key being
            // dropped always sits at pos - 1.
            debug_assert!(pos >= 1, "separator removal would hit the leftmost child");
            node.commit_state(st.removed(pos - 1));
            true
        }
    }

    /// Merge `right` into `left` (adjacent siblings under one parent).
    /// The caller has verified the combined count fits and has already
    /// removed `right`'s separator from the parent.
    pub(crate) fn merge_nodes(pool: &Pool, left: &Node, right: &Node) {
        let lst = left.state();
        let sv = lst.sibling_version();
        let mut new_state = lst;

        if !left.is_leaf() {
            // The live sibling entry's key is the separator between the
            // two nodes; it re-enters as the key for right's leftmost.
            let (sep_key, _) = left.sibling(sv);
            let slot = new_state.alloc_slot();
            left.set_rec(slot, sep_key, right.leftmost().raw());
            new_state = new_state.inserted(new_state.count(), slot);
        }

        let rst = right.state();
        for pos in 0..rst.count() {
            let rslot = rst.get(pos);
            let slot = new_state.alloc_slot();
            left.set_rec(slot, right.rec_key(rslot), right.rec_val(rslot));
            new_state = new_state.inserted(new_state.count(), slot);
        }

        // Left inherits right's neighbour through the shadow entry.
        let (rk, rp) = right.sibling(rst.sibling_version());
        left.set_sibling(1 - sv, rk, rp);
        new_state = new_state.with_sibling_version(1 - sv);

        flush((left as *const Node).cast::<u8>(), NODE_SIZE);
        fence();
        left.commit_state(new_state);

        structure_event!(
            absorbed = pool.rel(right).raw(),
            count = new_state.count(),
            "node merge"
        );

        // Freed after the commit; a crash in between leaks the block.
        // SAFETY: right is unreachable once the parent separator is gone
        // and left's sibling entry has been replaced.
        unsafe { pool.free((right as *const Node).cast_mut().cast::<u8>(), NODE_SIZE) };
    }

    // ========================================================================
    //  Validation
    // ========================================================================

    /// Check this node's local invariants (recovery gate).
    pub(crate) fn validate(&self) -> Result<(), TreeError> {
        let st = self.state();
        st.validate()?;
        for pos in 1..st.count() {
            if self.key_at(st, pos - 1) >= self.key_at(st, pos) {
                return Err(TreeError::CorruptState("node keys not strictly ascending"));
            }
        }
        if !self.is_leaf() {
            for pos in 0..st.count() {
                if self.rec_val(st.get(pos)) == 0 {
                    return Err(TreeError::CorruptState("inner node with null child"));
                }
            }
        }
        Ok(())
    }
}
