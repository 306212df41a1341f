//! Property-based tests for the packed node state word.
//!
//! The state word is the linearization point of every write-tree mutation,
//! so its permutation mechanics are checked against a plain `Vec` model
//! under arbitrary operation sequences.

use pmtree::state::{CARDINALITY, NodeState};
use proptest::prelude::*;

/// One randomized mutation: insert at a position or remove a position.
/// Raw positions are reduced modulo the legal range at application time.
#[derive(Debug, Clone, Copy)]
enum Op {
    Insert(usize),
    Remove(usize),
}

fn ops(max: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..CARDINALITY).prop_map(Op::Insert),
            (0usize..CARDINALITY).prop_map(Op::Remove),
        ],
        0..=max,
    )
}

/// The live prefix as a vector of physical slots.
fn live(st: NodeState) -> Vec<usize> {
    (0..st.count()).map(|i| st.get(i)).collect()
}

/// Smallest slot index absent from the model (the allocator contract).
fn model_alloc(model: &[usize]) -> usize {
    (0..CARDINALITY)
        .find(|slot| !model.contains(slot))
        .expect("model below cardinality always has a free slot")
}

proptest! {
    /// The state word tracks a Vec model through arbitrary insert/remove
    /// sequences: identical live prefix, count, and allocator choice.
    #[test]
    fn state_matches_vec_model(ops in ops(64)) {
        let mut st = NodeState::empty();
        let mut model: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(raw) => {
                    if model.len() == CARDINALITY {
                        continue;
                    }
                    let pos = raw % (model.len() + 1);
                    let slot = st.alloc_slot();
                    prop_assert_eq!(slot, model_alloc(&model));
                    st = st.inserted(pos, slot);
                    model.insert(pos, slot);
                }

                Op::Remove(raw) => {
                    if model.is_empty() {
                        continue;
                    }
                    let pos = raw % model.len();
                    st = st.removed(pos);
                    model.remove(pos);
                }
            }

            prop_assert_eq!(live(st), model.clone());
            prop_assert_eq!(st.count(), model.len());
            prop_assert!(st.validate().is_ok());
        }
    }

    /// Permutation mechanics never leak into the header fields.
    #[test]
    fn header_fields_survive_perm_ops(ops in ops(48), sibling in 0usize..2, bumps in 0u8..16) {
        let mut st = NodeState::empty().with_sibling_version(sibling);
        for _ in 0..bumps {
            st = st.bump_version();
        }
        let version = st.node_version();

        let mut len = 0usize;
        for op in ops {
            match op {
                Op::Insert(raw) => {
                    if len == CARDINALITY {
                        continue;
                    }
                    st = st.inserted(raw % (len + 1), st.alloc_slot());
                    len += 1;
                }

                Op::Remove(raw) => {
                    if len == 0 {
                        continue;
                    }
                    st = st.removed(raw % len);
                    len -= 1;
                }
            }
            prop_assert_eq!(st.sibling_version(), sibling);
            prop_assert_eq!(st.node_version(), version);
            prop_assert!(!st.latch());
        }
    }

    /// An insert immediately undone by a remove restores the exact word.
    #[test]
    fn insert_remove_roundtrip(fill in 0usize..CARDINALITY, raw_pos in 0usize..CARDINALITY) {
        let mut st = NodeState::empty();
        for i in 0..fill {
            st = st.inserted(i, st.alloc_slot());
        }
        let snapshot = st.raw();

        let pos = raw_pos % (fill + 1);
        let slot = st.alloc_slot();
        let undone = st.inserted(pos, slot).removed(pos);
        prop_assert_eq!(undone.raw(), snapshot);
    }

    /// `appended` stages the same permutation `inserted` publishes, minus
    /// the count change.
    #[test]
    fn append_is_insert_without_count(fill in 0usize..CARDINALITY, raw_pos in 0usize..CARDINALITY) {
        let mut st = NodeState::empty();
        for i in 0..fill {
            st = st.inserted(i, st.alloc_slot());
        }
        let pos = raw_pos % (fill + 1);
        let slot = st.alloc_slot();

        let staged = st.appended(pos, slot);
        let published = st.inserted(pos, slot);
        prop_assert_eq!(staged.count(), st.count());
        prop_assert_eq!(staged.with_count(st.count() + 1).raw(), published.raw());
    }
}
