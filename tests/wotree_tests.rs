//! End-to-end write-tree tests: round trips, split and merge boundaries,
//! persistence across reopen, and crash injection at fence granularity.

mod common;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use pmtree::pmem::{clear_fence_hook, set_fence_hook};
use pmtree::{InsertOutcome, Pool, TreeError, WriteTree};

const POOL_CAP: usize = 8 << 20;

fn fresh_tree(threshold: u8) -> (Arc<Pool>, WriteTree) {
    common::init_tracing();
    let pool = Arc::new(Pool::anonymous(POOL_CAP).unwrap());
    let tree = WriteTree::create(Arc::clone(&pool), threshold);
    (pool, tree)
}

// ============================================================================
//  Round trips
// ============================================================================

#[test]
fn insert_then_find() {
    let (_pool, tree) = fresh_tree(10);
    for k in 1..=13u64 {
        assert_eq!(tree.insert(k, k * 7), InsertOutcome::Done);
    }
    for k in 1..=13u64 {
        assert_eq!(tree.find(k), Some(k * 7));
    }
    assert_eq!(tree.find(14), None);
    tree.check().unwrap();
}

#[test]
fn update_overwrites_insert_value() {
    let (_pool, tree) = fresh_tree(10);
    tree.insert(5, 50);
    assert!(tree.update(5, 51));
    assert_eq!(tree.find(5), Some(51));
    assert!(!tree.update(6, 60));
}

#[test]
fn insert_remove_find_absent() {
    let (_pool, tree) = fresh_tree(10);
    tree.insert(9, 90);
    tree.remove(9);
    assert_eq!(tree.find(9), None);
    // The key can come back.
    tree.insert(9, 91);
    assert_eq!(tree.find(9), Some(91));
}

// ============================================================================
//  Split behavior
// ============================================================================

#[test]
fn fourteenth_insert_splits_and_keeps_all_keys() {
    let (_pool, tree) = fresh_tree(10);
    for k in 1..=14u64 {
        assert_eq!(tree.insert(k, k * 7), InsertOutcome::Done);
    }
    // Readers on either side of the separator (7) resolve correctly,
    // whether through the new root or the sibling redirect.
    for k in 1..=14u64 {
        assert_eq!(tree.find(k), Some(k * 7));
    }
    tree.check().unwrap();
}

#[test]
fn root_split_escalates_at_height_threshold() {
    let (_pool, tree) = fresh_tree(1);
    let mut escalated = None;
    for k in 1..=14u64 {
        match tree.insert(k, k) {
            InsertOutcome::Done => {}
            InsertOutcome::RootSplit { split_key, right } => {
                escalated = Some((k, split_key, right));
            }
        }
    }
    let (at, split_key, right) = escalated.expect("threshold 1 must escalate");
    assert_eq!(at, 14);
    assert_eq!(split_key, 7);
    assert!(!right.is_null());

    // No new root was installed, yet every key stays reachable through
    // the old root's sibling chain.
    for k in 1..=14u64 {
        assert_eq!(tree.find(k), Some(k));
    }
}

#[test]
fn sequential_fill_over_many_splits() {
    let (_pool, tree) = fresh_tree(10);
    for k in 1..=500u64 {
        assert_eq!(tree.insert(k, k * 3), InsertOutcome::Done);
    }
    for k in 1..=500u64 {
        assert_eq!(tree.find(k), Some(k * 3));
    }
    tree.check().unwrap();
}

#[test]
fn shuffled_workload_roundtrips() {
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::StdRng};

    let (_pool, tree) = fresh_tree(12);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut keys: Vec<u64> = (1..=700u64).map(|k| k * 5).collect();
    keys.shuffle(&mut rng);

    for &k in &keys {
        assert_eq!(tree.insert(k, k + 1), InsertOutcome::Done);
    }
    tree.check().unwrap();

    keys.shuffle(&mut rng);
    let (gone, kept) = keys.split_at(keys.len() / 2);
    for &k in gone {
        tree.remove(k);
        assert_eq!(tree.find(k), None);
    }
    for &k in kept {
        assert_eq!(tree.find(k), Some(k + 1));
    }
    tree.check().unwrap();
}

// ============================================================================
//  Remove, underflow, root collapse
// ============================================================================

#[test]
fn remove_hints_when_root_leaf_empties() {
    let (_pool, tree) = fresh_tree(10);
    for k in 1..=3u64 {
        tree.insert(k, k);
    }
    assert!(!tree.remove(1));
    assert!(!tree.remove(2));
    assert!(tree.remove(3), "emptying the root leaf must hint the caller");
}

#[test]
fn drain_collapses_tree_back_to_leaf() {
    // Insert 1..=200, then remove 1..=190: every underflow merges into a
    // sibling when one fits, and emptied inner roots collapse into their
    // leftmost child.
    let (_pool, tree) = fresh_tree(10);
    for k in 1..=200u64 {
        assert_eq!(tree.insert(k, k * 11), InsertOutcome::Done);
    }
    for k in 1..=190u64 {
        tree.remove(k);
        assert_eq!(tree.find(k), None, "key {k} must be gone");
        if k.is_multiple_of(50) {
            tree.check().unwrap();
        }
    }
    for k in 191..=200u64 {
        assert_eq!(tree.find(k), Some(k * 11));
    }
    tree.check().unwrap();
}

// ============================================================================
//  Concurrent readers
// ============================================================================

#[test]
fn readers_race_a_writer_without_torn_results() {
    let (_pool, tree) = fresh_tree(12);
    let tree = Arc::new(tree);
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    std::thread::scope(|scope| {
        for _ in 0..3 {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            scope.spawn(move || {
                let mut hits = 0u64;
                while !stop.load(Ordering::Acquire) {
                    for k in (1..=400u64).step_by(7) {
                        // A reader sees the key fully or not at all.
                        if let Some(v) = tree.find(k) {
                            assert_eq!(v, k * 13);
                            hits += 1;
                        }
                    }
                }
                hits
            });
        }

        for k in 1..=400u64 {
            assert_eq!(tree.insert(k, k * 13), InsertOutcome::Done);
        }
        stop.store(true, Ordering::Release);
    });

    for k in 1..=400u64 {
        assert_eq!(tree.find(k), Some(k * 13));
    }
}

// ============================================================================
//  Persistence across reopen
// ============================================================================

#[test]
fn file_backed_tree_survives_reopen() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wotree.pm");

    {
        let pool = Arc::new(Pool::create(&path, POOL_CAP).unwrap());
        let tree = WriteTree::create(Arc::clone(&pool), 10);
        for k in 1..=100u64 {
            assert_eq!(tree.insert(k, k * 2), InsertOutcome::Done);
        }
    }

    let pool = Arc::new(Pool::open(&path).unwrap());
    let tree = WriteTree::open(pool, 10).unwrap();
    for k in 1..=100u64 {
        assert_eq!(tree.find(k), Some(k * 2));
    }
    tree.check().unwrap();
}

#[test]
fn open_refuses_a_pool_without_a_tree() {
    let pool = Arc::new(Pool::anonymous(POOL_CAP).unwrap());
    let err = WriteTree::open(pool, 10).err().expect("open must fail");
    assert!(matches!(err, TreeError::CorruptState(_)));
}

// ============================================================================
//  Crash injection
// ============================================================================

/// Crash tests share the global fence hook; serialize them.
static CRASH_GATE: Mutex<()> = Mutex::new(());

/// Run `f`, panicking at this thread's `n`-th fence, and assert it did
/// crash. Other threads' fences are ignored.
fn crash_at_fence(n: u32, f: impl FnOnce()) {
    let me = std::thread::current().id();
    let count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&count);
    set_fence_hook(Arc::new(move || {
        if std::thread::current().id() == me && counter.fetch_add(1, Ordering::SeqCst) + 1 == n {
            panic!("simulated power loss");
        }
    }));

    let result = catch_unwind(AssertUnwindSafe(f));
    clear_fence_hook();
    assert!(result.is_err(), "operation should have hit the crash point");
}

#[test]
fn crash_after_record_flush_hides_the_insert() {
    let _gate = CRASH_GATE.lock();
    let (pool, tree) = fresh_tree(10);
    tree.insert(1, 10);
    tree.insert(2, 20);

    // A plain insert fences twice: after the record flush, then inside the
    // state commit. Crash at the first: the record bytes are durable but
    // no permutation references them.
    crash_at_fence(1, || {
        tree.insert(99, 990);
    });

    // Reopen over the same pool: the uncommitted record is invisible.
    let tree = WriteTree::open(pool, 10).unwrap();
    assert_eq!(tree.find(99), None);
    assert_eq!(tree.find(1), Some(10));
    tree.check().unwrap();

    // The retried insert succeeds (reusing the orphaned slot).
    assert_eq!(tree.insert(99, 990), InsertOutcome::Done);
    assert_eq!(tree.find(99), Some(990));
}

#[test]
fn crash_after_sibling_stage_hides_the_split() {
    let _gate = CRASH_GATE.lock();
    let (pool, tree) = fresh_tree(10);
    for k in 1..=13u64 {
        tree.insert(k, k * 7);
    }

    // The splitting insert fences: (1) allocator cursor bump, (2) right
    // node flush, (3) staged sibling flush, then the state commit. Crash
    // at the third: the shadow entry is durable but the selector bit
    // still hides it.
    crash_at_fence(3, || {
        tree.insert(14, 98);
    });

    let tree = WriteTree::open(pool, 10).unwrap();
    for k in 1..=13u64 {
        assert_eq!(tree.find(k), Some(k * 7), "pre-split key {k} must survive");
    }
    assert_eq!(tree.find(14), None);
    tree.check().unwrap();

    // Retrying redoes the split (the staged node from the crashed attempt
    // is an accepted allocator leak) and lands the key.
    assert_eq!(tree.insert(14, 98), InsertOutcome::Done);
    for k in 1..=14u64 {
        assert!(tree.find(k).is_some());
    }
    tree.check().unwrap();
}

#[test]
fn crash_after_split_commit_leaves_split_visible() {
    let _gate = CRASH_GATE.lock();
    let (pool, tree) = fresh_tree(10);
    for k in 1..=13u64 {
        tree.insert(k, k * 7);
    }

    // Fence 4 sits inside the state commit, after the commit store: the
    // split is installed, the parent never hears about it, and the
    // post-split key insert never ran.
    crash_at_fence(4, || {
        tree.insert(14, 98);
    });

    let tree = WriteTree::open(pool, 10).unwrap();
    for k in 1..=13u64 {
        assert_eq!(
            tree.find(k),
            Some(k * 7),
            "key {k} must be reachable via the sibling redirect"
        );
    }
    assert_eq!(tree.find(14), None);
}
