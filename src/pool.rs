//! Persistent-memory pool: one contiguous mapped region from which both
//! trees allocate, plus the two persisted anchors that make the region
//! self-describing across restarts.
//!
//! # Layout
//!
//! ```text
//! offset 0        header page (4 KiB): magic, capacity, bump cursor,
//!                 write-tree root anchor, fix-tree entrance anchor
//! offset 4096..   256-byte-granular allocations
//! ```
//!
//! Offset 0 is inside the header, so a zero offset doubles as the null
//! [`RelPtr`].
//!
//! # Durability model
//!
//! The bump cursor is persisted on every advance; the anchors are persisted
//! by their owners via [`persist_assign`]. Free lists are volatile: blocks
//! freed before a crash are recovered, blocks freed after the last cursor
//! persist but never reused are leaked until a scavenger pass (the same
//! leak window the tree-level merge already tolerates).
//!
//! # Thread safety
//!
//! Allocation takes `&self`; the cursor and free lists sit behind a
//! `parking_lot::Mutex` so both trees can share one pool.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::TreeError;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pmem::{RelPtr, fence, flush, persist_assign};
use crate::trace::pm_event;

/// Identifies a pmtree pool file.
const POOL_MAGIC: u64 = 0x706d_7472_6565_3031; // "pmtree01"

/// Size of the reserved header page.
const HEADER_SIZE: usize = 4096;

/// Minimum allocation granularity. Every block size is a multiple of this,
/// which keeps every block 256-byte aligned without per-block headers.
pub const BLOCK_SIZE: usize = 256;

/// Persistent pool header at offset 0.
#[repr(C)]
struct PoolHeader {
    magic: AtomicU64,
    capacity: AtomicU64,
    /// Byte offset of the first never-allocated byte.
    cursor: AtomicU64,
    /// Write-tree root anchor: relative pointer to the current root node.
    tree_root: AtomicU64,
    /// Fix-tree entrance anchor: relative pointer to the entrance record.
    entrance: AtomicU64,
}

/// A mapped persistent-memory region with a bump/free-list allocator.
pub struct Pool {
    /// Keeps the mapping alive; never accessed after construction.
    _map: MmapMut,
    base: *mut u8,
    capacity: usize,
    /// Volatile free lists, keyed by block size.
    free: Mutex<HashMap<usize, Vec<u64>>>,
}

// SAFETY: the mapping is owned for the pool's lifetime, `base` never
// changes, and all interior mutation goes through atomics or the free-list
// mutex.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Create a fresh file-backed pool of `capacity` bytes.
    ///
    /// Truncates any existing file at `path`.
    pub fn create(path: &Path, capacity: usize) -> Result<Self, TreeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity as u64)?;

        // SAFETY: the file is exclusively owned by this pool while mapped.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let pool = Self::from_map(map, capacity)?;
        pool.init_header();
        Ok(pool)
    }

    /// Reopen an existing pool file, validating its header.
    pub fn open(path: &Path) -> Result<Self, TreeError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let capacity = file.metadata()?.len() as usize;

        // SAFETY: as in `create`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let pool = Self::from_map(map, capacity)?;

        let header = pool.header();
        if header.magic.load(READ_ORD) != POOL_MAGIC {
            return Err(TreeError::CorruptState("pool magic mismatch"));
        }
        if header.capacity.load(READ_ORD) as usize > capacity {
            return Err(TreeError::CorruptState("pool capacity exceeds file size"));
        }
        let cursor = header.cursor.load(READ_ORD) as usize;
        if cursor < HEADER_SIZE || cursor > capacity || !cursor.is_multiple_of(BLOCK_SIZE) {
            return Err(TreeError::CorruptState("pool cursor out of range"));
        }
        Ok(pool)
    }

    /// Create an anonymous (non-durable) pool, for tests and scratch use.
    pub fn anonymous(capacity: usize) -> Result<Self, TreeError> {
        let map = MmapMut::map_anon(capacity)?;
        let pool = Self::from_map(map, capacity)?;
        pool.init_header();
        Ok(pool)
    }

    fn from_map(mut map: MmapMut, capacity: usize) -> Result<Self, TreeError> {
        if capacity < 2 * HEADER_SIZE {
            return Err(TreeError::CorruptState("pool capacity below minimum"));
        }
        let base = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            base,
            capacity,
            free: Mutex::new(HashMap::new()),
        })
    }

    fn init_header(&self) {
        let header = self.header();
        header.capacity.store(self.capacity as u64, WRITE_ORD);
        header.cursor.store(HEADER_SIZE as u64, WRITE_ORD);
        header.tree_root.store(0, WRITE_ORD);
        header.entrance.store(0, WRITE_ORD);
        // Magic goes last so a half-initialized header never validates.
        flush(self.base, HEADER_SIZE);
        fence();
        persist_assign(&header.magic, POOL_MAGIC);
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: the header page is always mapped and initialized; all
        // fields are atomics, valid for any bit pattern.
        unsafe { &*self.base.cast::<PoolHeader>() }
    }

    // ========================================================================
    //  Allocation
    // ========================================================================

    /// Allocate `size` bytes (rounded up to the 256-byte block granularity).
    ///
    /// The returned pointer is 256-byte aligned and stable until freed or
    /// the pool is dropped. Recycled blocks retain their previous contents;
    /// callers initialize what they use.
    ///
    /// # Panics
    /// Panics when the pool is exhausted; size the pool for the workload.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let size = size.max(BLOCK_SIZE).next_multiple_of(BLOCK_SIZE);

        let mut free = self.free.lock();
        if let Some(off) = free.get_mut(&size).and_then(Vec::pop) {
            pm_event!(offset = off, size, "pool alloc (recycled)");
            // SAFETY: offsets on the free list came from this pool.
            return unsafe { self.base.add(off as usize) };
        }

        let header = self.header();
        let off = header.cursor.load(RELAXED) as usize;
        assert!(
            size <= self.capacity && off + size <= self.capacity,
            "pool exhausted: {size} bytes requested, {} available",
            self.capacity - off
        );
        let end = off + size;
        persist_assign(&header.cursor, end as u64);
        pm_event!(offset = off, size, "pool alloc (bump)");

        // SAFETY: `off..end` is within the mapping.
        unsafe { self.base.add(off) }
    }

    /// Return a block to the pool.
    ///
    /// `size` must be the size passed to [`Pool::alloc`] for this block.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc` on this pool with this
    /// `size` and must not be referenced after this call.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        let size = size.max(BLOCK_SIZE).next_multiple_of(BLOCK_SIZE);
        let off = ptr as usize - self.base as usize;
        debug_assert!(off >= HEADER_SIZE && off + size <= self.capacity);
        pm_event!(offset = off, size, "pool free");
        self.free.lock().entry(size).or_default().push(off as u64);
    }

    // ========================================================================
    //  Pointer translation
    // ========================================================================

    /// Translate an absolute pointer into this pool to a relative one.
    #[inline]
    pub fn rel<T>(&self, ptr: *const T) -> RelPtr {
        let off = ptr as usize - self.base as usize;
        debug_assert!(off < self.capacity, "pointer outside the pool");
        RelPtr::from_raw(off as u64)
    }

    /// Translate a relative pointer to an absolute one.
    ///
    /// # Panics
    /// Debug-panics on null or out-of-range offsets.
    #[inline]
    pub fn abs<T>(&self, rel: RelPtr) -> *mut T {
        debug_assert!(!rel.is_null(), "abs() on a null RelPtr");
        debug_assert!((rel.raw() as usize) < self.capacity, "RelPtr outside the pool");
        // SAFETY: the offset is within the mapping.
        unsafe { self.base.add(rel.raw() as usize).cast::<T>() }
    }

    // ========================================================================
    //  Anchors
    // ========================================================================

    /// The write-tree root anchor (relative pointer to the root node).
    #[inline]
    pub fn tree_root_anchor(&self) -> &AtomicU64 {
        &self.header().tree_root
    }

    /// The fix-tree entrance anchor (relative pointer to the entrance).
    #[inline]
    pub fn entrance_anchor(&self) -> &AtomicU64 {
        &self.header().entrance
    }

    /// Total pool capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed by the bump cursor (recycled blocks not subtracted).
    #[inline]
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.header().cursor.load(READ_ORD) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_block_aligned() {
        let pool = Pool::anonymous(1 << 20).unwrap();
        let a = pool.alloc(1);
        let b = pool.alloc(300);
        assert_eq!(a as usize % BLOCK_SIZE, 0);
        assert_eq!(b as usize % BLOCK_SIZE, 0);
        assert_eq!(b as usize - a as usize, BLOCK_SIZE);
    }

    #[test]
    fn free_recycles_same_size_class() {
        let pool = Pool::anonymous(1 << 20).unwrap();
        let a = pool.alloc(BLOCK_SIZE);
        unsafe { pool.free(a, BLOCK_SIZE) };
        let b = pool.alloc(BLOCK_SIZE);
        assert_eq!(a, b);
    }

    #[test]
    fn rel_abs_roundtrip() {
        let pool = Pool::anonymous(1 << 20).unwrap();
        let p = pool.alloc(BLOCK_SIZE);
        let rel = pool.rel(p);
        assert!(!rel.is_null());
        assert_eq!(pool.abs::<u8>(rel), p);
    }

    #[test]
    fn reopen_preserves_cursor_and_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.pm");

        let first_off;
        {
            let pool = Pool::create(&path, 1 << 20).unwrap();
            let p = pool.alloc(BLOCK_SIZE);
            first_off = pool.rel(p).raw();
            persist_assign(pool.tree_root_anchor(), first_off);
        }

        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.tree_root_anchor().load(READ_ORD), first_off);
        // The cursor survived, so a new allocation lands past the old one.
        let next = pool.alloc(BLOCK_SIZE);
        assert_eq!(pool.rel(next).raw(), first_off + BLOCK_SIZE as u64);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pm");
        std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
        let err = Pool::open(&path).err().expect("open must fail on garbage");
        assert!(matches!(err, TreeError::CorruptState(_)));
    }
}
