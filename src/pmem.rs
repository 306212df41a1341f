//! Persistence primitives: cache-line writeback, store fences, and the
//! relative-pointer type used by every PM-resident reference.
//!
//! Durability in this crate never comes from a log. Every mutation follows
//! the same choreography:
//!
//! 1. fill new memory,
//! 2. [`flush`] + [`fence`],
//! 3. a single aligned 8-byte commit store ([`persist_assign`]),
//! 4. [`flush`] + [`fence`].
//!
//! The commit store is the only point where readers begin to observe new
//! work, so a crash on either side of it leaves the structure consistent.
//!
//! # Fault injection
//!
//! Crash tests install a fence hook (see [`set_fence_hook`]) that panics at
//! a chosen fence, simulating power loss between ordering points. The hook
//! is a no-op unless installed and costs one `OnceLock` load per fence.

use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::ordering::WRITE_ORD;

/// Size of one cache line, the granularity of [`flush`].
pub const CACHE_LINE_SIZE: usize = 64;

// ============================================================================
//  Relative pointers
// ============================================================================

/// An offset into the PM pool, stored in place of an absolute pointer.
///
/// PM-resident fields always hold `RelPtr`s so a pool can be remapped at a
/// different base address across restarts. Offset 0 addresses the pool
/// header and is never handed out by the allocator, so it doubles as null.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RelPtr(u64);

impl RelPtr {
    /// The null reference (offset 0, inside the pool header).
    pub const NULL: Self = Self(0);

    /// Wrap a raw offset.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw offset value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null reference.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for RelPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "RelPtr(null)")
        } else {
            write!(f, "RelPtr({:#x})", self.0)
        }
    }
}

// ============================================================================
//  Flush / fence
// ============================================================================

/// Write the cache lines covering `[addr, addr + len)` back to the
/// durability domain.
///
/// On x86-64 this issues `clflush` per line (`clwb` would keep the line in
/// cache, but `clflush` is the baseline available everywhere). On other
/// architectures it degrades to a release fence, which is sufficient for
/// the volatile test environments those builds run in.
#[inline]
pub fn flush(addr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = (addr as usize) & !(CACHE_LINE_SIZE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            // SAFETY: clflush has no alignment or validity requirements
            // beyond the address being mapped, which the caller guarantees.
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, len);
        std::sync::atomic::fence(WRITE_ORD);
    }
}

/// Store-ordering barrier: all prior flushes are durable before any later
/// store becomes visible.
#[inline]
pub fn fence() {
    call_fence_hook();

    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence has no preconditions.
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Commit-store idiom: a single aligned 8-byte release store, flushed and
/// fenced. This is the only way state words and persistent pointers are
/// published.
#[inline]
pub fn persist_assign(target: &AtomicU64, value: u64) {
    target.store(value, WRITE_ORD);
    flush((target as *const AtomicU64).cast::<u8>(), 8);
    fence();
}

/// 4-byte variant of [`persist_assign`], for the fix-tree entrance fields.
#[inline]
pub fn persist_assign_u32(target: &AtomicU32, value: u32) {
    target.store(value, WRITE_ORD);
    flush((target as *const AtomicU32).cast::<u8>(), 4);
    fence();
}

// ============================================================================
//  Fence hook (crash injection)
// ============================================================================

/// A callback invoked at the start of every [`fence`].
pub type FenceHook = Arc<dyn Fn() + Send + Sync>;

static FENCE_HOOK: OnceLock<Mutex<Option<FenceHook>>> = OnceLock::new();

/// Install the fence hook. Tests use a counting hook that panics at the
/// N-th fence to simulate a crash between ordering points.
///
/// # Panics
/// Panics if a hook is already installed; call [`clear_fence_hook`] first.
pub fn set_fence_hook(hook: FenceHook) {
    let cell = FENCE_HOOK.get_or_init(|| Mutex::new(None));
    let mut guard = cell.lock();
    assert!(
        guard.is_none(),
        "fence hook already set; call clear_fence_hook first"
    );
    *guard = Some(hook);
}

/// Remove the fence hook, if any.
pub fn clear_fence_hook() {
    if let Some(cell) = FENCE_HOOK.get() {
        *cell.lock() = None;
    }
}

#[inline]
fn call_fence_hook() {
    if let Some(cell) = FENCE_HOOK.get() {
        // Clone out of the lock so a panicking hook never poisons or holds it.
        let hook = cell.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}
