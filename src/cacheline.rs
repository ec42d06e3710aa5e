//! The cacheline record and its intrusive doubly-linked list operations
//! (spec.md §3, §4.4).
//!
//! `next`/`prev` are placed at fixed offsets 0 and 8 so that, in principle,
//! assembly could walk the list by offset without knowing field names — the
//! same constraint the source places on its C struct. The record is padded
//! to exactly one cache line (`CACHELINE_SIZE` bytes) so that one record
//! occupies one hardware line with nothing else sharing it.

use crate::config::CACHELINE_SIZE;

bitflags::bitflags! {
    /// Per-line status bits (spec.md §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// First line of its set in ring-traversal order.
        const FIRST = 0b0000_0001;
        /// Last line of its set in ring-traversal order.
        const LAST = 0b0000_0010;
        /// Physical-set assignment has been confirmed (unprivileged builder).
        const CACHE_GROUP_INIT = 0b0000_0100;
    }
}

// Field order matters: `timing`/`set_index` (both u32, align 4) are placed
// before `flags` (u8, align 1) so no compiler padding is inserted between
// them, keeping the header's size exactly predictable.
const HEADER_BYTES: usize =
    2 * size_of::<*mut Cacheline>() + size_of::<u32>() * 2 + size_of::<u8>();
const PAD_BYTES: usize = CACHELINE_SIZE - HEADER_BYTES;

/// One cache line's worth of bookkeeping. `next`/`prev` must stay the first
/// two fields (see module docs); the record's total size is asserted equal
/// to one cache line below.
#[repr(C)]
pub struct Cacheline {
    pub next: *mut Cacheline,
    pub prev: *mut Cacheline,
    pub timing: u32,
    pub set_index: u32,
    pub flags: Flags,
    _pad: [u8; PAD_BYTES],
}

const _: () = assert!(size_of::<Cacheline>() == CACHELINE_SIZE);

impl Cacheline {
    /// Initialise a line record in place at `at`, as a singleton ring
    /// (`next == prev == at`).
    ///
    /// # Safety
    /// `at` must point to at least `CACHELINE_SIZE` writable, properly
    /// aligned bytes that this call exclusively owns.
    pub unsafe fn init_singleton(at: *mut Cacheline, set_index: u32) {
        unsafe {
            (*at).next = at;
            (*at).prev = at;
            (*at).set_index = set_index;
            (*at).flags = Flags::empty();
            (*at).timing = 0;
        }
    }
}

/// Insert `new` immediately after `anchor` in the ring. If `anchor` is null,
/// `new` becomes a singleton ring (spec.md §4.4).
///
/// # Safety
/// `new` must not already be linked into another ring. `anchor`, if
/// non-null, must point to a valid, currently-linked `Cacheline`.
pub unsafe fn insert_after(anchor: *mut Cacheline, new: *mut Cacheline) {
    unsafe {
        if anchor.is_null() {
            (*new).next = new;
            (*new).prev = new;
            return;
        }
        let after = (*anchor).next;
        (*new).prev = anchor;
        (*new).next = after;
        (*anchor).next = new;
        (*after).prev = new;
    }
}

/// Unlink `cl` from its ring. Must not be called on a line whose neighbours
/// have already been freed (spec.md §4.4) — `cl`'s own memory is left
/// otherwise intact.
///
/// # Safety
/// `cl.next`/`cl.prev` must point to live, valid `Cacheline`s.
pub unsafe fn remove(cl: *mut Cacheline) {
    unsafe {
        let p = (*cl).prev;
        let n = (*cl).next;
        (*p).next = n;
        (*n).prev = p;
    }
}

/// `new` takes `old`'s position (and neighbours' links point to `new`
/// instead of `old`). `old` is detached but its own `next`/`prev` are left
/// dangling (pointing at its former neighbours) — used transiently during
/// the unprivileged builder's collision testing, where the swap is reverted
/// a few instructions later (spec.md §4.4).
///
/// # Safety
/// `old`'s neighbours must be valid; `new` must not already be linked
/// elsewhere.
pub unsafe fn replace(new: *mut Cacheline, old: *mut Cacheline) {
    unsafe {
        let p = (*old).prev;
        let n = (*old).next;
        (*new).prev = p;
        (*new).next = n;
        (*p).next = new;
        (*n).prev = new;
    }
}

/// Count lines by walking backward (via `prev`) until returning to `entry`.
/// Diagnostic only (spec.md §4.4) — not used on any measured path.
///
/// # Safety
/// `entry` must be part of a valid ring (or a dangling/corrupted one, in
/// which case this may not terminate — callers doing corruption testing
/// should bound the walk externally).
pub unsafe fn length(entry: *mut Cacheline) -> usize {
    unsafe {
        let mut count = 1;
        let mut cur = (*entry).prev;
        while cur != entry {
            count += 1;
            cur = (*cur).prev;
        }
        count
    }
}
