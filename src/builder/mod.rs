//! Builder dispatch and the owned, built [`CacheStructure`] (spec.md §4.5–§4.8).
//!
//! [`build`] and [`build_for_sets`] select a construction strategy based on
//! the context's addressing mode and, for physical contexts, whether
//! [`crate::translate::can_translate`] succeeds — exactly the soft
//! recovery spec.md §4.11 describes ("`can_translate` returning false routes
//! to the unprivileged builder").

pub mod phys_priv;
pub mod phys_unpriv;
pub mod virt;

use std::alloc::Layout;
use std::collections::HashSet;

use rand::Rng;

use crate::cacheline::Cacheline;
use crate::context::{Addressing, CacheContext};
use crate::translate;

/// How one page (or, for the virtual builder, one single large block) of
/// backing memory was obtained, so [`release`] knows how to free it.
enum PageOwner {
    /// `std::alloc`-backed, used by the virtual builder's single aligned
    /// block.
    Heap { ptr: *mut u8, layout: Layout },
    /// `mmap`-backed, used by both physical builders, one page at a time.
    Mmap { ptr: *mut u8, len: usize },
}

/// A fully built, topology-assembled Prime+Probe structure. Exclusively owns
/// every backing page; callers hold only [`CacheStructure::entry`] as an
/// opaque handle into the ring (spec.md §3 "Ownership").
pub struct CacheStructure {
    pub entry: *mut Cacheline,
    pub num_lines: usize,
    owners: Vec<PageOwner>,
}

impl CacheStructure {
    fn new(entry: *mut Cacheline, num_lines: usize, owners: Vec<PageOwner>) -> Self {
        Self {
            entry,
            num_lines,
            owners,
        }
    }
}

/// Free every backing page exactly once, coalescing and deduplicating page
/// bases first (spec.md §3 "Lifecycle").
pub fn release(structure: CacheStructure) {
    let mut freed = HashSet::new();
    for owner in structure.owners {
        match owner {
            PageOwner::Heap { ptr, layout } => {
                if freed.insert(ptr as usize) {
                    unsafe {
                        std::alloc::dealloc(ptr, layout);
                    }
                }
            }
            PageOwner::Mmap { ptr, len } => {
                if freed.insert(ptr as usize) {
                    unsafe {
                        libc::munmap(ptr as *mut libc::c_void, len);
                    }
                }
            }
        }
    }
}

/// Release a structure built for a single set (used by
/// [`crate::victim`]). Identical to [`release`]; kept as a distinct name so
/// call sites document intent, mirroring spec.md §6's distinct
/// `release_set_structure` entry point.
pub fn release_set_structure(structure: CacheStructure) {
    release(structure)
}

/// Free every owned page except the one backing `keep`, and re-link `keep`
/// as a singleton ring (spec.md §4.10: for PHYSICAL victims, every other
/// line of the one-set structure is freed right away since each lives on
/// its own page).
pub(crate) fn release_all_but(structure: CacheStructure, keep: *mut Cacheline) -> CacheStructure {
    let set_index = unsafe { (*keep).set_index };
    let keep_addr = keep as usize;
    let mut kept_owner = None;

    for owner in structure.owners {
        let (base, len) = match &owner {
            PageOwner::Heap { ptr, layout } => (*ptr as usize, layout.size()),
            PageOwner::Mmap { ptr, len } => (*ptr as usize, *len),
        };
        if keep_addr >= base && keep_addr < base + len {
            kept_owner = Some(owner);
        } else {
            match owner {
                PageOwner::Heap { ptr, layout } => unsafe { std::alloc::dealloc(ptr, layout) },
                PageOwner::Mmap { ptr, len } => unsafe {
                    libc::munmap(ptr as *mut libc::c_void, len)
                },
            }
        }
    }

    unsafe { crate::cacheline::Cacheline::init_singleton(keep, set_index) };
    CacheStructure::new(keep, 1, kept_owner.into_iter().collect())
}

/// Build a structure covering every set of `ctx`.
pub fn build(ctx: &CacheContext, rng: &mut impl Rng) -> CacheStructure {
    let all_sets: Vec<usize> = (0..ctx.sets).collect();
    build_for_sets(ctx, &all_sets, rng)
}

/// Build a structure covering only `wanted_sets` (spec.md §4.5 scenario:
/// "Partial set list"). `wanted_sets` must contain distinct set indices in
/// `0..ctx.sets`.
pub fn build_for_sets(
    ctx: &CacheContext,
    wanted_sets: &[usize],
    rng: &mut impl Rng,
) -> CacheStructure {
    match ctx.addressing {
        Addressing::Virtual => virt::build(ctx, wanted_sets, rng),
        Addressing::Physical => {
            if translate::can_translate() {
                phys_priv::build(ctx, wanted_sets, rng)
            } else {
                phys_unpriv::build(ctx, wanted_sets, rng)
            }
        }
    }
}

pub(crate) fn heap_owner(ptr: *mut u8, layout: Layout) -> PageOwner {
    PageOwner::Heap { ptr, layout }
}

pub(crate) fn mmap_owner(ptr: *mut u8, len: usize) -> PageOwner {
    PageOwner::Mmap { ptr, len }
}

pub(crate) fn finish(entry: *mut Cacheline, num_lines: usize, owners: Vec<PageOwner>) -> CacheStructure {
    CacheStructure::new(entry, num_lines, owners)
}
