//! Virtually indexed builder (spec.md §4.5).
//!
//! Allocates a single page-aligned block of `ctx.cache_bytes`, then derives
//! each line's set index straight from its virtual address — valid because
//! L1's index bits lie inside the page offset, so virtual and physical
//! indexing agree (spec.md §4.3). The block always covers every set exactly
//! `associativity` times, regardless of how many sets the caller actually
//! wants: the set-index bits repeat once per page, so a smaller block would
//! not contain `associativity` ways for an arbitrary requested set.

use std::alloc::Layout;
use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::cacheline::{Cacheline, Flags};
use crate::config::PAGE_SIZE;
use crate::context::CacheContext;
use crate::error::fatal_oom;
use crate::topology::{self, TaggedLine};

use super::CacheStructure;

pub fn build(ctx: &CacheContext, wanted_sets: &[usize], rng: &mut impl Rng) -> CacheStructure {
    let associativity = ctx.associativity;
    let layout = Layout::from_size_align(ctx.cache_bytes, PAGE_SIZE)
        .unwrap_or_else(|e| fatal_oom(&format!("bad virtual-builder layout: {e}")));

    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        fatal_oom("virtual builder: allocation failed");
    }

    // Step 2 of spec.md §4.5: every line slot's set index falls out of its
    // own virtual address.
    let wanted: HashSet<usize> = wanted_sets.iter().copied().collect();
    let needed = wanted_sets.len() * associativity;
    let mut tagged = Vec::with_capacity(needed);
    let mut remaining: HashMap<usize, usize> =
        wanted_sets.iter().map(|&s| (s, associativity)).collect();

    let num_slots = ctx.cache_bytes / ctx.line_size;
    for i in 0..num_slots {
        let line_ptr = unsafe { base.add(i * ctx.line_size) } as *mut Cacheline;
        let vaddr = line_ptr as usize;
        let set_index = (vaddr >> ctx.line_bits()) & (ctx.sets - 1);

        if !wanted.contains(&set_index) {
            continue;
        }
        let slot = remaining.get_mut(&set_index).unwrap();
        if *slot == 0 {
            // Already have `associativity` lines for this set; leave the
            // rest of the block's matching slots unused (still owned, freed
            // with the block on release).
            continue;
        }
        *slot -= 1;

        unsafe {
            (*line_ptr).set_index = set_index as u32;
            (*line_ptr).flags = Flags::empty();
            (*line_ptr).timing = 0;
        }
        tagged.push(TaggedLine {
            line: line_ptr,
            set_index: set_index as u32,
        });
    }

    if tagged.len() != needed {
        fatal_oom(&format!(
            "virtual builder: block covered only {} of {needed} needed lines \
             for {} wanted sets",
            tagged.len(),
            wanted_sets.len()
        ));
    }

    let entry = topology::assemble(&tagged, associativity, rng);
    debug_assert!(unsafe { topology::sanity_check(entry, needed, associativity) });

    super::finish(entry, needed, vec![super::heap_owner(base, layout)])
}
