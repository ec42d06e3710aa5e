//! Physically indexed builder, privileged path (spec.md §4.6).
//!
//! One page at a time: zero it, resolve every line slot's physical set index
//! via [`crate::translate::to_physical`], and accept or reject the whole
//! page atomically based on room in the *first* relevant line's set — not
//! every line's set. This reproduces the source's documented over-commit
//! (spec.md §9): if a later slot's set is already full, its count is bumped
//! past `associativity` anyway, because the page was already accepted. The
//! resulting excess lines are still owned (freed on release) but trimmed
//! before topology assembly, which requires buckets of exactly
//! `associativity`.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::cacheline::{Cacheline, Flags};
use crate::config::{CACHE_GROUP_SIZE, PAGE_SIZE};
use crate::context::CacheContext;
use crate::error::{fatal_misuse, fatal_oom};
use crate::topology::{self, TaggedLine};
use crate::translate;

use super::CacheStructure;

/// Safety bound: if this many pages have been examined without satisfying
/// every wanted set, the allocator or translation path is behaving in a way
/// this builder cannot make progress against.
const MAX_PAGES: usize = 1 << 20;

pub fn build(ctx: &CacheContext, wanted_sets: &[usize], rng: &mut impl Rng) -> CacheStructure {
    let associativity = ctx.associativity;
    let wanted: HashSet<u32> = wanted_sets.iter().map(|&s| s as u32).collect();

    let mut counts: HashMap<u32, usize> = wanted.iter().map(|&s| (s, 0usize)).collect();
    let mut collected: HashMap<u32, Vec<*mut Cacheline>> =
        wanted.iter().map(|&s| (s, Vec::with_capacity(associativity))).collect();
    let mut owners = Vec::new();

    let mut pages_tried = 0usize;
    while counts.values().any(|&c| c < associativity) {
        pages_tried += 1;
        if pages_tried > MAX_PAGES {
            fatal_oom("physical-privileged builder: exceeded page search bound");
        }

        let base = mmap_page();
        let mut slots = Vec::with_capacity(CACHE_GROUP_SIZE);
        for i in 0..CACHE_GROUP_SIZE {
            let line_ptr = unsafe { base.add(i * ctx.line_size) } as *mut Cacheline;
            let phys = translate::to_physical(line_ptr as *const u8).unwrap_or_else(|| {
                fatal_misuse("translation failed after can_translate() succeeded")
            });
            let set_index = ((phys.0 as usize) >> ctx.line_bits()) & (ctx.sets - 1);
            slots.push(set_index as u32);
        }

        // Accept/reject atomically on the first wanted, non-full slot's set.
        let first_relevant = slots.iter().find(|s| wanted.contains(s));
        let accept = match first_relevant {
            None => false,
            Some(s) => counts[s] < associativity,
        };

        if !accept {
            unsafe { munmap_page(base) };
            continue;
        }

        for (i, &set_index) in slots.iter().enumerate() {
            if !wanted.contains(&set_index) {
                continue;
            }
            let line_ptr = unsafe { base.add(i * ctx.line_size) } as *mut Cacheline;
            unsafe {
                (*line_ptr).set_index = set_index;
                (*line_ptr).flags = Flags::empty();
                (*line_ptr).timing = 0;
            }
            // Over-commit preserved: push even past `associativity`, counted
            // and trimmed below.
            collected.get_mut(&set_index).unwrap().push(line_ptr);
            *counts.get_mut(&set_index).unwrap() += 1;
        }

        owners.push(super::mmap_owner(base, PAGE_SIZE));
    }

    let mut tagged = Vec::with_capacity(wanted_sets.len() * associativity);
    for (&set_index, lines) in collected.iter_mut() {
        lines.truncate(associativity);
        for &line in lines.iter() {
            tagged.push(TaggedLine { line, set_index });
        }
    }

    let num_lines = tagged.len();
    let entry = topology::assemble(&tagged, associativity, rng);
    debug_assert!(unsafe { topology::sanity_check(entry, num_lines, associativity) });

    super::finish(entry, num_lines, owners)
}

fn mmap_page() -> *mut u8 {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            fatal_oom("physical-privileged builder: mmap failed");
        }
        ptr as *mut u8
    }
}

unsafe fn munmap_page(ptr: *mut u8) {
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, PAGE_SIZE);
    }
}
