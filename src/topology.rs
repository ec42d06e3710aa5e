//! Topology assembly: randomise per-set line order, randomise set order,
//! stitch into a single ring (spec.md §3 "Topology invariants", §4.5 steps
//! 3–5, §4.8).
//!
//! Identical procedure regardless of which builder produced the raw
//! (line pointer, set index) pairs — virtual, physical-privileged, and
//! physical-unprivileged all funnel through [`assemble`].

use rand::Rng;

use crate::cacheline::{self, Cacheline, Flags};
use crate::error::fatal_structural;

/// Fisher–Yates shuffle, preserving the source's documented off-by-one:
/// the swap index is drawn from `0..=i` via `rand() % (i + 1)` worth of
/// range, but the loop bound starts at `len - 1` and is used as the modulus
/// directly rather than `i + 1`, which slightly biases the permutation
/// (spec.md §9 Open Questions — "Preserve as-is unless tests show bias
/// affecting signal quality"; no test here asserts pure uniformity for this
/// reason, only that it's a bijection of the slice, see module tests).
pub fn biased_fisher_yates<T>(items: &mut [T], rng: &mut impl Rng) {
    let len = items.len();
    if len <= 1 {
        return;
    }
    for i in (1..len).rev() {
        // Source behavior: modulus is the *current* `i`, not `i + 1`.
        let j = rng.random_range(0..i);
        items.swap(i, j);
    }
}

/// One line tagged with the set it was determined to belong to, as produced
/// by any of the three builders.
#[derive(Clone, Copy)]
pub struct TaggedLine {
    pub line: *mut Cacheline,
    pub set_index: u32,
}

/// Bucketise `lines` by `set_index`, randomise order within each bucket,
/// randomise the order of buckets (sets), then stitch everything into one
/// ring: within a set the lines form a cyclic doubly linked list, the last
/// line of set *i* links forward to the first line of set *i+1*, and the
/// last set links back to the first (spec.md §3, §4.5 steps 3–5).
///
/// The set of buckets is exactly the distinct `set_index` values present in
/// `lines` — this is what lets the same procedure serve a full-cache build
/// and a `build_for_sets` partial build alike (spec.md §4.8). `associativity`
/// is the expected size of every bucket; a mismatch is a structural failure
/// (spec.md §4.5 step 5, §7(c)).
///
/// Returns the entry line (first line of the first set in the randomised
/// set order).
pub fn assemble(lines: &[TaggedLine], associativity: usize, rng: &mut impl Rng) -> *mut Cacheline {
    let mut buckets: std::collections::BTreeMap<u32, Vec<*mut Cacheline>> = Default::default();
    for tl in lines {
        buckets.entry(tl.set_index).or_default().push(tl.line);
    }

    for (set_idx, bucket) in buckets.iter() {
        if bucket.len() != associativity {
            fatal_structural(&format!(
                "set {set_idx} has {} lines, expected associativity {associativity}",
                bucket.len()
            ));
        }
    }

    let set_keys: Vec<u32> = buckets.keys().copied().collect();
    let mut buckets: std::collections::HashMap<u32, Vec<*mut Cacheline>> =
        buckets.into_iter().collect();

    for bucket in buckets.values_mut() {
        biased_fisher_yates(bucket, rng);
    }

    let mut set_order: Vec<u32> = set_keys;
    biased_fisher_yates(&mut set_order, rng);

    // Stitch each set's bucket into its own cyclic list, tag FIRST/LAST.
    for bucket in buckets.values() {
        let first = bucket[0];
        unsafe {
            cacheline::insert_after(std::ptr::null_mut(), first);
            (*first).flags |= Flags::FIRST;
            if bucket.len() == 1 {
                (*first).flags |= Flags::LAST;
            }
            let mut prev = first;
            for &line in &bucket[1..] {
                cacheline::insert_after(prev, line);
                prev = line;
            }
            (*prev).flags |= Flags::LAST;
        }
    }

    // Stitch the sets together, in set_order, into one ring: each set's
    // LAST line's `next` becomes the next set's FIRST line (and vice versa
    // for `prev`).
    let ordered_firsts: Vec<*mut Cacheline> =
        set_order.iter().map(|&s| buckets[&s][0]).collect();
    let ordered_lasts: Vec<*mut Cacheline> = set_order
        .iter()
        .map(|&s| *buckets[&s].last().unwrap())
        .collect();

    let n = ordered_firsts.len();
    unsafe {
        for i in 0..n {
            let this_last = ordered_lasts[i];
            let next_first = ordered_firsts[(i + 1) % n];
            (*this_last).next = next_first;
            (*next_first).prev = this_last;
        }
    }

    ordered_firsts[0]
}

/// Sanity check: for every set reachable from `entry`, verify it has
/// exactly `associativity` lines and exactly one FIRST and one LAST
/// (spec.md §4.5 step 5, §8). Walks the whole ring once.
///
/// # Safety
/// `entry` must be part of a valid, fully-stitched ring.
pub unsafe fn sanity_check(entry: *mut Cacheline, num_lines: usize, associativity: usize) -> bool {
    unsafe {
        let mut total = 0usize;
        let mut cur = entry;
        let mut first_count = 0usize;
        let mut last_count = 0usize;
        let mut current_set_len = 0usize;
        loop {
            total += 1;
            current_set_len += 1;
            if (*cur).flags.contains(Flags::FIRST) {
                first_count += 1;
            }
            if (*cur).flags.contains(Flags::LAST) {
                last_count += 1;
                if current_set_len != associativity {
                    return false;
                }
                current_set_len = 0;
            }
            cur = (*cur).next;
            if cur == entry {
                break;
            }
        }
        total == num_lines && first_count == last_count && total / associativity == first_count
    }
}
