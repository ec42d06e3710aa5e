//! Prime/Probe primitives (spec.md §4.9).
//!
//! All four primitives are `#[inline(always)]` so a caller chaining them
//! back-to-back gets one measured region with no call overhead between
//! steps, matching the discipline in [`crate::arch`].

use crate::arch;
use crate::cacheline::{Cacheline, Flags};

/// Walk `next` pointers all the way around the ring, `mfence`-ing after each
/// load so the access commits before the next one issues. Returns the
/// predecessor of `entry` — the natural starting point for the next round,
/// since priming the next round from there continues the same direction
/// without re-touching `entry` twice in a row.
///
/// # Safety
/// `entry` must be part of a valid, fully-stitched ring of `num_lines` lines.
#[inline(always)]
pub unsafe fn prime(entry: *mut Cacheline, num_lines: usize) -> *mut Cacheline {
    unsafe {
        let mut cur = entry;
        for _ in 0..num_lines {
            arch::load(cur as *const u8);
            arch::mfence();
            cur = (*cur).next;
        }
        (*entry).prev
    }
}

/// Same as [`prime`] but follows `prev`, used for L2 so the first sets
/// touched are the ones [`probe`] reads first (spec.md §4.9).
///
/// # Safety
/// Same as [`prime`].
#[inline(always)]
pub unsafe fn prime_rev(entry: *mut Cacheline, num_lines: usize) -> *mut Cacheline {
    unsafe {
        let mut cur = entry;
        for _ in 0..num_lines {
            arch::load(cur as *const u8);
            arch::mfence();
            cur = (*cur).prev;
        }
        (*entry).next
    }
}

/// Time one set's `associativity` lines in a single back-to-back access
/// burst, writing the result into `set_head.timing`. Returns the next set's
/// head line (the line one past the last line of this set), so [`probe`] can
/// chain calls without re-deriving set boundaries.
///
/// # Safety
/// `set_head` must be the FIRST line of a set of exactly `associativity`
/// lines, all part of a valid ring.
#[inline(always)]
pub unsafe fn probe_set(set_head: *mut Cacheline, associativity: usize) -> *mut Cacheline {
    unsafe {
        let t0 = arch::start_timer();
        let mut cur = set_head;
        for _ in 0..associativity {
            arch::load(cur as *const u8);
            cur = (*cur).next;
        }
        let elapsed = arch::stop_timer(t0);
        (*set_head).timing = elapsed;
        cur
    }
}

/// Walk the whole ring, calling [`probe_set`] for each set in turn.
///
/// # Safety
/// `entry` must be the FIRST line of some set in a valid, fully-stitched
/// ring totalling `num_lines` lines, each set exactly `associativity` long.
#[inline(always)]
pub unsafe fn probe(entry: *mut Cacheline, num_lines: usize, associativity: usize) {
    unsafe {
        let num_sets = num_lines / associativity;
        let mut cur = entry;
        for _ in 0..num_sets {
            cur = probe_set(cur, associativity);
        }
    }
}

/// A single `start_timer; walk; stop_timer` across the whole structure —
/// one cycle count for the entire ring, used by the unprivileged builder's
/// collision oracle (spec.md §4.7) rather than per-set granularity.
///
/// # Safety
/// `entry` must be part of a valid ring of `num_lines` lines.
#[inline(always)]
pub unsafe fn full_probe(entry: *mut Cacheline, num_lines: usize) -> u32 {
    unsafe {
        let t0 = arch::start_timer();
        let mut cur = entry;
        for _ in 0..num_lines {
            arch::load(cur as *const u8);
            cur = (*cur).next;
        }
        arch::stop_timer(t0)
    }
}

/// Copy each line's `timing` in walk order into `out` (cleared and refilled).
///
/// # Safety
/// `entry` must be part of a valid ring of `num_lines` lines.
pub unsafe fn per_line_times(entry: *mut Cacheline, num_lines: usize, out: &mut Vec<u32>) {
    unsafe {
        out.clear();
        out.reserve(num_lines);
        let mut cur = entry;
        for _ in 0..num_lines {
            out.push((*cur).timing);
            cur = (*cur).next;
        }
    }
}

/// For every line marked FIRST, write its `timing` into `out[set_index]`.
/// `out` must have at least as many slots as the highest set index present.
///
/// # Safety
/// `entry` must be part of a valid ring of `num_lines` lines.
pub unsafe fn set_times(entry: *mut Cacheline, num_lines: usize, out: &mut [u32]) {
    unsafe {
        let mut cur = entry;
        for _ in 0..num_lines {
            if (*cur).flags.contains(Flags::FIRST) {
                out[(*cur).set_index as usize] = (*cur).timing;
            }
            cur = (*cur).next;
        }
    }
}

/// Add every line's `timing` into `out[set_index]` — used when individual
/// lines, not whole sets, were timed.
///
/// # Safety
/// `entry` must be part of a valid ring of `num_lines` lines.
pub unsafe fn per_set_sum(entry: *mut Cacheline, num_lines: usize, out: &mut [u32]) {
    unsafe {
        let mut cur = entry;
        for _ in 0..num_lines {
            out[(*cur).set_index as usize] += (*cur).timing;
            cur = (*cur).next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cacheline;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// Build a tiny ring of `sets` sets of `assoc` lines each, already
    /// stitched and tagged, for exercising the primitives without going
    /// through a real builder.
    struct Ring {
        ptr: *mut Cacheline,
        layout: Layout,
        num_lines: usize,
    }

    impl Drop for Ring {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr as *mut u8, self.layout) };
        }
    }

    fn build_ring(sets: usize, assoc: usize) -> Ring {
        let n = sets * assoc;
        let layout = Layout::array::<Cacheline>(n).unwrap();
        let base = unsafe { alloc_zeroed(layout) as *mut Cacheline };

        let mut prev_set_last: Option<*mut Cacheline> = None;
        let mut first_of_first_set = None;
        for s in 0..sets {
            let mut prev_in_set: Option<*mut Cacheline> = None;
            for w in 0..assoc {
                let idx = s * assoc + w;
                let line = unsafe { base.add(idx) };
                unsafe {
                    (*line).set_index = s as u32;
                    (*line).flags = Flags::empty();
                    (*line).timing = 0;
                }
                if w == 0 {
                    unsafe { (*line).flags |= Flags::FIRST };
                    if s == 0 {
                        first_of_first_set = Some(line);
                    }
                }
                if w == assoc - 1 {
                    unsafe { (*line).flags |= Flags::LAST };
                }
                match prev_in_set {
                    None => unsafe { cacheline::insert_after(std::ptr::null_mut(), line) },
                    Some(p) => unsafe { cacheline::insert_after(p, line) },
                }
                prev_in_set = Some(line);
            }
            if let Some(last) = prev_set_last {
                let this_first = unsafe { base.add(s * assoc) };
                unsafe {
                    (*last).next = this_first;
                    (*this_first).prev = last;
                }
            }
            prev_set_last = Some(unsafe { base.add(s * assoc + assoc - 1) });
        }
        // Close the ring: last set's last line links to first set's first.
        let entry = first_of_first_set.unwrap();
        let last = prev_set_last.unwrap();
        unsafe {
            (*last).next = entry;
            (*entry).prev = last;
        }

        Ring {
            ptr: base,
            layout,
            num_lines: n,
        }
    }

    #[test]
    fn prime_returns_predecessor_of_entry() {
        let ring = build_ring(2, 3);
        let entry = ring.ptr;
        let pred = unsafe { prime(entry, ring.num_lines) };
        assert_eq!(pred, unsafe { (*entry).prev });
    }

    #[test]
    fn prime_rev_returns_successor_of_entry() {
        let ring = build_ring(2, 3);
        let entry = ring.ptr;
        let succ = unsafe { prime_rev(entry, ring.num_lines) };
        assert_eq!(succ, unsafe { (*entry).next });
    }

    #[test]
    fn probe_writes_a_timing_on_every_first_line() {
        let ring = build_ring(3, 4);
        let entry = ring.ptr;
        unsafe { probe(entry, ring.num_lines, 4) };
        let mut cur = entry;
        let mut first_seen = 0;
        for _ in 0..ring.num_lines {
            if unsafe { (*cur).flags.contains(Flags::FIRST) } {
                first_seen += 1;
                assert!(unsafe { (*cur).timing } < 10_000_000);
            }
            cur = unsafe { (*cur).next };
        }
        assert_eq!(first_seen, 3);
    }

    #[test]
    fn full_probe_returns_a_single_count() {
        let ring = build_ring(2, 2);
        let t = unsafe { full_probe(ring.ptr, ring.num_lines) };
        assert!(t < 10_000_000);
    }

    #[test]
    fn per_line_times_matches_walk_order() {
        let ring = build_ring(2, 2);
        unsafe {
            let mut cur = ring.ptr;
            for v in [10u32, 20, 30, 40] {
                (*cur).timing = v;
                cur = (*cur).next;
            }
        }
        let mut out = Vec::new();
        unsafe { per_line_times(ring.ptr, ring.num_lines, &mut out) };
        assert_eq!(out, vec![10, 20, 30, 40]);
    }

    #[test]
    fn set_times_picks_up_only_first_lines() {
        let ring = build_ring(2, 2);
        unsafe {
            (*ring.ptr).timing = 111;
            let second_set_head = (*(*ring.ptr).next).next;
            (*second_set_head).timing = 222;
        }
        let mut out = vec![0u32; 2];
        unsafe { set_times(ring.ptr, ring.num_lines, &mut out) };
        assert_eq!(out, vec![111, 222]);
    }

    #[test]
    fn per_set_sum_accumulates_all_lines_in_a_set() {
        let ring = build_ring(2, 2);
        unsafe {
            let mut cur = ring.ptr;
            for v in [5u32, 7, 0, 0] {
                (*cur).timing = v;
                cur = (*cur).next;
            }
        }
        let mut out = vec![0u32; 2];
        unsafe { per_set_sum(ring.ptr, ring.num_lines, &mut out) };
        assert_eq!(out, vec![12, 0]);
    }
}
