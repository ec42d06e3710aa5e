//! Physically indexed builder, unprivileged path (spec.md §4.7).
//!
//! Without `CAP_SYS_ADMIN` there is no way to ask the kernel which physical
//! set a line maps to, so this builder uses Prime+Probe itself as an oracle:
//! [`has_collision`] decides whether a candidate line shares a target set
//! with a known ring by comparing primed-and-probed timing against a
//! baseline, using the L3−L2 latency gap as the separating threshold.
//!
//! Grouping relies on one fact that holds regardless of privilege (spec.md
//! §4.6): every line of a single physical page maps to `cache_group_size`
//! consecutive sets, because within a page the set-index low bits come from
//! the page offset and the whole page shares its high address bits. So
//! classifying *one* representative line per page (its offset-0 candidate)
//! against already-known groups is enough to classify the whole page at
//! once — the per-offset `identify_cache_sets` walk spec.md §4.7 step 4
//! describes is this same clustering decision, specialised to confirming one
//! line at a time against a partially built ring; here it is applied
//! page-at-a-time using the page-locality guarantee instead.
//!
//! [`has_collision`] only discriminates once its ring already holds
//! `associativity` genuine members of the set it represents — with fewer
//! members, priming the ring can never evict a same-set candidate for real,
//! so no timing signal is physically possible. Each group therefore starts
//! in a *bootstrap* state: the first `associativity` pages that aren't
//! claimed by an already-full group are accumulated into the one open group
//! blindly, with no collision test at all, and only once that ring reaches
//! `associativity` members does it become eligible to classify further
//! pages via [`has_collision`]. At most one group is ever mid-bootstrap at a
//! time, so incoming pages that match no full group fall through to it
//! unambiguously.
//!
//! `wanted_sets`' logical group numbers are assigned in discovery order: an
//! unprivileged attacker has no ground truth for which physical group is
//! "group 0", so set numbering here is self-consistent within one built
//! structure rather than tied to hardware truth (acceptable per spec.md §8
//! scenario 3, which only requires structural validity and separation, not
//! agreement with the privileged numbering).

use std::collections::HashMap;

use rand::Rng;

use crate::arch;
use crate::cacheline::{self, Cacheline, Flags};
use crate::config::{self, CACHE_GROUP_SIZE, PAGE_SIZE};
use crate::context::CacheContext;
use crate::error::fatal_oom;
use crate::primeprobe;
use crate::topology::{self, TaggedLine};

use super::CacheStructure;

const MAX_PAGES: usize = 1 << 20;
/// After this many pages in a row land in an already-settled group instead
/// of starting a new one, request a double-size aligned block and discard
/// its second half, to break an allocator that keeps returning the same
/// page parity (spec.md §4.7 step 5).
const PARITY_ESCAPE_STREAK: usize = 3;

struct GroupTrack {
    /// Ring of offset-0 candidates confirmed (by [`has_collision`]) to share
    /// a set, used purely to classify further pages into this group.
    repr_entry: *mut Cacheline,
    repr_len: usize,
    /// Confirmed members per intra-page offset, capped at `associativity`.
    buckets: HashMap<usize, Vec<*mut Cacheline>>,
}

pub fn build(ctx: &CacheContext, wanted_sets: &[usize], rng: &mut impl Rng) -> CacheStructure {
    let associativity = ctx.associativity;
    let threshold = config::L3_ACCESS_TIME.saturating_sub(ctx.access_time);

    let wanted_groups: Vec<usize> = {
        let mut gs: Vec<usize> = wanted_sets.iter().map(|&s| s / CACHE_GROUP_SIZE).collect();
        gs.sort_unstable();
        gs.dedup();
        gs
    };
    let needed_offsets_for_group = |group_position: usize| -> Vec<usize> {
        let group_number = wanted_groups[group_position];
        wanted_sets
            .iter()
            .filter(|&&s| s / CACHE_GROUP_SIZE == group_number)
            .map(|&s| s % CACHE_GROUP_SIZE)
            .collect()
    };

    let mut groups: Vec<GroupTrack> = Vec::new();
    let mut owners = Vec::new();
    let mut consecutive_known_hits = 0usize;
    let mut pages_tried = 0usize;

    loop {
        if satisfied(&groups, wanted_sets, associativity) {
            break;
        }
        pages_tried += 1;
        if pages_tried > MAX_PAGES {
            fatal_oom("physical-unprivileged builder: exceeded page search bound");
        }

        let base = if consecutive_known_hits >= PARITY_ESCAPE_STREAK {
            log::debug!("phys_unpriv: parity-escape triggered after {consecutive_known_hits} redundant hits");
            consecutive_known_hits = 0;
            mmap_double_use_first()
        } else {
            mmap_page()
        };

        let offset0 = base as *mut Cacheline;

        // Only groups that have finished bootstrapping (a full ring of
        // `associativity` members) give `has_collision` a physically
        // meaningful signal to test against.
        let matched_full_group = groups.iter().position(|g| {
            g.repr_len >= associativity
                && unsafe { has_collision(offset0, g.repr_entry, associativity, associativity, threshold) }
        });

        let bootstrapping_group = groups.iter().position(|g| g.repr_len < associativity);

        if let Some(group_position) = matched_full_group {
            consecutive_known_hits += 1;
            add_page_to_group(
                &mut groups[group_position],
                wanted_groups[group_position],
                base,
                offset0,
                ctx,
                associativity,
                &needed_offsets_for_group(group_position),
            );
            owners.push(super::mmap_owner(base, PAGE_SIZE));
            log::debug!(
                "phys_unpriv: page matched known group {group_position} ({pages_tried} pages)"
            );
        } else if let Some(group_position) = bootstrapping_group {
            consecutive_known_hits = 0;
            add_page_to_group(
                &mut groups[group_position],
                wanted_groups[group_position],
                base,
                offset0,
                ctx,
                associativity,
                &needed_offsets_for_group(group_position),
            );
            owners.push(super::mmap_owner(base, PAGE_SIZE));
            log::debug!(
                "phys_unpriv: page bootstrapped into group {group_position} ({} / {associativity}, {pages_tried} pages)",
                groups[group_position].repr_len
            );
        } else if groups.len() < wanted_groups.len() {
            consecutive_known_hits = 0;
            unsafe { Cacheline::init_singleton(offset0, u32::MAX) };
            let group_position = groups.len();
            groups.push(GroupTrack {
                repr_entry: offset0,
                repr_len: 1,
                buckets: HashMap::new(),
            });
            fill_needed_offsets(
                &mut groups[group_position],
                wanted_groups[group_position],
                base,
                ctx,
                associativity,
                &needed_offsets_for_group(group_position),
            );
            owners.push(super::mmap_owner(base, PAGE_SIZE));
            log::debug!("phys_unpriv: opened new group {group_position} at page {pages_tried}");
        } else {
            // Not one of our known groups, and we don't need any more
            // groups: of no use.
            unsafe { munmap_page(base) };
        }
    }

    let mut tagged = Vec::with_capacity(wanted_sets.len() * associativity);
    for (group_position, group_number) in wanted_groups.iter().enumerate() {
        let needed = needed_offsets_for_group(group_position);
        for o in needed {
            let set_index = (*group_number * CACHE_GROUP_SIZE + o) as u32;
            let mut lines = groups[group_position].buckets.remove(&o).unwrap_or_default();
            lines.truncate(associativity);
            for line in lines {
                tagged.push(TaggedLine {
                    line,
                    set_index,
                });
            }
        }
    }

    let num_lines = tagged.len();
    let entry = topology::assemble(&tagged, associativity, rng);
    debug_assert!(unsafe { topology::sanity_check(entry, num_lines, associativity) });

    super::finish(entry, num_lines, owners)
}

/// Grow `group`'s representative ring with `offset0` while it is still
/// bootstrapping (no-op once the ring has reached `associativity`), then
/// fill in this page's contribution to the wanted offsets.
fn add_page_to_group(
    group: &mut GroupTrack,
    group_number: usize,
    base: *mut u8,
    offset0: *mut Cacheline,
    ctx: &CacheContext,
    associativity: usize,
    needed: &[usize],
) {
    if group.repr_len < associativity {
        unsafe { cacheline::insert_after(group.repr_entry, offset0) };
        group.repr_len += 1;
    }
    fill_needed_offsets(group, group_number, base, ctx, associativity, needed);
}

/// Record this page's lines at the wanted intra-page offsets into `group`'s
/// buckets, capped at `associativity` per offset.
fn fill_needed_offsets(
    group: &mut GroupTrack,
    group_number: usize,
    base: *mut u8,
    ctx: &CacheContext,
    associativity: usize,
    needed: &[usize],
) {
    for &o in needed {
        let line = unsafe { base.add(o * ctx.line_size) } as *mut Cacheline;
        let bucket = group.buckets.entry(o).or_default();
        if bucket.len() < associativity {
            unsafe {
                (*line).set_index = (group_number * CACHE_GROUP_SIZE + o) as u32;
                (*line).flags = Flags::empty();
                (*line).timing = 0;
            }
            bucket.push(line);
        }
    }
}

fn satisfied(groups: &[GroupTrack], wanted_sets: &[usize], associativity: usize) -> bool {
    let mut wanted_groups: Vec<usize> = wanted_sets.iter().map(|&s| s / CACHE_GROUP_SIZE).collect();
    wanted_groups.sort_unstable();
    wanted_groups.dedup();

    if groups.len() < wanted_groups.len() {
        return false;
    }
    for (group_position, &group_number) in wanted_groups.iter().enumerate() {
        let needed: Vec<usize> = wanted_sets
            .iter()
            .filter(|&&s| s / CACHE_GROUP_SIZE == group_number)
            .map(|&s| s % CACHE_GROUP_SIZE)
            .collect();
        for o in needed {
            let have = groups[group_position]
                .buckets
                .get(&o)
                .map(|v| v.len())
                .unwrap_or(0);
            if have < associativity {
                return false;
            }
        }
    }
    true
}

/// Collision oracle (spec.md §4.7 step 2): does `cand` share a set with any
/// line in `ring`? Runs every rotation of `ring` (preserving the source's
/// documented behaviour of advancing by `next` and terminating after exactly
/// `ring_len` steps, spec.md §9) and declares overall collision if at least
/// `collision_threshold_rotations(ring_len, associativity)` rotations agree.
///
/// # Safety
/// `cand` must not be linked into any ring; `ring` must be a valid cyclic
/// ring of `ring_len` lines that does not already contain `cand`.
unsafe fn has_collision(
    cand: *mut Cacheline,
    ring: *mut Cacheline,
    ring_len: usize,
    associativity: usize,
    threshold: u32,
) -> bool {
    unsafe {
        let mut votes = 0usize;
        let mut head = ring;
        for _ in 0..ring_len {
            let mut baseline = u32::MAX;
            for _ in 0..config::COLLISION_REP {
                arch::load(cand as *const u8);
                primeprobe::prime_rev(ring, ring_len);
                let t = primeprobe::full_probe(ring, ring_len);
                baseline = baseline.min(t);
            }

            cacheline::replace(cand, head);
            let mut sum: u64 = 0;
            for _ in 0..config::COLLISION_REP {
                primeprobe::prime_rev(cand, ring_len);
                let t = primeprobe::full_probe(cand, ring_len);
                sum += t as u64;
            }
            let avg = (sum / config::COLLISION_REP as u64) as u32;
            cacheline::replace(head, cand);

            if avg >= baseline.saturating_add(threshold) {
                votes += 1;
            }
            head = (*head).next;
        }
        votes >= config::collision_threshold_rotations(ring_len, associativity)
    }
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
            fatal_oom("physical-unprivileged builder: mmap failed");
        }
        ptr as *mut u8
    }
}

/// Request `2 * PAGE_SIZE`, release the second page immediately, and return
/// the first — changes the parity of subsequent allocator responses
/// relative to a plain single-page request (spec.md §4.7 step 5).
fn mmap_double_use_first() -> *mut u8 {
    unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            2 * PAGE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            fatal_oom("physical-unprivileged builder: double-page mmap failed");
        }
        let second_half = (ptr as *mut u8).add(PAGE_SIZE);
        libc::munmap(second_half as *mut libc::c_void, PAGE_SIZE);
        ptr as *mut u8
    }
}

unsafe fn munmap_page(ptr: *mut u8) {
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, PAGE_SIZE);
    }
}
