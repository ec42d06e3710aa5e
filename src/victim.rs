//! Victim helper (spec.md §4.10).
//!
//! Builds a one-set structure via [`crate::builder::build_for_sets`] and
//! hands back a single line of it. For PHYSICAL contexts every other line of
//! that set is freed right away — each physical line lives on its own page,
//! so per-line freeing is safe and leaves only the returned line's page
//! live. For VIRTUAL contexts the lines share one block, so nothing is freed
//! until [`release_victim`].

use rand::Rng;

use crate::builder::{self, CacheStructure};
use crate::cacheline::Cacheline;
use crate::context::{Addressing, CacheContext};

/// A single line, on loan from a one-set structure, that a caller can treat
/// as "the victim's" memory for test scenarios (spec.md §8 scenarios 1-4).
pub struct Victim {
    line: *mut Cacheline,
    structure: CacheStructure,
}

impl Victim {
    /// The victim's address, to `flush`/`load` directly.
    pub fn addr(&self) -> *const u8 {
        self.line as *const u8
    }
}

/// Build a one-set structure for `target_set` and return a single line in
/// it (spec.md §4.10).
pub fn prepare_victim(ctx: &CacheContext, target_set: usize, rng: &mut impl Rng) -> Victim {
    let mut structure = builder::build_for_sets(ctx, &[target_set], rng);
    let line = structure.entry;

    if ctx.addressing == Addressing::Physical {
        // Every other line of this one set lives on its own page; free all
        // but the one we keep.
        structure = keep_only(structure, line);
    }

    Victim { line, structure }
}

/// Free every line of the one-set structure except `keep`, leaving
/// `structure`'s bookkeeping (`entry`, `num_lines`) describing just that one
/// surviving line. Only valid for physically backed structures, where each
/// line owns a distinct page.
fn keep_only(structure: CacheStructure, keep: *mut Cacheline) -> CacheStructure {
    builder::release_all_but(structure, keep)
}

/// Release a victim, choosing the freeing discipline that matches how it
/// was allocated: VIRTUAL reclaims the enclosing block (built alongside its
/// whole set), PHYSICAL reclaims the single remaining page.
pub fn release_victim(victim: Victim) {
    builder::release_set_structure(victim.structure);
}
