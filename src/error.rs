//! Fatal-error helpers.
//!
//! Per spec.md §7, measurement paths never return error codes — branching on
//! a `Result` in the middle of a primed structure would itself perturb the
//! timing it is trying to measure. Out-of-resources, structural, and
//! caller-misuse failures are all unrecoverable here; they abort with a
//! consistent message instead of being threaded through `Result`.
//!
//! The one genuinely fallible, non-measurement path is address translation
//! (spec.md §4.2, §7(b)), which returns `Option`/`bool` and is handled by
//! [`crate::builder::build`] picking a different construction strategy.

/// Abort due to resource exhaustion (allocation failure, pagemap open
/// failure). Unrecoverable per spec.md §7(a).
#[track_caller]
pub fn fatal_oom(what: &str) -> ! {
    panic!("cache_prime_probe: out of resources: {what}")
}

/// Abort because a built structure failed its sanity check (spec.md §4.5
/// step 5, §7(c)) — every set must end up with exactly `associativity`
/// lines. Indicates a geometry misconfiguration in `config`, not a runtime
/// condition a caller can recover from.
#[track_caller]
pub fn fatal_structural(what: &str) -> ! {
    panic!("cache_prime_probe: structural invariant violated: {what}")
}

/// Abort on caller misuse (unknown cache level, out-of-range set list,
/// privilege probe succeeded at open time but a later translation failed).
#[track_caller]
pub fn fatal_misuse(what: &str) -> ! {
    panic!("cache_prime_probe: misuse: {what}")
}
