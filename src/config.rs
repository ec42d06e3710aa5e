//! Compile-time cache geometry and timing constants.
//!
//! These are deliberately `const`, not a runtime-constructed config struct:
//! the cache geometry of the machine this crate is built for is fixed at
//! compile time (spec non-goal: "correct operation on caches whose geometry
//! differs from the compile-time-configured values" is out of scope). Update
//! these constants and rebuild to target a different machine.

/// Size of one hardware page on the target (4 KiB on x86-64).
pub const PAGE_SIZE: usize = 4096;

/// Size of one hardware cache line.
pub const CACHELINE_SIZE: usize = 64;

/// Number of cache sets whose index bits live entirely within one page
/// offset — every line of one physical page lands in a different member of
/// one cache group.
pub const CACHE_GROUP_SIZE: usize = PAGE_SIZE / CACHELINE_SIZE;

/// L1 data cache geometry. Virtually addressed: its index bits lie inside
/// the page offset, so virtual and physical set index agree.
pub mod l1 {
    pub const SETS: usize = 64;
    pub const ASSOCIATIVITY: usize = 8;
    /// Cycle threshold below which an access is a hit.
    pub const ACCESS_TIME: u32 = 4;
}

/// L2 data cache geometry. Physically addressed.
pub mod l2 {
    pub const SETS: usize = 1024;
    pub const ASSOCIATIVITY: usize = 8;
    pub const ACCESS_TIME: u32 = 12;
}

/// L3 access time, used only to derive the collision threshold the
/// unprivileged builder needs (spec.md §4.7).
pub const L3_ACCESS_TIME: u32 = 40;

/// Repetitions per collision test rotation (spec.md §4.7).
pub const COLLISION_REP: usize = 100;

/// Approximate processor frequency in Hz, used to size the
/// [`crate::measure::prepare_measurement`] warm-up busy loop.
pub const PROCESSOR_FREQ: u64 = 3_000_000_000;

/// Minimum fraction of collision-positive rotations (out of `len -
/// associativity + 1` required, per spec.md §4.7) needed to declare a whole
/// ring collided with a candidate.
pub fn collision_threshold_rotations(ring_len: usize, associativity: usize) -> usize {
    ring_len.saturating_sub(associativity).saturating_add(1)
}
