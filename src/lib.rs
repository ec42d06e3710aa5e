//! # cache-prime-probe
//!
//! Prime+Probe primitives for the x86-64 L1 and L2 data caches: build an
//! eviction structure that covers the sets you name, prime it, let a victim
//! run, probe it, and read off per-set timing.
//!
//! ## Quick start
//!
//! ```no_run
//! use cache_prime_probe::{CacheContext, Level, builder, primeprobe};
//! use rand::rng;
//!
//! let ctx = CacheContext::new(Level::L1);
//! let mut rng = rng();
//! let structure = builder::build(&ctx, &mut rng);
//!
//! let mut entry = structure.entry;
//! unsafe {
//!     entry = primeprobe::prime(entry, structure.num_lines);
//!     primeprobe::probe(entry, structure.num_lines, ctx.associativity);
//! }
//!
//! let mut set_timings = vec![0u32; ctx.sets];
//! unsafe { primeprobe::set_times(structure.entry, structure.num_lines, &mut set_timings) };
//!
//! builder::release(structure);
//! ```
//!
//! ## Architecture
//!
//! Context → Builder (virtual / physical-privileged / physical-unprivileged)
//! → Topology → Prime/Probe → Extraction.
//!
//! Every structure is an intrusive cyclic doubly-linked list of 64-byte
//! records, one per hardware cache line, stitched into one ring: within a
//! set the lines cycle among themselves, and the sets themselves are chained
//! in a randomised order (see [`topology`]). The three builders differ only
//! in how they discover which backing memory maps to which set; all three
//! hand their raw (line, set) pairs to the same [`topology::assemble`].
//!
//! This library never recovers a victim's actual secret — it reports
//! relative cache-set timing only. It is explicitly not thread-safe: the
//! prime/probe primitives and every builder assume a single pinned logical
//! CPU (see [`affinity`]) and no concurrent access to the structures they
//! build.

pub mod affinity;
pub mod arch;
pub mod builder;
pub mod cacheline;
pub mod config;
pub mod context;
pub mod error;
pub mod measure;
pub mod primeprobe;
pub mod topology;
pub mod translate;
pub mod victim;

pub use arch::{access_time, access_time_overhead};
pub use builder::{release, release_set_structure, CacheStructure};
pub use cacheline::{Cacheline, Flags};
pub use context::{release_context, Addressing, CacheContext, Level};
pub use measure::{clear_cache, is_cached, prepare_measurement};
pub use primeprobe::{full_probe, per_line_times, per_set_sum, prime, prime_rev, probe, set_times};
pub use victim::{prepare_victim, release_victim, Victim};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
