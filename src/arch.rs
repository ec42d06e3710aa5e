//! x86-64 architecture primitives: serialisation, flush, load/store, and the
//! cycle-counter timer pair.
//!
//! Every primitive here is `#[inline(always)]` and built on `std::arch::asm!`
//! so the measured region has no call/return overhead and no register spill
//! across its boundary (spec.md §4.1, §9 "inline assembly and unrolled probe
//! loops"). Do not add logging, bounds checks, or anything else that could
//! appear between a `start_timer`/`stop_timer` pair — that is exactly the
//! noise this module exists to avoid.

use std::arch::asm;

/// Evict the cache line containing `p` from all cache levels.
#[inline(always)]
pub unsafe fn flush(p: *const u8) {
    unsafe {
        asm!("clflush [{p}]", p = in(reg) p, options(nostack, preserves_flags));
    }
}

/// Issue a single 8-byte load from `p`.
#[inline(always)]
pub unsafe fn load(p: *const u8) {
    unsafe {
        let _val: u64;
        asm!(
            "mov {val}, [{p}]",
            p = in(reg) p,
            val = out(reg) _val,
            options(nostack, preserves_flags, readonly),
        );
    }
}

/// Issue a single 8-byte increment at `p`.
#[inline(always)]
pub unsafe fn inc(p: *mut u8) {
    unsafe {
        asm!("add qword ptr [{p}], 1", p = in(reg) p, options(nostack));
    }
}

/// Full memory fence.
#[inline(always)]
pub fn mfence() {
    unsafe {
        asm!("mfence", options(nostack, preserves_flags));
    }
}

/// Load fence.
#[inline(always)]
pub fn lfence() {
    unsafe {
        asm!("lfence", options(nostack, preserves_flags));
    }
}

/// Store fence.
#[inline(always)]
pub fn sfence() {
    unsafe {
        asm!("sfence", options(nostack, preserves_flags));
    }
}

/// Serialising `cpuid` (clobbers eax/ebx/ecx/edx, leaf 0).
#[inline(always)]
pub fn cpuid() {
    unsafe {
        asm!(
            "mov eax, 0",
            "cpuid",
            out("eax") _, out("ebx") _, out("ecx") _, out("edx") _,
            options(nostack, preserves_flags),
        );
    }
}

/// A handful of no-ops to drain the pipeline before a timestamp.
#[inline(always)]
pub fn nop_slide() {
    unsafe {
        asm!("nop", "nop", "nop", "nop", "nop", options(nostack, preserves_flags, nomem));
    }
}

/// Opaque timestamp produced by [`start_timer`]. Only the low 32 bits of
/// `rdtsc` are kept, matching the source's reserved-register convention
/// (spec.md §4.1).
#[derive(Clone, Copy)]
pub struct Timestamp(u32);

/// `cpuid; rdtsc` — serialise, then timestamp. The `cpuid` before `rdtsc`
/// prevents prior instructions from executing after the timestamp is taken.
#[inline(always)]
pub fn start_timer() -> Timestamp {
    cpuid();
    let lo: u32;
    unsafe {
        asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") _,
            options(nostack, preserves_flags, nomem),
        );
    }
    Timestamp(lo)
}

/// `rdtscp; cpuid` — timestamp, then serialise. `rdtscp` itself partially
/// serialises before reading the counter; the trailing `cpuid` additionally
/// prevents the CPU from hoisting subsequent work into the measured region.
/// Returns the 32-bit difference from `prev`.
#[inline(always)]
pub fn stop_timer(prev: Timestamp) -> u32 {
    let hi: u32;
    unsafe {
        asm!(
            "rdtscp",
            out("eax") hi,
            out("edx") _,
            out("ecx") _,
            options(nostack, preserves_flags, nomem),
        );
    }
    cpuid();
    hi.wrapping_sub(prev.0)
}

/// Serialise, timestamp, touch `p`, serialise, timestamp, subtract.
#[inline(always)]
pub unsafe fn access_time(p: *const u8) -> u32 {
    nop_slide();
    let t0 = start_timer();
    unsafe {
        load(p);
    }
    stop_timer(t0)
}

/// Same shape as [`access_time`] but with no memory touch — used to compute
/// `access_time(p) - access_time_overhead()` so the fixed measurement
/// overhead (~30 cycles, spec.md §4.9) cancels out.
#[inline(always)]
pub fn access_time_overhead() -> u32 {
    nop_slide();
    let t0 = start_timer();
    stop_timer(t0)
}
