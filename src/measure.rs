//! Measurement helpers built on [`arch`] (spec.md §6 API surface:
//! `is_cached`, `clear_cache`, `prepare_measurement`).

use crate::arch;
use crate::config::PROCESSOR_FREQ;
use crate::context::CacheContext;

/// True if `p` answers within `ctx.access_time` cycles of the cached
/// threshold, after subtracting the context's cached measurement overhead
/// (spec.md §8: false right after `flush`, true after two back-to-back
/// loads).
pub fn is_cached(ctx: &CacheContext, p: *const u8) -> bool {
    let raw = unsafe { arch::access_time(p) };
    let corrected = raw.saturating_sub(ctx.overhead);
    corrected < ctx.access_time
}

/// Evict an entire cache level's worth of attacker-controlled memory, to
/// reset to a known state between trials. Walks a throwaway buffer sized to
/// `ctx.cache_bytes` one line at a time and `clflush`es it, which is
/// sufficient to guarantee nothing from this buffer remains resident —
/// `ctx` names a level, not a live structure, so there is no ring to prime
/// instead.
pub fn clear_cache(ctx: &CacheContext) {
    let mut scratch = vec![0u8; ctx.cache_bytes];
    let mut i = 0;
    while i < scratch.len() {
        scratch[i] = 1;
        unsafe {
            arch::flush(scratch.as_ptr().add(i));
        }
        i += ctx.line_size;
    }
    arch::mfence();
}

/// Busy-loop for roughly `2 * PROCESSOR_FREQ` cycles, then take 200
/// throwaway `start_timer`/`stop_timer` pairs, so the CPU's frequency
/// governor has settled at its top state before real measurement begins
/// (spec.md §6).
pub fn prepare_measurement() {
    let target = 2 * PROCESSOR_FREQ;
    let mut elapsed: u64 = 0;
    while elapsed < target {
        let t0 = arch::start_timer();
        arch::nop_slide();
        elapsed += arch::stop_timer(t0) as u64;
    }
    for _ in 0..200 {
        let t = arch::start_timer();
        let _ = arch::stop_timer(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Level;

    #[test]
    fn is_cached_is_true_right_after_two_loads() {
        let ctx = CacheContext::new(Level::L1);
        let mut buf = [0u8; 64];
        let p = buf.as_mut_ptr();
        unsafe {
            arch::flush(p);
        }
        arch::mfence();
        unsafe {
            arch::load(p);
            arch::load(p);
        }
        assert!(is_cached(&ctx, p));
    }

    #[test]
    fn clear_cache_does_not_panic_for_l1() {
        let ctx = CacheContext::new(Level::L1);
        clear_cache(&ctx);
    }
}
