//! CPU pinning.
//!
//! Pinning the current thread to one logical CPU is a precondition for
//! meaningful measurements (spec.md §5), not something the core enforces —
//! the attacker is expected to call [`pin_to_cpu`] before priming. This
//! mirrors how the teacher treats `libc` syscalls as a thin, single-purpose
//! wrapper (`sources::frontier::tlb_shootdown`'s `libc::mmap`/`mprotect`)
//! rather than hiding them behind an abstraction layer.

use std::mem::{size_of, MaybeUninit};

/// Pin the calling thread to logical CPU `cpu`. Returns `false` if `cpu` is
/// outside the range `cpu_set_t` can represent, or if the underlying
/// `sched_setaffinity` call failed.
pub fn pin_to_cpu(cpu: usize) -> bool {
    if cpu >= libc::CPU_SETSIZE as usize {
        return false;
    }
    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed().assume_init();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
        rc == 0
    }
}

/// Number of logical CPUs visible to this process.
pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 { 1 } else { n as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_to_current_cpu_succeeds() {
        assert!(num_cpus() >= 1);
        // Pinning to CPU 0 should always be possible in CI/test sandboxes.
        assert!(pin_to_cpu(0));
    }

    #[test]
    fn pin_to_out_of_range_cpu_fails() {
        assert!(!pin_to_cpu(num_cpus() + 4096));
    }
}
