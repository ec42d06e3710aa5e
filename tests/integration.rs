//! End-to-end scenarios for the Prime+Probe core.
//!
//! Most of these pin the current thread to CPU 0 and run thousands of
//! primed rounds, so they are `#[ignore]`d by default: they take seconds
//! and are sensitive to whatever else is running on the machine. Run with:
//! `cargo test -- --ignored`.

use cache_prime_probe::{
    affinity, builder, measure, primeprobe, CacheContext, Level,
};
use rand::{rng, SeedableRng};
use rand::rngs::StdRng;

fn pin_or_warn() {
    if !affinity::pin_to_cpu(0) {
        eprintln!("warning: could not pin to CPU 0; timing scenarios may be noisy");
    }
}

/// Mean cycles for `target_set` versus the mean of every other set, over
/// `rounds` prime/victim-touch/probe rounds against an already-built
/// structure and victim.
fn measure_separation(
    ctx: &CacheContext,
    structure: &builder::CacheStructure,
    victim: &cache_prime_probe::Victim,
    target_set: usize,
    rounds: usize,
) -> (f64, f64) {
    measure::prepare_measurement();

    let mut sums = vec![0u64; ctx.sets];
    let mut entry = structure.entry;
    for _ in 0..rounds {
        unsafe {
            entry = primeprobe::prime(entry, structure.num_lines);
            cache_prime_probe::arch::load(victim.addr());
            primeprobe::probe(entry, structure.num_lines, ctx.associativity);
        }
        let mut set_timings = vec![0u32; ctx.sets];
        unsafe { primeprobe::set_times(structure.entry, structure.num_lines, &mut set_timings) };
        for (s, t) in set_timings.iter().enumerate() {
            sums[s] += *t as u64;
        }
    }

    let means: Vec<f64> = sums.iter().map(|&s| s as f64 / rounds as f64).collect();
    let target_mean = means[target_set];
    let other_mean = {
        let total: f64 = means
            .iter()
            .enumerate()
            .filter(|&(s, _)| s != target_set)
            .map(|(_, m)| m)
            .sum();
        total / (ctx.sets - 1) as f64
    };
    (target_mean, other_mean)
}

/// Same as [`measure_separation`], but builds the eviction structure and
/// victim first via the normal (privilege-dispatching) public API.
fn separation(ctx: &CacheContext, target_set: usize, rounds: usize) -> (f64, f64) {
    pin_or_warn();
    let mut rng = rng();
    let structure = builder::build(ctx, &mut rng);
    let victim = cache_prime_probe::prepare_victim(ctx, target_set, &mut rng);

    let result = measure_separation(ctx, &structure, &victim, target_set, rounds);

    cache_prime_probe::release_victim(victim);
    builder::release(structure);
    result
}

#[test]
#[ignore]
fn scenario_1_l1_single_eviction() {
    let ctx = CacheContext::new(Level::L1);
    let (target, other) = separation(&ctx, 33, 10_000);
    assert!(
        target - other >= 1.0,
        "set 33 mean ({target:.1}) did not stand out from other sets' mean ({other:.1})"
    );
}

#[test]
#[ignore]
fn scenario_2_l2_single_eviction_privileged() {
    if !cache_prime_probe::translate::can_translate() {
        eprintln!("skipping: no pagemap privilege on this host");
        return;
    }
    let ctx = CacheContext::new(Level::L2);
    let (target, other) = separation(&ctx, 100, 10_000);
    assert!(target - other >= 1.0);
}

#[test]
#[ignore]
fn scenario_3_l2_single_eviction_unprivileged() {
    // Forces the unprivileged builder directly (rather than `builder::build`,
    // which would pick it automatically only in the absence of privilege) so
    // this scenario always exercises `phys_unpriv` regardless of what the
    // test host happens to grant.
    pin_or_warn();
    let ctx = CacheContext::new(Level::L2);
    let target_set = 100usize;
    let mut rng = rng();

    let all_sets: Vec<usize> = (0..ctx.sets).collect();
    let structure = builder::phys_unpriv::build(&ctx, &all_sets, &mut rng);
    assert_eq!(structure.num_lines, ctx.sets * ctx.associativity);
    unsafe {
        assert!(cache_prime_probe::topology::sanity_check(
            structure.entry,
            structure.num_lines,
            ctx.associativity
        ));
    }

    let victim = cache_prime_probe::prepare_victim(&ctx, target_set, &mut rng);
    let (target, other) = measure_separation(&ctx, &structure, &victim, target_set, 10_000);
    assert!(
        target - other >= 1.0,
        "unprivileged structure: set {target_set} mean ({target:.1}) did not stand \
         out from other sets' mean ({other:.1})"
    );

    cache_prime_probe::release_victim(victim);
    builder::release(structure);
}

#[test]
#[ignore]
fn scenario_4_victim_on_non_target_set_does_nothing() {
    pin_or_warn();
    let ctx = CacheContext::new(Level::L1);
    let mut rng = rng();
    let structure = builder::build(&ctx, &mut rng);
    let victim = cache_prime_probe::prepare_victim(&ctx, 33, &mut rng);
    measure::prepare_measurement();

    let rounds = 10_000;
    let mut sums = vec![0u64; ctx.sets];
    let mut entry = structure.entry;
    for _ in 0..rounds {
        // No victim touch between prime and probe.
        unsafe {
            entry = primeprobe::prime(entry, structure.num_lines);
            primeprobe::probe(entry, structure.num_lines, ctx.associativity);
        }
        let mut set_timings = vec![0u32; ctx.sets];
        unsafe { primeprobe::set_times(structure.entry, structure.num_lines, &mut set_timings) };
        for (s, t) in set_timings.iter().enumerate() {
            sums[s] += *t as u64;
        }
    }

    let means: Vec<f64> = sums.iter().map(|&s| s as f64 / rounds as f64).collect();
    let global_mean = means.iter().sum::<f64>() / means.len() as f64;
    let variance =
        means.iter().map(|m| (m - global_mean).powi(2)).sum::<f64>() / means.len() as f64;
    let two_sigma = 2.0 * variance.sqrt();

    for (s, m) in means.iter().enumerate() {
        assert!(
            *m <= global_mean + two_sigma,
            "set {s} mean {m:.1} exceeded global mean {global_mean:.1} by more than 2 sigma ({two_sigma:.1})"
        );
    }

    cache_prime_probe::release_victim(victim);
    builder::release(structure);
}

#[test]
fn scenario_5_partial_set_list() {
    let ctx = CacheContext::new(Level::L1);
    let wanted = [7usize, 23, 39, 55];
    let mut rng = StdRng::seed_from_u64(5);
    let structure = builder::build_for_sets(&ctx, &wanted, &mut rng);

    assert_eq!(structure.num_lines, wanted.len() * ctx.associativity);

    let mut seen_sets = std::collections::HashSet::new();
    let mut cur = structure.entry;
    for _ in 0..structure.num_lines {
        unsafe {
            seen_sets.insert((*cur).set_index as usize);
            cur = (*cur).next;
        }
    }
    assert_eq!(cur, structure.entry, "ring did not close in exactly num_lines steps");
    assert_eq!(seen_sets, wanted.iter().copied().collect());

    builder::release(structure);
}

#[test]
fn scenario_6_sanity_check_detects_injected_corruption() {
    let ctx = CacheContext::new(Level::L1);
    let mut rng = StdRng::seed_from_u64(6);
    let structure = builder::build(&ctx, &mut rng);

    assert_eq!(
        unsafe { cache_prime_probe::cacheline::length(structure.entry) },
        structure.num_lines
    );

    // Unlink one line.
    let survivor = unsafe { (*structure.entry).next };
    unsafe { cache_prime_probe::cacheline::remove(structure.entry) };

    assert_ne!(
        unsafe { cache_prime_probe::cacheline::length(survivor) },
        structure.num_lines
    );

    builder::release(structure);
}
