//! L1 single-eviction demo: prime a structure covering every L1 set, let a
//! victim line sit in set 33, probe, and show that set's timing stands out.
//!
//! Run: `cargo run --bin single-eviction-demo`

use cache_prime_probe::{builder, measure, primeprobe, CacheContext, Level};
use rand::rng;

const TARGET_SET: usize = 33;
const ROUNDS: usize = 2_000;

fn main() {
    env_logger::init();

    if !cache_prime_probe::affinity::pin_to_cpu(0) {
        eprintln!("warning: could not pin to CPU 0, timings may be noisy");
    }

    let ctx = CacheContext::new(Level::L1);
    let mut rng = rng();
    let structure = builder::build(&ctx, &mut rng);
    let victim = cache_prime_probe::prepare_victim(&ctx, TARGET_SET, &mut rng);

    measure::prepare_measurement();

    let mut sums = vec![0u64; ctx.sets];
    let mut entry = structure.entry;
    for _ in 0..ROUNDS {
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

    let means: Vec<f64> = sums.iter().map(|&s| s as f64 / ROUNDS as f64).collect();
    let target_mean = means[TARGET_SET];
    let other_mean = {
        let total: f64 = means
            .iter()
            .enumerate()
            .filter(|&(s, _)| s != TARGET_SET)
            .map(|(_, m)| m)
            .sum();
        total / (ctx.sets - 1) as f64
    };

    println!("target set {TARGET_SET} mean timing: {target_mean:.1} cycles");
    println!("other sets' mean timing:  {other_mean:.1} cycles");
    println!("separation: {:.1} cycles", target_mean - other_mean);

    cache_prime_probe::release_victim(victim);
    builder::release(structure);
}
