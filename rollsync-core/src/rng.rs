// Every party owns a thread local generator. Workers reseed it with `seed + rank` on startup, so
// environment reset seeds and decorrelation offsets are reproducible per worker.

use rand::{Rng, SeedableRng, rngs::StdRng};
use std::cell::RefCell;

thread_local! {
    pub static RNG: RefCell<StdRng> = RefCell::new(StdRng::seed_from_u64(0));
}

pub fn reseed(seed: u64) {
    RNG.with_borrow_mut(|rng| *rng = StdRng::seed_from_u64(seed));
}

pub fn next_seed() -> u64 {
    RNG.with_borrow_mut(|rng| rng.random::<u64>())
}

/// Fresh seed for a sampler that was configured without one.
pub fn make_seed() -> u64 {
    rand::random::<u32>() as u64
}
