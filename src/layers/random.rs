//! Per-slot pseudorandom generator states.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// One generator per max-batch slot.
///
/// Each slot is seeded independently from the caller's seed and the slot
/// index, so a sequence draws the same numbers whichever dense position it
/// occupies. States persist across steps and are only replaced by `seed`.
#[derive(Debug, Clone)]
pub struct GeneratorStates<R = StdRng> {
    states: Vec<R>,
    draws: Vec<u64>,
}

impl<R: RngCore + SeedableRng> GeneratorStates<R> {
    /// Create `max_batch_size` states seeded with zero.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            states: (0..max_batch_size).map(|slot| R::seed_from_u64(slot_seed(0, slot))).collect(),
            draws: vec![0; max_batch_size],
        }
    }

    /// Reseed one slot and clear its draw counter.
    pub fn seed(&mut self, slot: usize, seed: u64) {
        self.states[slot] = R::seed_from_u64(slot_seed(seed, slot));
        self.draws[slot] = 0;
    }

    /// Draw a uniform value in `[0, 1)` from a slot.
    pub fn uniform(&mut self, slot: usize) -> f32 {
        self.draws[slot] += 1;
        self.states[slot].gen::<f32>()
    }

    /// Number of draws a slot made since it was last seeded.
    pub fn draws(&self, slot: usize) -> u64 {
        self.draws[slot]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// splitmix64 over seed and slot, so neighbouring slots get unrelated streams.
fn slot_seed(seed: u64, slot: usize) -> u64 {
    let mut z = seed ^ (slot as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
