//! Deterministic Random Number Generator
//!
//! Linear congruential generator (Numerical Recipes constants) with a
//! single 32-bit state word. Given the same seed it produces the identical
//! sequence on every platform, and the state is small enough to ride along
//! in every snapshot.

use serde::{Deserialize, Serialize};

/// LCG multiplier
const MULTIPLIER: u32 = 1_664_525;

/// LCG increment
const INCREMENT: u32 = 1_013_904_223;

/// Deterministic PRNG with snapshottable 32-bit state.
///
/// # Determinism Guarantee
///
/// Advancing is `s <- s * 1664525 + 1013904223 (mod 2^32)`; pure integer
/// arithmetic, so the stream is identical on every conforming platform.
/// Callers that need cross-platform agreement must draw through the
/// integer [`range`](Self::range), not [`uniform`](Self::uniform).
///
/// # Example
///
/// ```
/// use lockstep::core::rng::SeededRng;
///
/// let mut a = SeededRng::new(12345);
/// let mut b = SeededRng::new(12345);
/// assert_eq!(a.next_uint32(), b.next_uint32());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededRng {
    state: u32,
}

impl SeededRng {
    /// Create a new generator. A zero seed is remapped to 1 so that
    /// distinct "unseeded" constructions still share one canonical stream.
    pub fn new(seed: u32) -> Self {
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Advance and return the next 32-bit value (the post-advance state).
    #[inline]
    pub fn next_uint32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT);
        self.state
    }

    /// Advance and return a signed 32-bit value.
    #[inline]
    pub fn next_int(&mut self) -> i32 {
        self.next_uint32().wrapping_sub(0x8000_0000) as i32
    }

    /// Random integer in the inclusive range `[min, max]`.
    #[inline]
    pub fn range(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        let span = (max as i64 - min as i64 + 1) as u64;
        (min as i64 + (self.next_uint32() as u64 % span) as i64) as i32
    }

    /// Random float in `[0, 1]`.
    ///
    /// Deterministic given the state, but float results must never feed
    /// back into simulation state; use [`range`](Self::range) there.
    #[inline]
    pub fn uniform(&mut self) -> f64 {
        self.next_uint32() as f64 / u32::MAX as f64
    }

    /// Random float in `[min, max]`.
    #[inline]
    pub fn uniform_range(&mut self, min: f64, max: f64) -> f64 {
        min + self.uniform() * (max - min)
    }

    /// Return true with the given probability in `[0, 1]`.
    #[inline]
    pub fn chance(&mut self, probability: f64) -> bool {
        self.uniform() < probability
    }

    /// Pick a random element from a slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let index = self.range(0, items.len() as i32 - 1) as usize;
        Some(&items[index])
    }

    /// Fisher-Yates shuffle in place, descending index order, each swap
    /// index drawn from `range(0, i)`.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.range(0, i as i32) as usize;
            items.swap(i, j);
        }
    }

    /// Current state, for inclusion in snapshots.
    #[inline]
    pub fn state(&self) -> u32 {
        self.state
    }

    /// Restore a previously captured state verbatim.
    ///
    /// No zero remap here: a restored state must reproduce the exact
    /// sequence the snapshot interrupted.
    #[inline]
    pub fn set_state(&mut self, state: u32) {
        self.state = state;
    }
}

impl Default for SeededRng {
    fn default() -> Self {
        Self::new(0)
    }
}
