//! Core deterministic primitives.
//!
//! Everything in this module is pure integer arithmetic designed for
//! perfect cross-platform determinism. The simulation in `game/` is built
//! entirely on these types.

pub mod fixed;
pub mod hash;
pub mod rng;

pub use fixed::{Fixed, FixedError, FixedPoint, FIXED_HALF, FIXED_ONE, FIXED_SHIFT};
pub use hash::{derive_room_seed, CanonicalHasher};
pub use rng::SeededRng;
