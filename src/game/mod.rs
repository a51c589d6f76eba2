//! Deterministic Game Simulation
//!
//! Everything under this module is pure simulation: no I/O, no wall-clock
//! influence on state, no unordered iteration. Given the same seed and
//! the same committed frames, every peer computes the same state hash.
//!
//! - `input`: the 16-byte wire input record, flags, validation
//! - `physics`: entities, fixed-point integration, spatial-hash collision
//! - `state`: world aggregation, snapshots, rollback, canonical hashing
//! - `frame`: per-tick input collection, commit policy, forced advance
//! - `predictor`: client-side speculation with rollback + replay

pub mod frame;
pub mod input;
pub mod physics;
pub mod predictor;
pub mod state;

pub use frame::{Frame, FrameBuffer, FrameEngine, InputBytes, MAX_FRAME_HISTORY};
pub use input::{InputError, InputValidator, PlayerInput, PlayerSlot, INPUT_SIZE, MAX_FRAME_AHEAD};
pub use physics::{Entity, EntityId};
pub use predictor::{ClientPredictor, PredictionResult};
pub use state::{GameState, StateError, StateSnapshot, StateValidator, MAX_SNAPSHOTS};
