//! # Lockstep Multiplayer Coordinator
//!
//! Frame-synchronized multiplayer: the server collects per-player inputs
//! for a fixed-rate logical clock and broadcasts, each tick, the complete
//! input set to every room member; a deterministic simulation substrate
//! turns those broadcasts into an identical game state on every peer.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      LOCKSTEP COORDINATOR                    |
//! +--------------------------------------------------------------+
//! |  core/           - Deterministic primitives                  |
//! |  |- fixed.rs     - Q16.16 fixed-point arithmetic             |
//! |  |- rng.rs       - Deterministic LCG PRNG                    |
//! |  '- hash.rs      - Canonical MD5 state digest                |
//! |                                                              |
//! |  game/           - Simulation (deterministic)                |
//! |  |- input.rs     - 16-byte input record + validation         |
//! |  |- physics.rs   - Entities, integration, spatial grid       |
//! |  |- state.rs     - World state, snapshots, rollback          |
//! |  |- frame.rs     - Frame buffer + lockstep engine            |
//! |  '- predictor.rs - Client prediction + rollback/replay       |
//! |                                                              |
//! |  network/        - Transport edge (non-deterministic)        |
//! |  |- protocol.rs  - MessagePack envelope + vocabulary         |
//! |  |- gate.rs      - Rate/size/violation policing              |
//! |  |- room.rs      - Rooms, membership, catch-up               |
//! |  |- server.rs    - WebSocket server + tick scheduler         |
//! |  '- client.rs    - Headless client + session state machine   |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Determinism Guarantee
//!
//! `core/` and `game/` never touch floats in state-affecting paths, never
//! iterate unordered containers, and draw all randomness from the seeded
//! PRNG carried inside the game state. Given the same seed and the same
//! committed frames, every peer computes the same canonical state hash.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

pub use crate::core::fixed::{Fixed, FixedPoint, FIXED_ONE};
pub use crate::core::rng::SeededRng;
pub use crate::game::frame::{Frame, FrameEngine};
pub use crate::game::input::{InputValidator, PlayerInput, PlayerSlot};
pub use crate::game::predictor::ClientPredictor;
pub use crate::game::state::GameState;
pub use crate::network::client::GameClient;
pub use crate::network::server::{GameServer, ServerConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logical simulation rate (Hz).
pub const TICK_RATE: u32 = 30;

/// Milliseconds per logical tick, as integer division of the rate.
pub const FRAME_TIME_MS: i32 = (1000 / TICK_RATE) as i32;
