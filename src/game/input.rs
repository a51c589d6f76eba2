//! Player Input Record and Validation
//!
//! The input record is a fixed 16-byte little-endian wire layout:
//!
//! ```text
//! offset  size  field
//! 0       4     frame_id   (u32)
//! 4       2     player_id  (u16)
//! 6       1     flags      (u8)
//! 7       1     reserved   (zero)
//! 8       4     target_x   (i32, Q16.16 raw)
//! 12      4     target_y   (i32, Q16.16 raw)
//! ```
//!
//! The layout is a wire contract shared with every peer, so serialization
//! is hand-rolled rather than derived.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::fixed::{from_int, Fixed};

/// Exact serialized size of one input, in bytes.
pub const INPUT_SIZE: usize = 16;

/// Frames a client may submit ahead of the current frame.
pub const MAX_FRAME_AHEAD: u32 = 100;

/// Largest accepted |target| coordinate (10000 px in Q16.16).
pub const MAX_TARGET_COORD: Fixed = from_int(10_000);

/// Numeric player slot inside a room, as carried on the wire.
pub type PlayerSlot = u16;

/// Input handling errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    /// Wrong serialized length.
    #[error("malformed input: expected {INPUT_SIZE} bytes, got {0}")]
    MalformedInput(usize),

    /// Frame id outside the admission window.
    #[error("frame {frame_id} outside window [{current}, {current}+{MAX_FRAME_AHEAD})")]
    FrameOutOfWindow {
        /// Submitted frame id.
        frame_id: u32,
        /// Engine's current frame at validation time.
        current: u32,
    },

    /// Target coordinates out of the world range.
    #[error("target ({0}, {1}) out of range")]
    TargetOutOfRange(Fixed, Fixed),

    /// Embedded player id does not match the submitting connection.
    #[error("player id mismatch: got {got}, expected {expected}")]
    PlayerIdMismatch {
        /// Id embedded in the input.
        got: PlayerSlot,
        /// Id of the submitting connection.
        expected: PlayerSlot,
    },

    /// Flag bits outside the defined set.
    #[error("undefined flag bits: {0:#04x}")]
    UndefinedFlags(u8),
}

/// A single player's input for one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInput {
    /// Tick this input is for.
    pub frame_id: u32,
    /// Numeric player slot.
    pub player_id: PlayerSlot,
    /// Action bit flags.
    pub flags: u8,
    /// Target X (Q16.16 raw).
    pub target_x: Fixed,
    /// Target Y (Q16.16 raw).
    pub target_y: Fixed,
}

impl PlayerInput {
    /// Move up flag
    pub const MOVE_UP: u8 = 0x01;
    /// Move down flag
    pub const MOVE_DOWN: u8 = 0x02;
    /// Move left flag
    pub const MOVE_LEFT: u8 = 0x04;
    /// Move right flag
    pub const MOVE_RIGHT: u8 = 0x08;
    /// Attack flag
    pub const ATTACK: u8 = 0x10;
    /// First skill flag
    pub const SKILL_1: u8 = 0x20;
    /// Second skill flag
    pub const SKILL_2: u8 = 0x40;
    /// Jump flag
    pub const JUMP: u8 = 0x80;

    /// Union of every defined flag bit.
    pub const FLAG_MASK: u8 = Self::MOVE_UP
        | Self::MOVE_DOWN
        | Self::MOVE_LEFT
        | Self::MOVE_RIGHT
        | Self::ATTACK
        | Self::SKILL_1
        | Self::SKILL_2
        | Self::JUMP;

    /// Create a new input with no flags and zero targets.
    pub const fn new(frame_id: u32, player_id: PlayerSlot) -> Self {
        Self {
            frame_id,
            player_id,
            flags: 0,
            target_x: 0,
            target_y: 0,
        }
    }

    /// The deterministic empty input used when a player's tick is filled
    /// in for them (forced frames, prediction fallback).
    pub const fn empty(frame_id: u32, player_id: PlayerSlot) -> Self {
        Self::new(frame_id, player_id)
    }

    /// Check a flag.
    #[inline]
    pub const fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Set a flag.
    #[inline]
    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    /// Clear a flag.
    #[inline]
    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    /// Movement direction as unit axis components `(dx, dy)`.
    /// Up is negative Y, matching screen coordinates.
    pub const fn direction(&self) -> (i32, i32) {
        let mut dx = 0;
        let mut dy = 0;
        if self.has_flag(Self::MOVE_UP) {
            dy = -1;
        }
        if self.has_flag(Self::MOVE_DOWN) {
            dy = 1;
        }
        if self.has_flag(Self::MOVE_LEFT) {
            dx = -1;
        }
        if self.has_flag(Self::MOVE_RIGHT) {
            dx = 1;
        }
        (dx, dy)
    }

    /// Serialize into the fixed 16-byte little-endian layout.
    pub fn serialize(&self) -> [u8; INPUT_SIZE] {
        let mut out = [0u8; INPUT_SIZE];
        out[0..4].copy_from_slice(&self.frame_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.player_id.to_le_bytes());
        out[6] = self.flags;
        // out[7] stays zero (reserved)
        out[8..12].copy_from_slice(&self.target_x.to_le_bytes());
        out[12..16].copy_from_slice(&self.target_y.to_le_bytes());
        out
    }

    /// Deserialize from exactly 16 bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, InputError> {
        if data.len() != INPUT_SIZE {
            return Err(InputError::MalformedInput(data.len()));
        }

        let mut u32buf = [0u8; 4];
        let mut u16buf = [0u8; 2];

        u32buf.copy_from_slice(&data[0..4]);
        let frame_id = u32::from_le_bytes(u32buf);
        u16buf.copy_from_slice(&data[4..6]);
        let player_id = u16::from_le_bytes(u16buf);
        let flags = data[6];
        u32buf.copy_from_slice(&data[8..12]);
        let target_x = i32::from_le_bytes(u32buf);
        u32buf.copy_from_slice(&data[12..16]);
        let target_y = i32::from_le_bytes(u32buf);

        Ok(Self {
            frame_id,
            player_id,
            flags,
            target_x,
            target_y,
        })
    }
}

/// Validates decoded inputs against the submitting connection's context.
///
/// Rejected inputs are dropped by the caller and counted as violations;
/// the validator itself is stateless.
#[derive(Debug, Clone, Copy)]
pub struct InputValidator {
    /// How far ahead of the current frame submissions are accepted.
    pub max_frame_ahead: u32,
    /// Largest accepted |target| coordinate.
    pub max_target_coord: Fixed,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self {
            max_frame_ahead: MAX_FRAME_AHEAD,
            max_target_coord: MAX_TARGET_COORD,
        }
    }
}

impl InputValidator {
    /// Validate an input against `(current_frame, expected_player)`.
    pub fn validate(
        &self,
        input: &PlayerInput,
        current_frame: u32,
        expected_player: PlayerSlot,
    ) -> Result<(), InputError> {
        if input.frame_id < current_frame
            || input.frame_id >= current_frame.saturating_add(self.max_frame_ahead)
        {
            return Err(InputError::FrameOutOfWindow {
                frame_id: input.frame_id,
                current: current_frame,
            });
        }

        if input.target_x.saturating_abs() > self.max_target_coord
            || input.target_y.saturating_abs() > self.max_target_coord
        {
            return Err(InputError::TargetOutOfRange(input.target_x, input.target_y));
        }

        if input.player_id != expected_player {
            return Err(InputError::PlayerIdMismatch {
                got: input.player_id,
                expected: expected_player,
            });
        }

        if input.flags & !PlayerInput::FLAG_MASK != 0 {
            return Err(InputError::UndefinedFlags(input.flags));
        }

        Ok(())
    }
}
