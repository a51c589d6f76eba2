//! Wire Protocol
//!
//! Every transport payload is one MessagePack envelope of the form
//! `{type: string, payload: map}`. Serde's adjacent tagging produces
//! exactly that shape; `rmp_serde::to_vec_named` keeps struct fields as
//! string keys so the encoding stays self-describing. Input blobs travel
//! as msgpack byte strings via `serde_bytes`.
//!
//! Unknown `type` tags fail decoding and the message is dropped as a
//! malformed envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::game::frame::Frame;
use crate::game::input::{PlayerSlot, INPUT_SIZE};
use crate::game::state::GameState;

/// Upper bound on one transport message.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024;

/// WebSocket close codes used by the coordinator.
pub mod close_code {
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4001;
    /// No auth message within the deadline.
    pub const AUTH_TIMEOUT: u16 = 4002;
    /// Sustained rate-limit breach.
    pub const RATE_LIMITED: u16 = 4003;
    /// Room is at capacity.
    pub const ROOM_FULL: u16 = 4004;
    /// Repeated protocol violations.
    pub const POLICY_VIOLATION: u16 = 4005;
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope failed to decode or carried an unknown type tag.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] rmp_serde::decode::Error),

    /// Envelope failed to encode.
    #[error("envelope encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Message exceeded [`MAX_MESSAGE_BYTES`].
    #[error("oversized message: {0} bytes")]
    OversizedMessage(usize),

    /// `game_frame` input map key was not a numeric player slot.
    #[error("invalid player slot key: {0:?}")]
    InvalidSlot(String),

    /// Input blob with the wrong length.
    #[error("input blob must be {INPUT_SIZE} bytes, got {0}")]
    BadInputLength(usize),
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate and join a room.
    Auth {
        /// Player identifier.
        player_id: String,
        /// Room identifier.
        room_id: String,
        /// Optional opaque token; the coordinator performs admission
        /// checks only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Input for one tick. `input_data` is the 16-byte input record.
    Input {
        /// Tick the input targets.
        frame_id: u32,
        /// Serialized [`crate::game::input::PlayerInput`].
        input_data: ByteBuf,
    },

    /// Resume a recent session and request catch-up.
    Reconnect {
        /// Player identifier.
        player_id: String,
        /// Room identifier.
        room_id: String,
        /// Last committed frame the client applied.
        last_frame: u32,
    },

    /// Leave the room.
    Leave,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Admission succeeded.
    JoinSuccess {
        /// Room joined.
        room_id: String,
        /// Echoed player identifier.
        player_id: String,
        /// Current members in join order.
        roster: Vec<String>,
    },

    /// Another member joined.
    PlayerJoined {
        /// The joining player.
        player_id: String,
    },

    /// A member left.
    PlayerLeft {
        /// The leaving player.
        player_id: String,
    },

    /// The match is starting; construct the initial state from the seed.
    GameStart {
        /// Room-derived PRNG seed.
        seed: u32,
        /// Number of players in the locked roster.
        player_count: u32,
        /// Logical ticks per second.
        tick_rate: u32,
    },

    /// One committed tick.
    GameFrame(GameFramePayload),

    /// Catch-up replay of committed ticks, ascending.
    SyncFrames {
        /// Frames in `(last_frame, current_frame]`.
        frames: Vec<GameFramePayload>,
    },

    /// Catch-up fallback: the gap exceeded retained history, restore from
    /// a full snapshot instead.
    ResyncFull {
        /// Serialized game state.
        snapshot: GameState,
    },

    /// Terminal or advisory error.
    Error {
        /// Close-code style error code.
        code: u16,
        /// Human-readable description.
        message: String,
    },
}

/// The `game_frame` payload: one committed tick's complete input set.
///
/// Input map keys are the decimal string form of the player slot, per the
/// envelope's string-keyed encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameFramePayload {
    /// Tick id.
    pub frame_id: u32,
    /// Player slot (decimal string) -> 16-byte input record.
    pub inputs: BTreeMap<String, ByteBuf>,
    /// False when the frame was force-committed.
    pub confirmed: bool,
}

impl GameFramePayload {
    /// Build the wire payload from a committed frame.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            frame_id: frame.frame_id,
            inputs: frame
                .inputs
                .iter()
                .map(|(slot, bytes)| (slot.to_string(), ByteBuf::from(bytes.to_vec())))
                .collect(),
            confirmed: frame.confirmed,
        }
    }

    /// Reconstruct the frame on the receiving side.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let mut frame = Frame::new(self.frame_id);
        frame.confirmed = self.confirmed;

        for (key, bytes) in &self.inputs {
            let slot: PlayerSlot = key
                .parse()
                .map_err(|_| ProtocolError::InvalidSlot(key.clone()))?;
            if bytes.len() != INPUT_SIZE {
                return Err(ProtocolError::BadInputLength(bytes.len()));
            }
            let mut data = [0u8; INPUT_SIZE];
            data.copy_from_slice(bytes);
            frame.set_input(slot, data);
        }

        Ok(frame)
    }
}

impl ClientMessage {
    /// Encode to the MessagePack envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from the MessagePack envelope.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

impl ServerMessage {
    /// Encode to the MessagePack envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from the MessagePack envelope.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
