//! Network Layer
//!
//! The non-deterministic edge of the coordinator: WebSocket transport,
//! MessagePack envelopes, admission policing, rooms and the tick
//! scheduler. Everything that mutates simulation state funnels into
//! `game/` through a room's lock.

pub mod client;
pub mod gate;
pub mod protocol;
pub mod room;
pub mod server;

pub use client::{ClientError, ClientEvent, ClientSession, GameClient};
pub use gate::{ConnectionGate, GateConfig, GateDecision};
pub use protocol::{
    close_code, ClientMessage, GameFramePayload, ProtocolError, ServerMessage, MAX_MESSAGE_BYTES,
};
pub use room::{Room, RoomError, RoomManager};
pub use server::{GameServer, GameServerError, ServerConfig};
