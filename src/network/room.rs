//! Rooms and Room Management
//!
//! A room owns its frame engine and game state exclusively; all mutation
//! goes through the room's lock, held for the whole of a tick or input
//! submission, which serializes every write and preserves the ordering
//! guarantees the lockstep engine needs.
//!
//! Members are keyed by their string player id; numeric wire slots are
//! frozen from join order when the game starts. A member who drops out is
//! retained in a disconnected table for a grace period so they can
//! reconnect into the same slot; once the grace expires the slot is
//! filled with neutral inputs so the remaining players keep ticking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::core::hash::derive_room_seed;
use crate::game::frame::{Frame, FrameEngine, MAX_FRAME_HISTORY};
use crate::game::input::{InputError, InputValidator, PlayerInput, PlayerSlot};
use crate::game::state::GameState;
use crate::network::protocol::{GameFramePayload, ServerMessage};

/// Outbound channel to one connection's sender task.
pub type Outbound = mpsc::Sender<Message>;

/// Room-level errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Membership is at capacity.
    #[error("room is full")]
    RoomFull,

    /// The player id is already a member.
    #[error("player already in room")]
    AlreadyJoined,

    /// The game already started; only reconnect can re-enter.
    #[error("game already started")]
    AlreadyStarted,

    /// No engine yet; inputs before `game_start` are meaningless.
    #[error("game not started")]
    NotStarted,

    /// Submitting player is not a member.
    #[error("unknown player")]
    UnknownPlayer,

    /// Envelope frame id disagrees with the embedded input frame id.
    #[error("envelope frame {claimed} does not match embedded frame {embedded}")]
    FrameMismatch {
        /// Frame id in the envelope.
        claimed: u32,
        /// Frame id inside the 16-byte record.
        embedded: u32,
    },

    /// Input failed validation.
    #[error(transparent)]
    Input(#[from] InputError),
}

/// A connected room member.
#[derive(Debug)]
struct Member {
    slot: Option<PlayerSlot>,
    sender: Outbound,
    broken: bool,
}

/// A member retained for reconnection.
#[derive(Debug)]
struct DisconnectedMember {
    slot: PlayerSlot,
    since: Instant,
}

/// One game room: membership plus the exclusively-owned frame engine and
/// game state.
pub struct Room {
    /// Room identifier.
    pub room_id: String,
    members: BTreeMap<String, Member>,
    join_order: Vec<String>,
    disconnected: BTreeMap<String, DisconnectedMember>,
    departed: BTreeSet<PlayerSlot>,
    engine: Option<FrameEngine>,
    state: Option<GameState>,
    validator: InputValidator,
    started: bool,
    seed: u32,
    max_players: usize,
    start_threshold: usize,
    created_at: Instant,
    empty_since: Option<Instant>,
    last_commit: Instant,
    /// Set by the manager when the room is destroyed; the ticker exits on
    /// seeing it.
    pub closed: bool,
}

impl Room {
    /// Create an empty room with a room-derived PRNG seed.
    pub fn new(room_id: String, max_players: usize, start_threshold: usize) -> Self {
        let seed = derive_room_seed(&room_id);
        Self {
            room_id,
            members: BTreeMap::new(),
            join_order: Vec::new(),
            disconnected: BTreeMap::new(),
            departed: BTreeSet::new(),
            engine: None,
            state: None,
            validator: InputValidator::default(),
            started: false,
            seed,
            max_players,
            start_threshold,
            created_at: Instant::now(),
            empty_since: None,
            last_commit: Instant::now(),
            closed: false,
        }
    }

    /// Room-derived PRNG seed.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Whether the game has started.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Connected member count.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Members retained for reconnection.
    pub fn disconnected_count(&self) -> usize {
        self.disconnected.len()
    }

    /// How long the room has been empty, if it is.
    pub fn empty_for(&self) -> Option<Duration> {
        self.empty_since.map(|since| since.elapsed())
    }

    /// Age of the room.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Current members in join order.
    pub fn roster(&self) -> Vec<String> {
        self.join_order.clone()
    }

    /// A member's wire slot, once the game started.
    pub fn slot_of(&self, player_id: &str) -> Option<PlayerSlot> {
        self.members.get(player_id).and_then(|m| m.slot)
    }

    /// Next frame the engine will commit.
    pub fn current_frame(&self) -> Option<u32> {
        self.engine.as_ref().map(FrameEngine::current_frame)
    }

    /// The live game state, once started.
    pub fn state(&self) -> Option<&GameState> {
        self.state.as_ref()
    }

    /// Admit a member. Fails when the room is full, already started, or
    /// the id is already present.
    pub fn join(&mut self, player_id: &str, sender: Outbound) -> Result<(), RoomError> {
        if self.started {
            return Err(RoomError::AlreadyStarted);
        }
        if self.members.contains_key(player_id) {
            return Err(RoomError::AlreadyJoined);
        }
        if self.members.len() >= self.max_players {
            return Err(RoomError::RoomFull);
        }

        self.members.insert(
            player_id.to_string(),
            Member {
                slot: None,
                sender,
                broken: false,
            },
        );
        self.join_order.push(player_id.to_string());
        self.empty_since = None;
        Ok(())
    }

    /// Whether membership has reached the start threshold.
    pub fn should_start(&self) -> bool {
        !self.started && self.members.len() >= self.start_threshold
    }

    /// Freeze the roster, assign wire slots from join order, and bring up
    /// the frame engine and game state.
    ///
    /// Returns `(seed, player_count)` for the `game_start` broadcast.
    pub fn start(&mut self) -> (u32, u32) {
        let mut slots = Vec::with_capacity(self.join_order.len());
        for (index, player_id) in self.join_order.iter().enumerate() {
            let slot = index as PlayerSlot;
            if let Some(member) = self.members.get_mut(player_id) {
                member.slot = Some(slot);
            }
            slots.push(slot);
        }

        self.engine = Some(FrameEngine::new(slots.clone()));
        self.state = Some(GameState::initialize_match(self.seed, &slots));
        self.started = true;
        self.last_commit = Instant::now();

        info!(room = %self.room_id, players = slots.len(), seed = self.seed, "game started");
        (self.seed, slots.len() as u32)
    }

    /// Remove a member. Started rooms retain the slot in the disconnected
    /// table for reconnection; lobby rooms forget the player entirely.
    /// Returns whether the player was a member.
    pub fn remove(&mut self, player_id: &str) -> bool {
        let Some(member) = self.members.remove(player_id) else {
            return false;
        };

        if self.started {
            if let Some(slot) = member.slot {
                self.disconnected.insert(
                    player_id.to_string(),
                    DisconnectedMember {
                        slot,
                        since: Instant::now(),
                    },
                );
            }
        } else {
            self.join_order.retain(|id| id != player_id);
        }

        if self.members.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        true
    }

    /// Re-admit a recently disconnected member into their old slot.
    pub fn reconnect(&mut self, player_id: &str, sender: Outbound) -> Option<PlayerSlot> {
        let record = self.disconnected.remove(player_id)?;
        self.members.insert(
            player_id.to_string(),
            Member {
                slot: Some(record.slot),
                sender,
                broken: false,
            },
        );
        self.empty_since = None;
        Some(record.slot)
    }

    /// Drop disconnected records older than the retention window; their
    /// slots are marked departed and auto-filled with neutral inputs from
    /// then on. Returns the expired player ids.
    pub fn purge_disconnected(&mut self, retention: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .disconnected
            .iter()
            .filter(|(_, record)| record.since.elapsed() > retention)
            .map(|(id, _)| id.clone())
            .collect();

        for player_id in &expired {
            if let Some(record) = self.disconnected.remove(player_id) {
                self.departed.insert(record.slot);
                debug!(room = %self.room_id, player = %player_id, "reconnect window expired");
            }
        }
        expired
    }

    /// Validate and admit one input submission.
    pub fn submit_input(
        &mut self,
        player_id: &str,
        claimed_frame: u32,
        data: &[u8],
    ) -> Result<(), RoomError> {
        let slot = self
            .members
            .get(player_id)
            .ok_or(RoomError::UnknownPlayer)?
            .slot
            .ok_or(RoomError::NotStarted)?;
        let engine = self.engine.as_mut().ok_or(RoomError::NotStarted)?;

        let input = PlayerInput::deserialize(data)?;
        if input.frame_id != claimed_frame {
            return Err(RoomError::FrameMismatch {
                claimed: claimed_frame,
                embedded: input.frame_id,
            });
        }

        self.validator
            .validate(&input, engine.current_frame(), slot)?;

        engine.add_input(input.frame_id, slot, input.serialize());
        Ok(())
    }

    /// Attempt a regular commit. On success the committed frame is applied
    /// to the game state and returned for broadcast.
    pub fn tick(&mut self) -> Option<Frame> {
        let departed: Vec<PlayerSlot> = self.departed.iter().copied().collect();
        let engine = self.engine.as_mut()?;

        // Neutral inputs for permanently departed slots keep the room
        // committing at full rate.
        let current = engine.current_frame();
        for slot in departed {
            engine.add_input(current, slot, PlayerInput::empty(current, slot).serialize());
        }

        let frame = engine.tick()?;
        if let Some(state) = self.state.as_mut() {
            state.step_frame(&frame);
        }
        self.last_commit = Instant::now();
        Some(frame)
    }

    /// Force-commit the starved current frame once `timeout` has elapsed
    /// since the last commit.
    pub fn maybe_force_tick(&mut self, timeout: Duration) -> Option<Frame> {
        if !self.started || self.last_commit.elapsed() < timeout {
            return None;
        }

        let engine = self.engine.as_mut()?;
        let frame = engine.force_tick();
        if let Some(state) = self.state.as_mut() {
            state.step_frame(&frame);
        }
        self.last_commit = Instant::now();

        debug!(
            room = %self.room_id,
            frame = frame.frame_id,
            "frame timeout, forced commit"
        );
        Some(frame)
    }

    /// Catch-up response for a reconnecting client: the committed frames
    /// in `(last_frame, current_frame]`, or a full snapshot when the gap
    /// exceeds retained history.
    pub fn sync_response(&self, last_frame: u32) -> Option<ServerMessage> {
        let engine = self.engine.as_ref()?;
        let state = self.state.as_ref()?;

        let current = engine.current_frame();
        if current.saturating_sub(last_frame) > MAX_FRAME_HISTORY {
            return Some(ServerMessage::ResyncFull {
                snapshot: state.clone(),
            });
        }

        let frames = engine
            .frames_after(last_frame)
            .iter()
            .map(GameFramePayload::from_frame)
            .collect();
        Some(ServerMessage::SyncFrames { frames })
    }

    /// Encode once and best-effort send to every connected member. A
    /// failed send marks that connection broken without blocking the
    /// rest.
    pub fn broadcast(&mut self, message: &ServerMessage) {
        self.broadcast_filtered(message, None);
    }

    /// Broadcast to everyone except one player.
    pub fn broadcast_except(&mut self, message: &ServerMessage, exclude: &str) {
        self.broadcast_filtered(message, Some(exclude));
    }

    fn broadcast_filtered(&mut self, message: &ServerMessage, exclude: Option<&str>) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(room = %self.room_id, %error, "failed to encode broadcast");
                return;
            }
        };

        for (player_id, member) in self.members.iter_mut() {
            if member.broken || exclude == Some(player_id.as_str()) {
                continue;
            }
            if member
                .sender
                .try_send(Message::Binary(bytes.clone()))
                .is_err()
            {
                warn!(room = %self.room_id, player = %player_id, "send failed, marking broken");
                member.broken = true;
            }
        }
    }

    /// Send one message to one member.
    pub fn send_to(&mut self, player_id: &str, message: &ServerMessage) {
        let Ok(bytes) = message.to_bytes() else {
            return;
        };
        if let Some(member) = self.members.get_mut(player_id) {
            if member.sender.try_send(Message::Binary(bytes)).is_err() {
                member.broken = true;
            }
        }
    }
}

/// Owns every room, keyed by room id. Rooms are created lazily on first
/// join and destroyed after sitting empty past the cutoff.
pub struct RoomManager {
    rooms: RwLock<BTreeMap<String, Arc<RwLock<Room>>>>,
}

impl RoomManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Fetch a room, creating it if absent.
    pub async fn get_or_create(
        &self,
        room_id: &str,
        max_players: usize,
        start_threshold: usize,
    ) -> Arc<RwLock<Room>> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!(room = %room_id, "room created");
                Arc::new(RwLock::new(Room::new(
                    room_id.to_string(),
                    max_players,
                    start_threshold,
                )))
            })
            .clone()
    }

    /// Fetch an existing room.
    pub async fn get(&self, room_id: &str) -> Option<Arc<RwLock<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Expire stale reconnect records and destroy rooms that have been
    /// empty past the cutoff.
    pub async fn cleanup(&self, empty_cutoff: Duration, disconnect_retention: Duration) {
        let rooms: Vec<(String, Arc<RwLock<Room>>)> = {
            let guard = self.rooms.read().await;
            guard
                .iter()
                .map(|(id, room)| (id.clone(), room.clone()))
                .collect()
        };

        let mut to_remove = Vec::new();
        for (room_id, room) in rooms {
            let mut guard = room.write().await;
            guard.purge_disconnected(disconnect_retention);

            let destroy = guard.member_count() == 0
                && guard
                    .empty_for()
                    .map(|idle| idle > empty_cutoff)
                    // A room nobody ever joined still expires.
                    .unwrap_or_else(|| guard.age() > empty_cutoff);
            if destroy {
                guard.closed = true;
                to_remove.push(room_id);
            }
        }

        if !to_remove.is_empty() {
            let mut guard = self.rooms.write().await;
            for room_id in to_remove {
                guard.remove(&room_id);
                info!(room = %room_id, "room destroyed");
            }
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
