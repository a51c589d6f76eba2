//! Frame Records, Frame Buffer and Frame Engine
//!
//! The frame engine is the heart of the lockstep coordinator: it admits
//! inputs for future ticks into a bounded pending window, commits a tick
//! once every player's input has arrived, and force-advances with
//! zero-filled inputs when a tick has starved past the timeout.
//!
//! Commit policy is all-or-nothing: a frame ships either complete and
//! `confirmed`, or forced and unconfirmed. `current_frame` is the id of
//! the next tick to commit and advances by exactly one per commit.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::game::input::{PlayerInput, PlayerSlot, INPUT_SIZE, MAX_FRAME_AHEAD};

/// Committed frames retained for catch-up, per engine.
pub const MAX_FRAME_HISTORY: u32 = 300;

/// Raw serialized input bytes as stored per player per frame.
pub type InputBytes = [u8; INPUT_SIZE];

/// Wall-clock milliseconds, metadata only; never enters hashes or wire.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One committed (or speculative) tick: the complete input set for a
/// frame id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Tick id.
    pub frame_id: u32,
    /// Input bytes per player slot, id-ascending.
    pub inputs: BTreeMap<PlayerSlot, InputBytes>,
    /// True when committed with every player's real input.
    pub confirmed: bool,
    /// Commit wall-clock, metadata only.
    pub timestamp_ms: u64,
}

impl Frame {
    /// Create an empty frame record.
    pub fn new(frame_id: u32) -> Self {
        Self {
            frame_id,
            inputs: BTreeMap::new(),
            confirmed: false,
            timestamp_ms: now_ms(),
        }
    }

    /// A player's input bytes, if present.
    pub fn input(&self, player_id: PlayerSlot) -> Option<&InputBytes> {
        self.inputs.get(&player_id)
    }

    /// Store a player's input bytes.
    pub fn set_input(&mut self, player_id: PlayerSlot, data: InputBytes) {
        self.inputs.insert(player_id, data);
    }

    /// A frame is complete when every player has an input.
    pub fn is_complete(&self, player_count: usize) -> bool {
        self.inputs.len() == player_count
    }
}

/// Pending inputs for not-yet-committed frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: BTreeMap<u32, BTreeMap<PlayerSlot, InputBytes>>,
}

impl FrameBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an input; a later submission for the same `(frame, player)`
    /// overwrites the earlier one.
    pub fn add_input(&mut self, frame_id: u32, player_id: PlayerSlot, data: InputBytes) {
        self.pending.entry(frame_id).or_default().insert(player_id, data);
    }

    /// Inputs collected so far for a frame.
    pub fn pending_for(&self, frame_id: u32) -> Option<&BTreeMap<PlayerSlot, InputBytes>> {
        self.pending.get(&frame_id)
    }

    /// Commit a frame if complete: builds a confirmed [`Frame`] and
    /// removes it from the pending set.
    pub fn try_commit(&mut self, frame_id: u32, player_count: usize) -> Option<Frame> {
        let complete = self
            .pending
            .get(&frame_id)
            .is_some_and(|inputs| inputs.len() == player_count);
        if !complete {
            return None;
        }

        let inputs = self.pending.remove(&frame_id)?;
        Some(Frame {
            frame_id,
            inputs,
            confirmed: true,
            timestamp_ms: now_ms(),
        })
    }

    /// Remove and return whatever has been collected for a frame.
    pub fn take_pending(&mut self, frame_id: u32) -> BTreeMap<PlayerSlot, InputBytes> {
        self.pending.remove(&frame_id).unwrap_or_default()
    }

    /// Drop pending entries below a frame id.
    pub fn prune_below(&mut self, oldest: u32) {
        self.pending = self.pending.split_off(&oldest);
    }

    /// Number of frames with pending inputs.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}

/// Frame engine statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Next frame to commit.
    pub current_frame: u32,
    /// Roster size.
    pub player_count: usize,
    /// Frames currently collecting inputs.
    pub pending_frames: usize,
    /// Committed frames retained in history.
    pub history_len: usize,
}

/// Per-room lockstep engine: input collection, commit, forced advance,
/// bounded history.
#[derive(Debug)]
pub struct FrameEngine {
    players: Vec<PlayerSlot>,
    buffer: FrameBuffer,
    current_frame: u32,
    history: BTreeMap<u32, Frame>,
}

impl FrameEngine {
    /// Create an engine for a fixed roster of player slots.
    pub fn new(mut players: Vec<PlayerSlot>) -> Self {
        players.sort_unstable();
        players.dedup();
        Self {
            players,
            buffer: FrameBuffer::new(),
            current_frame: 0,
            history: BTreeMap::new(),
        }
    }

    /// Roster size.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Roster slots, ascending.
    pub fn players(&self) -> &[PlayerSlot] {
        &self.players
    }

    /// Id of the next tick to commit.
    pub fn current_frame(&self) -> u32 {
        self.current_frame
    }

    /// Admit an input.
    ///
    /// Inputs for already-committed frames and for frames beyond the
    /// ahead-window drop silently; unknown slots are a soft no-op. A later
    /// input for the same `(frame, player)` replaces the earlier one.
    pub fn add_input(&mut self, frame_id: u32, player_id: PlayerSlot, data: InputBytes) {
        if frame_id < self.current_frame {
            return;
        }
        if frame_id >= self.current_frame.saturating_add(MAX_FRAME_AHEAD) {
            return;
        }
        if !self.players.contains(&player_id) {
            return;
        }
        self.buffer.add_input(frame_id, player_id, data);
    }

    /// Commit the current frame if every player's input has arrived.
    ///
    /// On commit the frame moves to history, `current_frame` advances by
    /// one and the frame is returned. Otherwise `None`, with no state
    /// change.
    pub fn tick(&mut self) -> Option<Frame> {
        let frame = self
            .buffer
            .try_commit(self.current_frame, self.players.len())?;
        self.commit(frame.clone());
        Some(frame)
    }

    /// Force-commit the current frame, filling each missing player's
    /// input with the deterministic empty input. The frame ships
    /// `confirmed = false`.
    pub fn force_tick(&mut self) -> Frame {
        let mut inputs = self.buffer.take_pending(self.current_frame);
        for &slot in &self.players {
            inputs
                .entry(slot)
                .or_insert_with(|| PlayerInput::empty(self.current_frame, slot).serialize());
        }

        let frame = Frame {
            frame_id: self.current_frame,
            inputs,
            confirmed: false,
            timestamp_ms: now_ms(),
        };
        self.commit(frame.clone());
        frame
    }

    fn commit(&mut self, frame: Frame) {
        self.history.insert(frame.frame_id, frame);
        self.current_frame += 1;

        let oldest = self.current_frame.saturating_sub(MAX_FRAME_HISTORY);
        self.history = self.history.split_off(&oldest);
        self.buffer.prune_below(self.current_frame);
    }

    /// A committed frame by id, if still in history.
    pub fn frame(&self, frame_id: u32) -> Option<&Frame> {
        self.history.get(&frame_id)
    }

    /// Committed frames in `(after, current_frame]`, ascending.
    /// Bounded by what history retains.
    pub fn frames_after(&self, after: u32) -> Vec<Frame> {
        self.history
            .range(after.saturating_add(1)..)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Engine statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            current_frame: self.current_frame,
            player_count: self.players.len(),
            pending_frames: self.buffer.pending_frames(),
            history_len: self.history.len(),
        }
    }
}
