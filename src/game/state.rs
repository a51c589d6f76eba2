//! Game State, Snapshots and Rollback
//!
//! Aggregates the entity world, per-player entity bindings and the match
//! PRNG, with a bounded snapshot ring for rollback and a canonical state
//! hash for desync detection.
//!
//! `frame_id` is the id of the next frame to apply; applying frame `k`
//! requires `frame_id == k` and leaves `frame_id == k + 1`. Snapshots are
//! keyed by the `frame_id` they precede, so restoring snapshot `k` yields
//! a state ready to (re-)apply frame `k`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::CanonicalHasher;
use crate::core::rng::SeededRng;
use crate::game::frame::Frame;
use crate::game::input::{PlayerInput, PlayerSlot};
use crate::game::physics::{self, Entity, EntityId, PLAYER_SPEED};
use crate::FRAME_TIME_MS;

/// Snapshots retained in the ring (2 s at 30 Hz).
pub const MAX_SNAPSHOTS: u32 = 60;

/// State management errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    /// Rollback target is no longer in the snapshot ring.
    #[error("no snapshot retained for frame {0}")]
    SnapshotMiss(u32),
}

/// Immutable copy of the simulation at one frame boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Frame this snapshot precedes.
    pub frame_id: u32,
    /// Deep copy of every entity, id-ascending.
    pub entities: Vec<Entity>,
    /// PRNG state at capture.
    pub rng_state: u32,
    /// Canonical state hash at capture.
    pub hash: String,
}

/// The deterministic simulation state shared by server and clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameState {
    /// Next frame to apply.
    pub frame_id: u32,
    /// Entity world, id-ascending.
    pub entities: BTreeMap<EntityId, Entity>,
    /// Player slot -> controlled entity.
    pub player_entities: BTreeMap<PlayerSlot, EntityId>,
    /// Simulation running flag.
    pub running: bool,
    /// Simulation paused flag.
    pub paused: bool,
    /// Match PRNG; part of every snapshot.
    pub rng: SeededRng,
    #[serde(skip)]
    snapshots: BTreeMap<u32, StateSnapshot>,
    #[serde(skip)]
    last_collisions: Vec<(EntityId, EntityId)>,
}

impl GameState {
    /// Create an empty, not-running state.
    pub fn new(seed: u32) -> Self {
        Self {
            frame_id: 0,
            entities: BTreeMap::new(),
            player_entities: BTreeMap::new(),
            running: false,
            paused: false,
            rng: SeededRng::new(seed),
            snapshots: BTreeMap::new(),
            last_collisions: Vec::new(),
        }
    }

    /// Build the initial match state every peer constructs from the
    /// `game_start` seed: one default entity per player slot, entity id
    /// equal to the slot, spawned on a deterministic grid row.
    pub fn initialize_match(seed: u32, slots: &[PlayerSlot]) -> Self {
        let mut state = Self::new(seed);

        let mut ordered: Vec<PlayerSlot> = slots.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        for slot in ordered {
            let entity_id = slot as EntityId;
            let entity = Entity::at_pixels(entity_id, 100 * (slot as i32 + 1), 100);
            state.add_entity(entity);
            state.bind_player(slot, entity_id);
        }

        state.running = true;
        state
    }

    /// Insert an entity, returning its id. Replaces any entity with the
    /// same id.
    pub fn add_entity(&mut self, entity: Entity) -> EntityId {
        let id = entity.id;
        self.entities.insert(id, entity);
        id
    }

    /// Remove an entity. Returns whether it existed.
    pub fn remove_entity(&mut self, entity_id: EntityId) -> bool {
        self.player_entities.retain(|_, bound| *bound != entity_id);
        self.entities.remove(&entity_id).is_some()
    }

    /// Look up an entity.
    pub fn get_entity(&self, entity_id: EntityId) -> Option<&Entity> {
        self.entities.get(&entity_id)
    }

    /// Look up an entity mutably.
    pub fn get_entity_mut(&mut self, entity_id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&entity_id)
    }

    /// Bind a player slot to an entity it controls.
    pub fn bind_player(&mut self, player_id: PlayerSlot, entity_id: EntityId) {
        self.player_entities.insert(player_id, entity_id);
    }

    /// The entity a player controls, if bound.
    pub fn player_entity(&self, player_id: PlayerSlot) -> Option<&Entity> {
        self.player_entities
            .get(&player_id)
            .and_then(|id| self.entities.get(id))
    }

    /// Collision pairs emitted by the most recent step.
    pub fn last_collisions(&self) -> &[(EntityId, EntityId)] {
        &self.last_collisions
    }

    /// Apply one committed frame: route each player's input to their
    /// bound entity (slot-ascending), advance physics by one tick, and
    /// move `frame_id` past the frame.
    ///
    /// Inputs that fail to parse are skipped; the admission gate already
    /// rejected them upstream and a forced frame never produces one.
    pub fn step_frame(&mut self, frame: &Frame) {
        for (slot, data) in &frame.inputs {
            let Ok(input) = PlayerInput::deserialize(data) else {
                continue;
            };
            if let Some(&entity_id) = self.player_entities.get(slot) {
                physics::apply_input(&mut self.entities, entity_id, input.flags, PLAYER_SPEED);
            }
        }

        self.last_collisions = physics::step(&mut self.entities, FRAME_TIME_MS);
        self.frame_id = frame.frame_id.wrapping_add(1);
    }

    /// Advance the frame counter without simulating (idle tick).
    pub fn advance_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }

    /// Canonical hash of the deterministic simulation state.
    ///
    /// Covers entities only, id-ascending, fields in the fixed order
    /// `id,x,y,vx,vy,w,h,hp,max_hp` as decimal raw values. Timestamps and
    /// transport state never enter the digest.
    pub fn compute_state_hash(&self) -> String {
        let mut hasher = CanonicalHasher::new();
        for entity in self.entities.values() {
            hasher.field_i32(entity.id);
            hasher.field_i32(entity.x);
            hasher.field_i32(entity.y);
            hasher.field_i32(entity.vx);
            hasher.field_i32(entity.vy);
            hasher.field_i32(entity.width);
            hasher.field_i32(entity.height);
            hasher.field_i32(entity.hp);
            hasher.field_i32(entity.max_hp);
        }
        hasher.finalize()
    }

    /// Capture a snapshot keyed by the current `frame_id` and insert it
    /// into the ring, evicting entries older than [`MAX_SNAPSHOTS`].
    pub fn save_snapshot(&mut self) -> StateSnapshot {
        let snapshot = StateSnapshot {
            frame_id: self.frame_id,
            entities: self.entities.values().cloned().collect(),
            rng_state: self.rng.state(),
            hash: self.compute_state_hash(),
        };

        self.snapshots.insert(self.frame_id, snapshot.clone());

        while self.snapshots.len() > MAX_SNAPSHOTS as usize {
            self.snapshots.pop_first();
        }

        snapshot
    }

    /// Restore the snapshot keyed by exactly `frame_id`, replacing the
    /// live entities and PRNG state.
    pub fn restore_snapshot(&mut self, frame_id: u32) -> Result<(), StateError> {
        let snapshot = self
            .snapshots
            .get(&frame_id)
            .ok_or(StateError::SnapshotMiss(frame_id))?;

        self.frame_id = snapshot.frame_id;
        self.entities = snapshot
            .entities
            .iter()
            .cloned()
            .map(|entity| (entity.id, entity))
            .collect();
        self.rng.set_state(snapshot.rng_state);
        self.last_collisions.clear();

        Ok(())
    }

    /// Roll back to the state preceding `frame_id`.
    pub fn rollback_to(&mut self, frame_id: u32) -> Result<(), StateError> {
        self.restore_snapshot(frame_id)
    }

    /// Number of snapshots currently retained.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

/// Records per-frame hashes and detects divergence between peers.
#[derive(Debug, Default)]
pub struct StateValidator {
    hashes: BTreeMap<u32, String>,
    mismatches: Vec<HashMismatch>,
}

/// A recorded hash disagreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashMismatch {
    /// Frame the hashes disagree on.
    pub frame_id: u32,
    /// Hash the remote peer reported.
    pub expected: String,
    /// Hash recorded locally.
    pub actual: String,
}

impl StateValidator {
    /// Create an empty validator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the local hash for a frame.
    pub fn record_hash(&mut self, frame_id: u32, hash: String) {
        self.hashes.insert(frame_id, hash);
    }

    /// Check a remote hash against the local record. Frames with no local
    /// record pass vacuously.
    pub fn verify_hash(&mut self, frame_id: u32, expected: &str) -> bool {
        let Some(actual) = self.hashes.get(&frame_id) else {
            return true;
        };

        if actual != expected {
            self.mismatches.push(HashMismatch {
                frame_id,
                expected: expected.to_string(),
                actual: actual.clone(),
            });
            return false;
        }
        true
    }

    /// All recorded mismatches.
    pub fn mismatches(&self) -> &[HashMismatch] {
        &self.mismatches
    }

    /// Forget recorded mismatches.
    pub fn clear_mismatches(&mut self) {
        self.mismatches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(frame_id: u32, inputs: &[(PlayerSlot, u8)]) -> Frame {
        let mut frame = Frame::new(frame_id);
        for &(slot, flags) in inputs {
            let mut input = PlayerInput::new(frame_id, slot);
            input.flags = flags;
            frame.set_input(slot, input.serialize());
        }
        frame.confirmed = true;
        frame
    }

    #[test]
    fn test_initialize_match_deterministic() {
        let a = GameState::initialize_match(12345, &[0, 1]);
        let b = GameState::initialize_match(12345, &[1, 0]);

        assert_eq!(a.compute_state_hash(), b.compute_state_hash());
        assert_eq!(a.entities.len(), 2);
        assert!(a.running);
        assert_eq!(a.player_entity(0).map(|e| e.id), Some(0));
        assert_eq!(a.player_entity(1).map(|e| e.id), Some(1));
    }

    #[test]
    fn test_entity_management() {
        let mut state = GameState::new(1);

        state.add_entity(Entity::at_pixels(5, 10, 10));
        state.bind_player(0, 5);

        assert!(state.get_entity(5).is_some());
        assert_eq!(state.player_entity(0).map(|e| e.id), Some(5));

        assert!(state.remove_entity(5));
        assert!(state.get_entity(5).is_none());
        assert!(state.player_entity(0).is_none());
        assert!(!state.remove_entity(5));
    }

    #[test]
    fn test_step_frame_advances() {
        let mut state = GameState::initialize_match(7, &[0, 1]);
        let before = state.player_entity(0).unwrap().x;

        let frame = frame_with(0, &[(0, PlayerInput::MOVE_RIGHT), (1, 0)]);
        state.step_frame(&frame);

        assert_eq!(state.frame_id, 1);
        assert!(state.player_entity(0).unwrap().x > before);
    }

    #[test]
    fn test_hash_ignores_bindings_and_flags() {
        // Only entity state enters the digest.
        let mut a = GameState::initialize_match(1, &[0]);
        let mut b = GameState::initialize_match(1, &[0]);

        a.paused = true;
        b.frame_id = 99;
        assert_eq!(a.compute_state_hash(), b.compute_state_hash());

        b.get_entity_mut(0).unwrap().hp -= 1;
        assert_ne!(a.compute_state_hash(), b.compute_state_hash());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut state = GameState::initialize_match(42, &[0, 1]);

        let snapshot = state.save_snapshot();
        let hash_before = state.compute_state_hash();
        assert_eq!(snapshot.hash, hash_before);

        for i in 0..5u32 {
            let frame = frame_with(i, &[(0, PlayerInput::MOVE_RIGHT), (1, PlayerInput::MOVE_UP)]);
            state.step_frame(&frame);
        }
        assert_ne!(state.compute_state_hash(), hash_before);

        state.restore_snapshot(0).unwrap();
        assert_eq!(state.compute_state_hash(), hash_before);
        assert_eq!(state.frame_id, 0);
    }

    #[test]
    fn test_snapshot_includes_rng() {
        let mut state = GameState::initialize_match(42, &[0]);
        state.save_snapshot();

        let draws: Vec<u32> = (0..5).map(|_| state.rng.next_uint32()).collect();

        state.restore_snapshot(0).unwrap();
        let replayed: Vec<u32> = (0..5).map(|_| state.rng.next_uint32()).collect();
        assert_eq!(draws, replayed);
    }

    #[test]
    fn test_snapshot_miss() {
        let mut state = GameState::new(1);
        assert_eq!(state.restore_snapshot(10), Err(StateError::SnapshotMiss(10)));
    }

    #[test]
    fn test_snapshot_ring_bounded() {
        let mut state = GameState::initialize_match(1, &[0]);

        for i in 0..(MAX_SNAPSHOTS + 20) {
            state.save_snapshot();
            let frame = frame_with(i, &[(0, 0)]);
            state.step_frame(&frame);
        }

        assert!(state.snapshot_count() as u32 <= MAX_SNAPSHOTS);
        assert_eq!(
            state.restore_snapshot(0),
            Err(StateError::SnapshotMiss(0))
        );
    }

    #[test]
    fn test_identical_traces_identical_hashes() {
        let mut a = GameState::initialize_match(999, &[0, 1]);
        let mut b = GameState::initialize_match(999, &[0, 1]);

        for i in 0..50u32 {
            let flags = if i % 3 == 0 {
                PlayerInput::MOVE_RIGHT
            } else {
                PlayerInput::MOVE_UP | PlayerInput::ATTACK
            };
            let frame = frame_with(i, &[(0, flags), (1, PlayerInput::MOVE_LEFT)]);
            a.step_frame(&frame);
            b.step_frame(&frame);
            assert_eq!(a.compute_state_hash(), b.compute_state_hash());
        }
    }

    #[test]
    fn test_state_validator() {
        let mut validator = StateValidator::new();
        validator.record_hash(1, "aaa".into());

        assert!(validator.verify_hash(1, "aaa"));
        assert!(validator.verify_hash(2, "whatever"));
        assert!(!validator.verify_hash(1, "bbb"));

        assert_eq!(validator.mismatches().len(), 1);
        assert_eq!(validator.mismatches()[0].frame_id, 1);

        validator.clear_mismatches();
        assert!(validator.mismatches().is_empty());
    }
}
