//! Client-Side Prediction and Rollback
//!
//! The client runs each tick speculatively as soon as its own input
//! exists, guessing every remote player's input as the most recently
//! confirmed one (falling back to the empty input). A snapshot is taken
//! before each speculative tick. When the authoritative frame arrives the
//! guess is compared byte-wise; on divergence the state rolls back to the
//! snapshot, applies the authoritative tick and re-applies every
//! still-speculative later tick with refreshed guesses.

use std::collections::BTreeMap;

use tracing::warn;

use crate::game::frame::{Frame, InputBytes};
use crate::game::input::{PlayerInput, PlayerSlot};
use crate::game::state::GameState;

/// Outcome of reconciling one authoritative frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionResult {
    /// Frame that was reconciled.
    pub frame_id: u32,
    /// Whether a speculative tick existed for this frame.
    pub predicted: bool,
    /// Whether the speculation matched the authoritative inputs.
    pub correct: bool,
    /// Whether a rollback + replay was performed.
    pub rolled_back: bool,
}

/// One speculative tick awaiting confirmation.
#[derive(Debug, Clone)]
struct PredictedTick {
    my_input: InputBytes,
    guessed: BTreeMap<PlayerSlot, InputBytes>,
}

/// Speculative tick execution with snapshot-based rollback.
#[derive(Debug)]
pub struct ClientPredictor {
    /// The predicted simulation state.
    pub state: GameState,
    local_player: PlayerSlot,
    predicted: BTreeMap<u32, PredictedTick>,
    last_confirmed: BTreeMap<PlayerSlot, InputBytes>,
    /// Speculative ticks executed.
    pub prediction_count: u64,
    /// Speculations confirmed byte-identical.
    pub correct_count: u64,
    /// Rollback + replay passes performed.
    pub rollback_count: u64,
}

impl ClientPredictor {
    /// Create a predictor over an initialized game state.
    pub fn new(state: GameState, local_player: PlayerSlot) -> Self {
        Self {
            state,
            local_player,
            predicted: BTreeMap::new(),
            last_confirmed: BTreeMap::new(),
            prediction_count: 0,
            correct_count: 0,
            rollback_count: 0,
        }
    }

    /// The local player's slot.
    pub fn local_player(&self) -> PlayerSlot {
        self.local_player
    }

    /// Speculative ticks still awaiting confirmation.
    pub fn pending_predictions(&self) -> usize {
        self.predicted.len()
    }

    /// Prediction accuracy in percent.
    pub fn accuracy(&self) -> f64 {
        if self.prediction_count == 0 {
            return 0.0;
        }
        self.correct_count as f64 / self.prediction_count as f64 * 100.0
    }

    /// Run tick `frame_id` speculatively with the local input and guessed
    /// remote inputs. Snapshots the pre-state first and returns the
    /// speculative frame.
    pub fn predict(
        &mut self,
        frame_id: u32,
        my_input: &PlayerInput,
        remote_players: &[PlayerSlot],
    ) -> Frame {
        self.state.save_snapshot();

        let my_bytes = my_input.serialize();
        let mut frame = Frame::new(frame_id);
        frame.set_input(self.local_player, my_bytes);

        let mut guessed = BTreeMap::new();
        for &slot in remote_players {
            if slot == self.local_player {
                continue;
            }
            let guess = self.guess_input(slot, frame_id);
            guessed.insert(slot, guess);
            frame.set_input(slot, guess);
        }

        self.state.step_frame(&frame);
        self.predicted.insert(
            frame_id,
            PredictedTick {
                my_input: my_bytes,
                guessed,
            },
        );
        self.prediction_count += 1;

        frame
    }

    /// Reconcile an authoritative frame against any speculation for the
    /// same tick.
    pub fn on_server_frame(&mut self, frame: &Frame) -> PredictionResult {
        self.remember_confirmed(frame);
        let frame_id = frame.frame_id;

        let Some(tick) = self.predicted.get(&frame_id) else {
            // Never speculated: apply directly, no divergence possible.
            self.state.step_frame(frame);
            return PredictionResult {
                frame_id,
                predicted: false,
                correct: true,
                rolled_back: false,
            };
        };

        let matches = frame
            .inputs
            .iter()
            .filter(|(slot, _)| **slot != self.local_player)
            .all(|(slot, bytes)| tick.guessed.get(slot) == Some(bytes));

        if matches {
            self.correct_count += 1;
            self.predicted.remove(&frame_id);
            return PredictionResult {
                frame_id,
                predicted: true,
                correct: true,
                rolled_back: false,
            };
        }

        self.rollback_and_replay(frame);
        self.rollback_count += 1;
        PredictionResult {
            frame_id,
            predicted: true,
            correct: false,
            rolled_back: true,
        }
    }

    /// Apply a run of authoritative frames without speculation, for
    /// reconnect catch-up.
    pub fn catch_up(&mut self, frames: &[Frame]) {
        for frame in frames {
            self.remember_confirmed(frame);
            self.state.step_frame(frame);
        }
        self.predicted.clear();
    }

    /// Replace the whole simulation state from a full resync snapshot.
    pub fn restore_full(&mut self, state: GameState) {
        self.state = state;
        self.predicted.clear();
    }

    fn remember_confirmed(&mut self, frame: &Frame) {
        for (&slot, bytes) in &frame.inputs {
            if slot != self.local_player {
                self.last_confirmed.insert(slot, *bytes);
            }
        }
    }

    /// Most recently confirmed input for a remote player, restamped for
    /// the target frame; the empty input when nothing is known yet.
    fn guess_input(&self, slot: PlayerSlot, frame_id: u32) -> InputBytes {
        match self
            .last_confirmed
            .get(&slot)
            .and_then(|bytes| PlayerInput::deserialize(bytes).ok())
        {
            Some(mut input) => {
                input.frame_id = frame_id;
                input.serialize()
            }
            None => PlayerInput::empty(frame_id, slot).serialize(),
        }
    }

    fn rollback_and_replay(&mut self, authoritative: &Frame) {
        let frame_id = authoritative.frame_id;

        if self.state.restore_snapshot(frame_id).is_err() {
            // Snapshot evicted: nothing to rewind onto. Drop the stale
            // speculation and wait for a full resync on the next
            // divergence.
            warn!(frame_id, "rollback snapshot evicted; skipping replay");
            self.predicted.retain(|&id, _| id > frame_id);
            return;
        }

        self.state.step_frame(authoritative);

        let later: Vec<u32> = self
            .predicted
            .range(frame_id.wrapping_add(1)..)
            .map(|(&id, _)| id)
            .collect();
        self.predicted.retain(|&id, _| id > frame_id);

        for replay_id in later {
            let Some(tick) = self.predicted.get(&replay_id) else {
                continue;
            };

            let mut frame = Frame::new(replay_id);
            frame.set_input(self.local_player, tick.my_input);

            let slots: Vec<PlayerSlot> = tick.guessed.keys().copied().collect();
            let mut refreshed = BTreeMap::new();
            for slot in slots {
                let guess = self.guess_input(slot, replay_id);
                refreshed.insert(slot, guess);
                frame.set_input(slot, guess);
            }

            self.state.save_snapshot();
            self.state.step_frame(&frame);

            if let Some(tick) = self.predicted.get_mut(&replay_id) {
                tick.guessed = refreshed;
            }
        }
    }
}
