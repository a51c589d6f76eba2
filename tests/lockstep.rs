//! End-to-end lockstep scenarios exercised through the public API:
//! room + frame engine on the "server" side, client sessions consuming
//! the broadcast frames on the other, with no sockets in between.

use lockstep::game::frame::MAX_FRAME_HISTORY;
use lockstep::game::input::{InputError, PlayerInput};
use lockstep::game::physics::PLAYER_SPEED;
use lockstep::network::client::{ClientEvent, ClientSession};
use lockstep::network::gate::{ConnectionGate, DropReason, GateConfig, GateDecision};
use lockstep::network::protocol::{GameFramePayload, ServerMessage, MAX_MESSAGE_BYTES};
use lockstep::network::room::{Room, RoomError};
use lockstep::{Fixed, FrameEngine, GameState};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Q16.16 x-displacement of one tick of MOVE_RIGHT at player speed.
const TICK_DX: Fixed = ((PLAYER_SPEED as i64 * 33) / 1000) as Fixed;

fn outbound() -> mpsc::Sender<Message> {
    mpsc::channel(1024).0
}

/// A started two-player room plus client sessions for both members.
fn start_two_player_room(room_id: &str) -> (Room, ClientSession, ClientSession) {
    let mut room = Room::new(room_id.to_string(), 4, 2);
    room.join("alice", outbound()).unwrap();
    room.join("bob", outbound()).unwrap();
    let (seed, player_count) = room.start();

    let roster = vec!["alice".to_string(), "bob".to_string()];
    let start = ServerMessage::GameStart {
        seed,
        player_count,
        tick_rate: 30,
    };

    let mut alice = ClientSession::new("alice".into(), room_id.into(), roster.clone());
    let mut bob = ClientSession::new("bob".into(), room_id.into(), roster);
    alice.handle_message(start.clone()).unwrap();
    bob.handle_message(start).unwrap();

    (room, alice, bob)
}

fn input(frame_id: u32, slot: u16, flags: u8) -> PlayerInput {
    let mut input = PlayerInput::new(frame_id, slot);
    input.flags = flags;
    input
}

fn deliver(frame: &lockstep::Frame, sessions: &mut [&mut ClientSession]) {
    let payload = GameFramePayload::from_frame(frame);
    for session in sessions {
        session
            .handle_message(ServerMessage::GameFrame(payload.clone()))
            .unwrap();
    }
}

mod determinism {
    use super::*;

    /// P1: identical traces on two fresh engines produce bytewise-equal
    /// frames and equal state hashes at every committed tick.
    #[test]
    fn identical_traces_produce_identical_frames_and_hashes() {
        let run = || {
            let mut engine = FrameEngine::new(vec![0, 1]);
            let mut state = GameState::initialize_match(777, &[0, 1]);
            let mut frames = Vec::new();
            let mut hashes = Vec::new();

            for frame_id in 0..100u32 {
                let flags_a = if frame_id % 4 == 0 {
                    PlayerInput::MOVE_RIGHT
                } else {
                    PlayerInput::JUMP | PlayerInput::ATTACK
                };
                engine.add_input(frame_id, 0, input(frame_id, 0, flags_a).serialize());
                engine.add_input(
                    frame_id,
                    1,
                    input(frame_id, 1, PlayerInput::MOVE_LEFT).serialize(),
                );

                let frame = engine.tick().expect("complete frame");
                state.step_frame(&frame);
                frames.push(frame);
                hashes.push(state.compute_state_hash());
            }
            (frames, hashes)
        };

        let (frames_a, hashes_a) = run();
        let (frames_b, hashes_b) = run();
        assert_eq!(frames_a, frames_b);
        assert_eq!(hashes_a, hashes_b);
    }

    /// The state hash is insensitive to input arrival order within a
    /// tick, because committed frames order inputs by slot.
    #[test]
    fn arrival_order_within_tick_does_not_matter() {
        let run = |reversed: bool| {
            let mut engine = FrameEngine::new(vec![0, 1]);
            let mut state = GameState::initialize_match(9, &[0, 1]);

            let a = input(0, 0, PlayerInput::MOVE_RIGHT).serialize();
            let b = input(0, 1, PlayerInput::MOVE_UP).serialize();
            if reversed {
                engine.add_input(0, 1, b);
                engine.add_input(0, 0, a);
            } else {
                engine.add_input(0, 0, a);
                engine.add_input(0, 1, b);
            }

            state.step_frame(&engine.tick().unwrap());
            state.compute_state_hash()
        };

        assert_eq!(run(false), run(true));
    }
}

mod commit_policy {
    use super::*;

    /// P4: current_frame strictly increases by one per commit and
    /// history keys match frame ids.
    #[test]
    fn commit_monotonicity() {
        let mut engine = FrameEngine::new(vec![0, 1]);

        for frame_id in 0..40u32 {
            engine.add_input(frame_id, 0, input(frame_id, 0, 0).serialize());
            engine.add_input(frame_id, 1, input(frame_id, 1, 0).serialize());
            let frame = engine.tick().unwrap();
            assert_eq!(frame.frame_id, frame_id);
            assert_eq!(engine.current_frame(), frame_id + 1);
            assert_eq!(engine.frame(frame_id).unwrap().frame_id, frame_id);
        }
    }

    /// P5: confirmed frames carry every player's input; unconfirmed
    /// frames only come out of the forced path.
    #[test]
    fn no_partial_commit() {
        let mut engine = FrameEngine::new(vec![0, 1, 2]);

        engine.add_input(0, 0, input(0, 0, 0).serialize());
        engine.add_input(0, 1, input(0, 1, 0).serialize());
        assert!(engine.tick().is_none(), "incomplete tick must not commit");

        let forced = engine.force_tick();
        assert!(!forced.confirmed);
        assert_eq!(forced.inputs.len(), 3);

        engine.add_input(1, 0, input(1, 0, 0).serialize());
        engine.add_input(1, 1, input(1, 1, 0).serialize());
        engine.add_input(1, 2, input(1, 2, 0).serialize());
        let committed = engine.tick().unwrap();
        assert!(committed.confirmed);
        assert_eq!(committed.inputs.len(), 3);
    }

    /// P6: frames flow to a member's channel in strictly ascending
    /// order, each id exactly one more than the previous.
    #[test]
    fn broadcast_ordering() {
        let mut room = Room::new("order".into(), 4, 2);
        let (tx, mut rx) = mpsc::channel(1024);
        room.join("alice", tx).unwrap();
        room.join("bob", outbound()).unwrap();
        room.start();

        for frame_id in 0..20u32 {
            room.submit_input("alice", frame_id, &input(frame_id, 0, 0).serialize())
                .unwrap();
            room.submit_input("bob", frame_id, &input(frame_id, 1, 0).serialize())
                .unwrap();
            let frame = room.tick().unwrap();
            room.broadcast(&ServerMessage::GameFrame(GameFramePayload::from_frame(
                &frame,
            )));
        }

        let mut last: Option<u32> = None;
        while let Ok(Message::Binary(bytes)) = rx.try_recv() {
            if let ServerMessage::GameFrame(payload) = ServerMessage::from_bytes(&bytes).unwrap()
            {
                if let Some(previous) = last {
                    assert_eq!(payload.frame_id, previous + 1);
                }
                last = Some(payload.frame_id);
            }
        }
        assert_eq!(last, Some(19));
    }
}

mod scenarios {
    use super::*;

    /// S1: two players hold MOVE_RIGHT for frames 0..9. Both bound
    /// entities advance exactly speed*33/1000 per tick, and server and
    /// both clients agree on the state hash.
    #[test]
    fn s1_two_players_move_right() {
        let (mut room, mut alice, mut bob) = start_two_player_room("room_s1");

        let spawn_a = room.state().unwrap().player_entity(0).unwrap().x;
        let spawn_b = room.state().unwrap().player_entity(1).unwrap().x;

        for frame_id in 0..10u32 {
            room.submit_input(
                "alice",
                frame_id,
                &input(frame_id, 0, PlayerInput::MOVE_RIGHT).serialize(),
            )
            .unwrap();
            room.submit_input(
                "bob",
                frame_id,
                &input(frame_id, 1, PlayerInput::MOVE_RIGHT).serialize(),
            )
            .unwrap();

            let frame = room.tick().expect("both inputs present");
            assert!(frame.confirmed);
            deliver(&frame, &mut [&mut alice, &mut bob]);
        }

        assert_eq!(room.current_frame(), Some(10));

        let state = room.state().unwrap();
        assert_eq!(state.player_entity(0).unwrap().x, spawn_a + TICK_DX * 10);
        assert_eq!(state.player_entity(1).unwrap().x, spawn_b + TICK_DX * 10);

        let server_hash = state.compute_state_hash();
        assert_eq!(alice.state().unwrap().compute_state_hash(), server_hash);
        assert_eq!(bob.state().unwrap().compute_state_hash(), server_hash);
    }

    /// S2: one player's input is delayed past the frame timeout. The
    /// frame is force-committed with the missing input zeroed, and the
    /// late input for the committed frame is rejected as stale.
    #[test]
    fn s2_forced_commit_and_late_input() {
        let (mut room, mut alice, mut bob) = start_two_player_room("room_s2");

        room.submit_input("alice", 0, &input(0, 0, PlayerInput::MOVE_RIGHT).serialize())
            .unwrap();

        // Within the timeout nothing commits.
        assert!(room.tick().is_none());
        assert!(room.maybe_force_tick(Duration::from_secs(1)).is_none());

        // Past the timeout the frame ships unconfirmed with bob zeroed.
        let frame = room.maybe_force_tick(Duration::ZERO).expect("forced frame");
        assert!(!frame.confirmed);
        let bob_input = PlayerInput::deserialize(&frame.inputs[&1]).unwrap();
        assert_eq!(bob_input, PlayerInput::empty(0, 1));
        deliver(&frame, &mut [&mut alice, &mut bob]);

        // Bob's late input for the committed frame is discarded.
        let late = room.submit_input("bob", 0, &input(0, 1, PlayerInput::MOVE_LEFT).serialize());
        assert!(matches!(
            late,
            Err(RoomError::Input(InputError::FrameOutOfWindow { .. }))
        ));
        assert_eq!(room.current_frame(), Some(1));
    }

    /// S3: a client predicts with a repeated-last-input guess, the other
    /// player changes input, and the predictor rolls back exactly once
    /// and converges to the authoritative state.
    #[test]
    fn s3_misprediction_rolls_back_once() {
        let (mut room, mut alice, mut bob) = start_two_player_room("room_s3");

        // Frames 0..=4: bob holds MOVE_LEFT. Alice predicts locally.
        for frame_id in 0..5u32 {
            let envelope = alice.next_input(PlayerInput::MOVE_RIGHT, 0, 0).unwrap();
            let lockstep::network::protocol::ClientMessage::Input {
                frame_id: claimed,
                input_data,
            } = envelope
            else {
                panic!("next_input must produce an input envelope");
            };
            room.submit_input("alice", claimed, &input_data).unwrap();
            room.submit_input(
                "bob",
                frame_id,
                &input(frame_id, 1, PlayerInput::MOVE_LEFT).serialize(),
            )
            .unwrap();

            let frame = room.tick().unwrap();
            deliver(&frame, &mut [&mut alice, &mut bob]);
        }

        // Frame 0 guessed empty for bob and rolled back; afterwards the
        // repeated-input guess holds.
        let rollbacks_before = alice.rollback_count();

        // Frame 5: bob switches to MOVE_DOWN, diverging from the guess.
        let envelope = alice.next_input(PlayerInput::MOVE_RIGHT, 0, 0).unwrap();
        let lockstep::network::protocol::ClientMessage::Input {
            frame_id: claimed,
            input_data,
        } = envelope
        else {
            panic!("next_input must produce an input envelope");
        };
        room.submit_input("alice", claimed, &input_data).unwrap();
        room.submit_input("bob", 5, &input(5, 1, PlayerInput::MOVE_DOWN).serialize())
            .unwrap();

        let frame = room.tick().unwrap();
        let payload = GameFramePayload::from_frame(&frame);
        let event = alice
            .handle_message(ServerMessage::GameFrame(payload.clone()))
            .unwrap();
        bob.handle_message(ServerMessage::GameFrame(payload)).unwrap();

        assert_eq!(
            event,
            Some(ClientEvent::FrameApplied {
                frame_id: 5,
                rolled_back: true
            })
        );
        assert_eq!(alice.rollback_count(), rollbacks_before + 1);

        // Alice's predicted state now equals bob's authoritative view.
        assert_eq!(
            alice.state().unwrap().compute_state_hash(),
            bob.state().unwrap().compute_state_hash()
        );
    }

    /// S4: an input 101 frames ahead is rejected and counts toward the
    /// submitting player's violation window.
    #[test]
    fn s4_far_future_input_rejected() {
        let (mut room, _alice, _bob) = start_two_player_room("room_s4");
        let mut gate = ConnectionGate::new(GateConfig::default());

        let current = room.current_frame().unwrap();
        let ahead = current + 101;
        let result = room.submit_input("alice", ahead, &input(ahead, 0, 0).serialize());

        assert!(matches!(
            result,
            Err(RoomError::Input(InputError::FrameOutOfWindow { .. }))
        ));
        if result.is_err() {
            gate.record_violation();
        }
        assert_eq!(gate.violation_count(), 1);

        // Engine untouched.
        assert_eq!(room.current_frame(), Some(current));
    }

    /// S5: an oversized envelope is dropped and counted; no frame-engine
    /// state changes.
    #[test]
    fn s5_oversized_message_dropped() {
        let (room, _alice, _bob) = start_two_player_room("room_s5");
        let mut gate = ConnectionGate::new(GateConfig::default());

        let decision = gate.check_message(11 * 1024);
        assert_eq!(decision, GateDecision::Drop(DropReason::Oversized));
        assert!(11 * 1024 > MAX_MESSAGE_BYTES);
        assert_eq!(gate.violation_count(), 1);
        assert_eq!(room.current_frame(), Some(0));
    }

    /// S6 / P9: a player disconnects at frame 120 and reconnects with
    /// last_frame 119; after consuming sync_frames their state hash
    /// equals the server's and the always-connected peer's at 150.
    #[test]
    fn s6_reconnect_catches_up() {
        let (mut room, mut alice, mut bob) = start_two_player_room("room_s6");

        let run_frame = |room: &mut Room, frame_id: u32, with_bob: bool| -> lockstep::Frame {
            room.submit_input(
                "alice",
                frame_id,
                &input(frame_id, 0, PlayerInput::MOVE_RIGHT).serialize(),
            )
            .unwrap();
            if with_bob {
                room.submit_input(
                    "bob",
                    frame_id,
                    &input(frame_id, 1, PlayerInput::MOVE_UP).serialize(),
                )
                .unwrap();
                room.tick().unwrap()
            } else {
                // Bob is gone; the tick starves and is forced.
                assert!(room.tick().is_none());
                room.maybe_force_tick(Duration::ZERO).unwrap()
            }
        };

        // Frames 0..=119 with both players connected.
        for frame_id in 0..120u32 {
            let frame = run_frame(&mut room, frame_id, true);
            deliver(&frame, &mut [&mut alice, &mut bob]);
        }
        assert_eq!(bob.last_confirmed_frame(), Some(119));

        // Bob drops at frame 120; frames 120..=149 are forced through.
        assert!(room.remove("bob"));
        for frame_id in 120..150u32 {
            let frame = run_frame(&mut room, frame_id, false);
            deliver(&frame, &mut [&mut alice]);
        }
        assert_eq!(room.current_frame(), Some(150));

        // Bob reconnects and requests everything after frame 119.
        assert_eq!(room.reconnect("bob", outbound()), Some(1));
        let sync = room.sync_response(119).expect("started room must sync");
        match &sync {
            ServerMessage::SyncFrames { frames } => {
                assert_eq!(frames.len(), 30);
                assert_eq!(frames.first().unwrap().frame_id, 120);
                assert_eq!(frames.last().unwrap().frame_id, 149);
            }
            other => panic!("expected sync_frames, got {other:?}"),
        }

        let event = bob.handle_message(sync).unwrap();
        assert_eq!(event, Some(ClientEvent::CaughtUp { frames: 30 }));

        let server_hash = room.state().unwrap().compute_state_hash();
        assert_eq!(bob.state().unwrap().compute_state_hash(), server_hash);
        assert_eq!(alice.state().unwrap().compute_state_hash(), server_hash);
        assert_eq!(bob.state().unwrap().frame_id, 150);
    }

    /// A gap wider than retained history falls back to a full snapshot
    /// restore that still converges on the server hash.
    #[test]
    fn reconnect_beyond_history_resyncs_fully() {
        let (mut room, mut alice, mut bob) = start_two_player_room("room_resync");

        // Bob leaves immediately; the room grinds on far past history.
        for frame_id in 0..3u32 {
            room.submit_input(
                "alice",
                frame_id,
                &input(frame_id, 0, PlayerInput::MOVE_RIGHT).serialize(),
            )
            .unwrap();
            room.submit_input(
                "bob",
                frame_id,
                &input(frame_id, 1, PlayerInput::MOVE_UP).serialize(),
            )
            .unwrap();
            let frame = room.tick().unwrap();
            deliver(&frame, &mut [&mut alice, &mut bob]);
        }

        room.remove("bob");
        for frame_id in 3..(MAX_FRAME_HISTORY + 50) {
            room.submit_input(
                "alice",
                frame_id,
                &input(frame_id, 0, PlayerInput::MOVE_RIGHT).serialize(),
            )
            .unwrap();
            assert!(room.tick().is_none());
            let frame = room.maybe_force_tick(Duration::ZERO).unwrap();
            deliver(&frame, &mut [&mut alice]);
        }

        room.reconnect("bob", outbound()).unwrap();
        let sync = room.sync_response(2).expect("sync response");
        assert!(matches!(sync, ServerMessage::ResyncFull { .. }));

        let event = bob.handle_message(sync).unwrap();
        assert_eq!(event, Some(ClientEvent::Resynced));

        let server_hash = room.state().unwrap().compute_state_hash();
        assert_eq!(bob.state().unwrap().compute_state_hash(), server_hash);
    }
}
