//! Headless Game Client
//!
//! Two layers: [`ClientSession`] is the pure protocol state machine
//! (roster tracking, slot derivation, prediction, catch-up) with no I/O,
//! and [`GameClient`] wraps it around a WebSocket connection. Keeping the
//! session pure is what lets the lockstep flow be exercised end-to-end in
//! tests without a socket.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::game::frame::Frame;
use crate::game::input::{PlayerInput, PlayerSlot};
use crate::game::predictor::ClientPredictor;
use crate::game::state::{GameState, StateValidator};
use crate::network::protocol::{ClientMessage, GameFramePayload, ProtocolError, ServerMessage};

/// Local input records retained for resubmission and debugging.
const MAX_INPUT_HISTORY: usize = 300;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Envelope encode/decode failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Server refused the handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Operation requires a started game.
    #[error("game has not started")]
    NotStarted,

    /// The connection is gone.
    #[error("connection closed")]
    Closed,

    /// Handshake deadline elapsed.
    #[error("timed out waiting for server")]
    Timeout,
}

/// Observable outcomes of handling one server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The match started; local simulation is initialized.
    GameStarted {
        /// Room-derived seed.
        seed: u32,
        /// Locked roster size.
        player_count: u32,
    },
    /// An authoritative frame was reconciled.
    FrameApplied {
        /// The frame id.
        frame_id: u32,
        /// Whether reconciliation required rollback + replay.
        rolled_back: bool,
    },
    /// Another player joined the lobby.
    PlayerJoined {
        /// Their id.
        player_id: String,
    },
    /// A player left.
    PlayerLeft {
        /// Their id.
        player_id: String,
    },
    /// Reconnect catch-up finished via frame replay.
    CaughtUp {
        /// Frames replayed.
        frames: usize,
    },
    /// Reconnect catch-up finished via full snapshot restore.
    Resynced,
    /// The server reported an error.
    ServerError {
        /// Error code.
        code: u16,
        /// Description.
        message: String,
    },
}

/// Pure client-side protocol state machine.
pub struct ClientSession {
    /// Our player id.
    pub player_id: String,
    /// The room we are in.
    pub room_id: String,
    roster: Vec<String>,
    slot: Option<PlayerSlot>,
    player_count: u32,
    predictor: Option<ClientPredictor>,
    validator: StateValidator,
    input_history: BTreeMap<u32, PlayerInput>,
    next_local_frame: u32,
    last_confirmed_frame: Option<u32>,
    catching_up: bool,
}

impl ClientSession {
    /// Create a session from the `join_success` roster.
    pub fn new(player_id: String, room_id: String, roster: Vec<String>) -> Self {
        Self {
            player_id,
            room_id,
            roster,
            slot: None,
            player_count: 0,
            predictor: None,
            validator: StateValidator::new(),
            input_history: BTreeMap::new(),
            next_local_frame: 0,
            last_confirmed_frame: None,
            catching_up: false,
        }
    }

    /// Current roster in join order.
    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    /// Our wire slot once the game started.
    pub fn slot(&self) -> Option<PlayerSlot> {
        self.slot
    }

    /// Whether the simulation is live.
    pub fn is_started(&self) -> bool {
        self.predictor.is_some()
    }

    /// Whether the session is replaying missed frames after a reconnect.
    pub fn is_catching_up(&self) -> bool {
        self.catching_up
    }

    /// Last authoritative frame applied.
    pub fn last_confirmed_frame(&self) -> Option<u32> {
        self.last_confirmed_frame
    }

    /// The predicted simulation state, once started.
    pub fn state(&self) -> Option<&GameState> {
        self.predictor.as_ref().map(|p| &p.state)
    }

    /// Rollbacks performed so far.
    pub fn rollback_count(&self) -> u64 {
        self.predictor.as_ref().map_or(0, |p| p.rollback_count)
    }

    /// Hash mismatches recorded against server-reported hashes.
    pub fn desync_count(&self) -> usize {
        self.validator.mismatches().len()
    }

    /// Build, predict and return the next local input as a wire message.
    ///
    /// The returned envelope must be sent to the server; the local
    /// simulation has already speculatively applied the tick.
    pub fn next_input(
        &mut self,
        flags: u8,
        target_x: i32,
        target_y: i32,
    ) -> Result<ClientMessage, ClientError> {
        let slot = self.slot.ok_or(ClientError::NotStarted)?;
        let predictor = self.predictor.as_mut().ok_or(ClientError::NotStarted)?;

        let frame_id = self.next_local_frame;
        let mut input = PlayerInput::new(frame_id, slot);
        input.flags = flags;
        input.target_x = target_x;
        input.target_y = target_y;

        let remotes: Vec<PlayerSlot> =
            (0..self.player_count as PlayerSlot).filter(|&s| s != slot).collect();
        predictor.predict(frame_id, &input, &remotes);

        self.input_history.insert(frame_id, input);
        while self.input_history.len() > MAX_INPUT_HISTORY {
            self.input_history.pop_first();
        }
        self.next_local_frame += 1;

        Ok(ClientMessage::Input {
            frame_id,
            input_data: serde_bytes::ByteBuf::from(input.serialize().to_vec()),
        })
    }

    /// A previously submitted local input, while retained.
    pub fn local_input(&self, frame_id: u32) -> Option<&PlayerInput> {
        self.input_history.get(&frame_id)
    }

    /// The reconnect request for the current position.
    pub fn reconnect_request(&self) -> ClientMessage {
        ClientMessage::Reconnect {
            player_id: self.player_id.clone(),
            room_id: self.room_id.clone(),
            last_frame: self.last_confirmed_frame.unwrap_or(0),
        }
    }

    /// Handle one server message, updating local state.
    pub fn handle_message(
        &mut self,
        message: ServerMessage,
    ) -> Result<Option<ClientEvent>, ClientError> {
        match message {
            ServerMessage::JoinSuccess { roster, .. } => {
                self.roster = roster;
                Ok(None)
            }

            ServerMessage::PlayerJoined { player_id } => {
                if !self.roster.contains(&player_id) {
                    self.roster.push(player_id.clone());
                }
                Ok(Some(ClientEvent::PlayerJoined { player_id }))
            }

            ServerMessage::PlayerLeft { player_id } => {
                // After the start the roster is frozen; in the lobby the
                // departing player vanishes from it.
                if !self.is_started() {
                    self.roster.retain(|id| id != &player_id);
                }
                Ok(Some(ClientEvent::PlayerLeft { player_id }))
            }

            ServerMessage::GameStart {
                seed, player_count, ..
            } => {
                let slot = self
                    .roster
                    .iter()
                    .position(|id| id == &self.player_id)
                    .map(|index| index as PlayerSlot)
                    .ok_or_else(|| {
                        ClientError::HandshakeFailed("not in roster at game start".into())
                    })?;

                let slots: Vec<PlayerSlot> = (0..player_count as PlayerSlot).collect();
                let state = GameState::initialize_match(seed, &slots);
                self.predictor = Some(ClientPredictor::new(state, slot));
                self.slot = Some(slot);
                self.player_count = player_count;
                self.next_local_frame = 0;

                info!(player = %self.player_id, slot, seed, "game started");
                Ok(Some(ClientEvent::GameStarted { seed, player_count }))
            }

            ServerMessage::GameFrame(payload) => {
                let frame = payload.to_frame()?;
                let predictor = self.predictor.as_mut().ok_or(ClientError::NotStarted)?;

                let result = predictor.on_server_frame(&frame);
                self.last_confirmed_frame = Some(frame.frame_id);
                self.validator
                    .record_hash(frame.frame_id, predictor.state.compute_state_hash());

                if result.rolled_back {
                    debug!(frame = frame.frame_id, "prediction diverged, rolled back");
                }
                Ok(Some(ClientEvent::FrameApplied {
                    frame_id: frame.frame_id,
                    rolled_back: result.rolled_back,
                }))
            }

            ServerMessage::SyncFrames { frames } => {
                let predictor = self.predictor.as_mut().ok_or(ClientError::NotStarted)?;

                self.catching_up = true;
                let replayed: Result<Vec<Frame>, ProtocolError> =
                    frames.iter().map(GameFramePayload::to_frame).collect();
                let replayed = replayed?;

                predictor.catch_up(&replayed);
                if let Some(last) = replayed.last() {
                    self.last_confirmed_frame = Some(last.frame_id);
                    self.next_local_frame = last.frame_id + 1;
                }
                self.catching_up = false;

                info!(frames = replayed.len(), "catch-up complete");
                Ok(Some(ClientEvent::CaughtUp {
                    frames: replayed.len(),
                }))
            }

            ServerMessage::ResyncFull { snapshot } => {
                let predictor = self.predictor.as_mut().ok_or(ClientError::NotStarted)?;

                let resumed = snapshot.frame_id;
                predictor.restore_full(snapshot);
                self.last_confirmed_frame = resumed.checked_sub(1);
                self.next_local_frame = resumed;
                self.catching_up = false;

                info!(frame = resumed, "restored from full snapshot");
                Ok(Some(ClientEvent::Resynced))
            }

            ServerMessage::Error { code, message } => {
                warn!(code, %message, "server error");
                Ok(Some(ClientEvent::ServerError { code, message }))
            }
        }
    }
}

/// WebSocket client wrapping a [`ClientSession`].
pub struct GameClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// The protocol session.
    pub session: ClientSession,
}

impl GameClient {
    /// Connect, authenticate and join a room.
    pub async fn connect(
        url: &str,
        player_id: &str,
        room_id: &str,
    ) -> Result<Self, ClientError> {
        let (mut ws, _) = connect_async(url).await?;

        let auth = ClientMessage::Auth {
            player_id: player_id.to_string(),
            room_id: room_id.to_string(),
            token: None,
        };
        ws.send(Message::Binary(auth.to_bytes()?)).await?;

        let reply = Self::next_server_message(&mut ws, Duration::from_secs(5)).await?;
        match reply {
            ServerMessage::JoinSuccess { roster, .. } => {
                info!(player = %player_id, room = %room_id, "joined");
                Ok(Self {
                    ws,
                    session: ClientSession::new(
                        player_id.to_string(),
                        room_id.to_string(),
                        roster,
                    ),
                })
            }
            ServerMessage::Error { code, message } => {
                Err(ClientError::HandshakeFailed(format!("{code}: {message}")))
            }
            other => Err(ClientError::HandshakeFailed(format!(
                "unexpected reply: {other:?}"
            ))),
        }
    }

    /// Re-dial after a connection loss and catch up from the session's
    /// last confirmed frame.
    pub async fn reconnect(&mut self, url: &str) -> Result<ClientEvent, ClientError> {
        let (mut ws, _) = connect_async(url).await?;

        let request = self.session.reconnect_request();
        ws.send(Message::Binary(request.to_bytes()?)).await?;

        let reply = Self::next_server_message(&mut ws, Duration::from_secs(5)).await?;
        self.ws = ws;

        self.session
            .handle_message(reply)?
            .ok_or(ClientError::Closed)
    }

    /// Submit the next local input (speculatively applied already).
    pub async fn send_input(
        &mut self,
        flags: u8,
        target_x: i32,
        target_y: i32,
    ) -> Result<(), ClientError> {
        let envelope = self.session.next_input(flags, target_x, target_y)?;
        self.ws
            .send(Message::Binary(envelope.to_bytes()?))
            .await?;
        Ok(())
    }

    /// Receive and handle the next server message. `Ok(None)` means the
    /// message updated state without a user-visible event.
    pub async fn recv_event(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let message = ServerMessage::from_bytes(&data)?;
                    return self.session.handle_message(message);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(ClientError::Transport(error)),
            }
        }
    }

    /// Announce departure and close the socket.
    pub async fn leave(mut self) -> Result<(), ClientError> {
        let _ = self
            .ws
            .send(Message::Binary(ClientMessage::Leave.to_bytes()?))
            .await;
        let _ = self.ws.close(None).await;
        Ok(())
    }

    async fn next_server_message(
        ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
        deadline: Duration,
    ) -> Result<ServerMessage, ClientError> {
        let received = timeout(deadline, ws.next())
            .await
            .map_err(|_| ClientError::Timeout)?;

        match received {
            Some(Ok(Message::Binary(data))) => Ok(ServerMessage::from_bytes(&data)?),
            Some(Ok(Message::Close(_))) | None => Err(ClientError::Closed),
            Some(Ok(other)) => Err(ClientError::HandshakeFailed(format!(
                "unexpected frame: {other:?}"
            ))),
            Some(Err(error)) => Err(ClientError::Transport(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::input::PlayerInput as Input;

    fn started_session(player_id: &str, roster: &[&str], seed: u32) -> ClientSession {
        let mut session = ClientSession::new(
            player_id.to_string(),
            "room_001".to_string(),
            roster.iter().map(|s| s.to_string()).collect(),
        );
        let event = session
            .handle_message(ServerMessage::GameStart {
                seed,
                player_count: roster.len() as u32,
                tick_rate: 30,
            })
            .unwrap();
        assert!(matches!(event, Some(ClientEvent::GameStarted { .. })));
        session
    }

    #[test]
    fn test_slot_from_roster_position() {
        let session = started_session("bob", &["alice", "bob"], 1);
        assert_eq!(session.slot(), Some(1));

        let session = started_session("alice", &["alice", "bob"], 1);
        assert_eq!(session.slot(), Some(0));
    }

    #[test]
    fn test_game_start_requires_membership() {
        let mut session =
            ClientSession::new("ghost".into(), "r".into(), vec!["alice".into()]);
        let result = session.handle_message(ServerMessage::GameStart {
            seed: 1,
            player_count: 1,
            tick_rate: 30,
        });
        assert!(matches!(result, Err(ClientError::HandshakeFailed(_))));
    }

    #[test]
    fn test_roster_tracking_in_lobby() {
        let mut session =
            ClientSession::new("a".into(), "r".into(), vec!["a".into()]);

        session
            .handle_message(ServerMessage::PlayerJoined { player_id: "b".into() })
            .unwrap();
        assert_eq!(session.roster(), ["a", "b"]);

        session
            .handle_message(ServerMessage::PlayerLeft { player_id: "b".into() })
            .unwrap();
        assert_eq!(session.roster(), ["a"]);
    }

    #[test]
    fn test_input_before_start_rejected() {
        let mut session =
            ClientSession::new("a".into(), "r".into(), vec!["a".into()]);
        assert!(matches!(
            session.next_input(0, 0, 0),
            Err(ClientError::NotStarted)
        ));
    }

    #[test]
    fn test_next_input_advances_frames() {
        let mut session = started_session("a", &["a", "b"], 5);

        let first = session.next_input(Input::MOVE_RIGHT, 0, 0).unwrap();
        let second = session.next_input(Input::MOVE_RIGHT, 0, 0).unwrap();

        match (first, second) {
            (
                ClientMessage::Input { frame_id: f0, .. },
                ClientMessage::Input { frame_id: f1, .. },
            ) => {
                assert_eq!(f0, 0);
                assert_eq!(f1, 1);
            }
            other => panic!("expected inputs, got {other:?}"),
        }

        assert!(session.local_input(0).is_some());
        assert!(session.local_input(1).is_some());
    }

    #[test]
    fn test_frame_applied_updates_confirmed() {
        let mut session = started_session("a", &["a", "b"], 5);

        let mut frame = Frame::new(0);
        frame.confirmed = true;
        frame.set_input(0, Input::new(0, 0).serialize());
        frame.set_input(1, Input::new(0, 1).serialize());

        let event = session
            .handle_message(ServerMessage::GameFrame(GameFramePayload::from_frame(
                &frame,
            )))
            .unwrap();

        assert_eq!(
            event,
            Some(ClientEvent::FrameApplied {
                frame_id: 0,
                rolled_back: false
            })
        );
        assert_eq!(session.last_confirmed_frame(), Some(0));
        assert_eq!(session.state().unwrap().frame_id, 1);
    }

    #[test]
    fn test_reconnect_request_carries_last_frame() {
        let mut session = started_session("a", &["a", "b"], 5);

        let mut frame = Frame::new(0);
        frame.confirmed = true;
        frame.set_input(0, Input::new(0, 0).serialize());
        frame.set_input(1, Input::new(0, 1).serialize());
        session
            .handle_message(ServerMessage::GameFrame(GameFramePayload::from_frame(
                &frame,
            )))
            .unwrap();

        match session.reconnect_request() {
            ClientMessage::Reconnect { last_frame, .. } => assert_eq!(last_frame, 0),
            other => panic!("expected reconnect, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_frames_catch_up() {
        let mut session = started_session("a", &["a", "b"], 5);

        let frames: Vec<GameFramePayload> = (0..10u32)
            .map(|frame_id| {
                let mut frame = Frame::new(frame_id);
                frame.confirmed = true;
                frame.set_input(0, Input::new(frame_id, 0).serialize());
                frame.set_input(1, Input::new(frame_id, 1).serialize());
                GameFramePayload::from_frame(&frame)
            })
            .collect();

        let event = session
            .handle_message(ServerMessage::SyncFrames { frames })
            .unwrap();

        assert_eq!(event, Some(ClientEvent::CaughtUp { frames: 10 }));
        assert_eq!(session.last_confirmed_frame(), Some(9));
        assert_eq!(session.state().unwrap().frame_id, 10);
        assert!(!session.is_catching_up());
    }

    #[test]
    fn test_resync_full_replaces_state() {
        let mut session = started_session("a", &["a", "b"], 5);

        let mut server_state = GameState::initialize_match(5, &[0, 1]);
        for frame_id in 0..400u32 {
            let mut frame = Frame::new(frame_id);
            frame.set_input(0, Input::new(frame_id, 0).serialize());
            frame.set_input(1, Input::new(frame_id, 1).serialize());
            server_state.step_frame(&frame);
        }
        let expected_hash = server_state.compute_state_hash();

        let event = session
            .handle_message(ServerMessage::ResyncFull {
                snapshot: server_state,
            })
            .unwrap();

        assert_eq!(event, Some(ClientEvent::Resynced));
        assert_eq!(session.state().unwrap().compute_state_hash(), expected_hash);
        assert_eq!(session.last_confirmed_frame(), Some(399));
    }

    #[test]
    fn test_server_error_surfaces() {
        let mut session =
            ClientSession::new("a".into(), "r".into(), vec!["a".into()]);
        let event = session
            .handle_message(ServerMessage::Error {
                code: 4004,
                message: "room is full".into(),
            })
            .unwrap();
        assert_eq!(
            event,
            Some(ClientEvent::ServerError {
                code: 4004,
                message: "room is full".into()
            })
        );
    }
}
