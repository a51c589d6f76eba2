//! WebSocket Game Server
//!
//! Accepts connections, runs the admission sequence (auth within 5 s,
//! id validation, room join), polices every message through the
//! per-connection gate, routes inputs into the owning room's frame
//! engine, and drives each started room on the 33 ms tick cadence with
//! the 1 s force-tick fallback.
//!
//! All game-state mutation for a room happens under that room's lock,
//! taken for the full tick or input submission; the ticker task is the
//! only committer, so frames leave in strictly ascending order.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::game::input::INPUT_SIZE;
use crate::network::gate::{ConnectionGate, GateConfig, GateDecision};
use crate::network::protocol::{close_code, ClientMessage, GameFramePayload, ServerMessage};
use crate::network::room::{Room, RoomError, RoomManager};
use crate::TICK_RATE;

/// Server configuration; the operational surface of the coordinator.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Room capacity.
    pub max_players: usize,
    /// Members required before `game_start`.
    pub start_threshold: usize,
    /// Logical ticks per second.
    pub tick_rate: u32,
    /// Starvation window before a forced commit.
    pub frame_timeout: Duration,
    /// Deadline for the `auth` message.
    pub auth_timeout: Duration,
    /// Idle cutoff for connections that stopped sending.
    pub heartbeat_timeout: Duration,
    /// How long an empty room survives.
    pub empty_room_timeout: Duration,
    /// How long a disconnected member may reconnect.
    pub disconnect_retention: Duration,
    /// Per-connection message rate limit.
    pub max_requests_per_second: u32,
    /// Transport message size cap.
    pub max_message_bytes: usize,
    /// Largest accepted `input_data` blob.
    pub max_input_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8765".parse().expect("static addr"),
            max_players: 4,
            start_threshold: 2,
            tick_rate: TICK_RATE,
            frame_timeout: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(20),
            empty_room_timeout: Duration::from_secs(60),
            disconnect_retention: Duration::from_secs(30),
            max_requests_per_second: 100,
            max_message_bytes: crate::network::protocol::MAX_MESSAGE_BYTES,
            max_input_size: INPUT_SIZE,
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Could not bind the listen address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket handshake or transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Registry entry for an authenticated connection. The sender feeds the
/// connection's own outbound queue, so maintenance can inject a close
/// frame that the connection loop observes and acts on.
struct ConnectionEntry {
    room_id: String,
    last_rx: Instant,
    sender: mpsc::Sender<Message>,
}

/// The lockstep game server.
pub struct GameServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    connections: Arc<RwLock<BTreeMap<String, ConnectionEntry>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: Arc::new(RoomManager::new()),
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Run until shutdown. Binds the configured address; a bind failure
    /// is the only fatal startup error.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("lockstep server listening on {}", self.config.bind_addr);

        let cleanup_rooms = self.rooms.clone();
        let cleanup_connections = self.connections.clone();
        let cleanup_config = self.config.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_rooms, cleanup_connections, cleanup_config).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "new connection");
                            self.handle_connection(stream, addr);
                        }
                        Err(error) => error!(%error, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Authenticated connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Live room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let rooms = self.rooms.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(error) => {
                    debug!(%addr, %error, "websocket handshake failed");
                    return;
                }
            };

            if let Err(error) =
                Self::run_connection(ws, addr, rooms, connections, config, shutdown_rx).await
            {
                debug!(%addr, %error, "connection ended with error");
            }
        });
    }

    async fn run_connection(
        ws: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        connections: Arc<RwLock<BTreeMap<String, ConnectionEntry>>>,
        config: ServerConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), GameServerError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Admission: the first message must be auth or reconnect, within
        // the deadline.
        let first = match timeout(config.auth_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(_) => return Ok(()),
            Err(_) => {
                let _ = ws_sender
                    .send(close_message(close_code::AUTH_TIMEOUT, "auth timeout"))
                    .await;
                return Ok(());
            }
        };

        let admission = match decode_admission(&first, &config) {
            Some(message) => message,
            None => {
                let _ = ws_sender
                    .send(close_message(close_code::AUTH_FAILED, "auth required"))
                    .await;
                return Ok(());
            }
        };

        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);

        let (player_id, room, room_id) = match admission {
            Admission::Join { player_id, room_id } => {
                let room = rooms
                    .get_or_create(&room_id, config.max_players, config.start_threshold)
                    .await;

                // One guard across the whole sequence: join, join_success,
                // player_joined, start check. A concurrent joiner cannot
                // interleave its own broadcasts before this player's
                // join_success is queued.
                let mut guard = room.write().await;
                match guard.join(&player_id, msg_tx.clone()) {
                    Ok(()) => {
                        let roster = guard.roster();
                        guard.send_to(
                            &player_id,
                            &ServerMessage::JoinSuccess {
                                room_id: room_id.clone(),
                                player_id: player_id.clone(),
                                roster,
                            },
                        );
                        guard.broadcast_except(
                            &ServerMessage::PlayerJoined {
                                player_id: player_id.clone(),
                            },
                            &player_id,
                        );
                        info!(player = %player_id, room = %room_id, "player joined");

                        let started = guard.should_start();
                        if started {
                            let (seed, player_count) = guard.start();
                            guard.broadcast(&ServerMessage::GameStart {
                                seed,
                                player_count,
                                tick_rate: config.tick_rate,
                            });
                        }
                        drop(guard);

                        if started {
                            Self::spawn_room_loop(room.clone(), config.clone());
                        }
                        (player_id, room, room_id)
                    }
                    Err(RoomError::RoomFull) => {
                        drop(guard);
                        let _ = send_error_now(
                            &mut ws_sender,
                            close_code::ROOM_FULL,
                            "room is full",
                        )
                        .await;
                        let _ = ws_sender
                            .send(close_message(close_code::ROOM_FULL, "room is full"))
                            .await;
                        return Ok(());
                    }
                    Err(error) => {
                        drop(guard);
                        let _ = send_error_now(
                            &mut ws_sender,
                            close_code::AUTH_FAILED,
                            &error.to_string(),
                        )
                        .await;
                        let _ = ws_sender
                            .send(close_message(close_code::AUTH_FAILED, "join refused"))
                            .await;
                        return Ok(());
                    }
                }
            }
            Admission::Reconnect {
                player_id,
                room_id,
                last_frame,
            } => {
                let Some(room) = rooms.get(&room_id).await else {
                    let _ = ws_sender
                        .send(close_message(close_code::AUTH_FAILED, "unknown room"))
                        .await;
                    return Ok(());
                };

                // Single guard: the catch-up response is queued before the
                // ticker can broadcast a newer frame to this member.
                let reconnected = {
                    let mut guard = room.write().await;
                    match guard.reconnect(&player_id, msg_tx.clone()) {
                        Some(_slot) => match guard.sync_response(last_frame) {
                            Some(response) => {
                                guard.send_to(&player_id, &response);
                                true
                            }
                            None => false,
                        },
                        None => false,
                    }
                };

                if reconnected {
                    info!(player = %player_id, room = %room_id, "player reconnected");
                    (player_id, room, room_id)
                } else {
                    let _ = ws_sender
                        .send(close_message(
                            close_code::AUTH_FAILED,
                            "reconnect window expired",
                        ))
                        .await;
                    return Ok(());
                }
            }
        };

        connections.write().await.insert(
            player_id.clone(),
            ConnectionEntry {
                room_id: room_id.clone(),
                last_rx: Instant::now(),
                sender: msg_tx.clone(),
            },
        );

        let mut gate = ConnectionGate::new(GateConfig {
            max_requests_per_second: config.max_requests_per_second,
            max_message_bytes: config.max_message_bytes,
            ..GateConfig::default()
        });

        // The loop owns both halves: incoming frames are policed and
        // dispatched, queued outbound messages (room broadcasts, injected
        // close frames from maintenance) are pumped onto the socket. A
        // forwarded close frame ends the loop.
        loop {
            tokio::select! {
                outgoing = msg_rx.recv() => {
                    match outgoing {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if ws_sender.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            touch_connection(&connections, &player_id).await;

                            match gate.check_message(data.len()) {
                                GateDecision::Accept => {}
                                GateDecision::Drop(reason) => {
                                    debug!(player = %player_id, ?reason, "message dropped");
                                    continue;
                                }
                                GateDecision::Close(code) => {
                                    warn!(player = %player_id, code, "gate closed connection");
                                    let _ = ws_sender.send(close_message(code, "policy")).await;
                                    break;
                                }
                            }

                            let message = match ClientMessage::from_bytes(&data) {
                                Ok(message) => message,
                                Err(error) => {
                                    debug!(player = %player_id, %error, "malformed envelope");
                                    continue;
                                }
                            };

                            if let Some(code) =
                                Self::dispatch(&message, &player_id, &room, &mut gate, &config)
                                    .await
                            {
                                let _ = ws_sender
                                    .send(close_message(code, "closing"))
                                    .await;
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            touch_connection(&connections, &player_id).await;
                            let _ = ws_sender.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            // Text and other frames are not part of the
                            // protocol; count them as noise and move on.
                            debug!(player = %player_id, "non-binary frame ignored");
                        }
                        Some(Err(error)) => {
                            debug!(player = %player_id, %error, "receive error");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = ws_sender
                        .send(close_message(CloseCode::Away.into(), "server shutdown"))
                        .await;
                    break;
                }
            }
        }

        Self::handle_disconnect(&player_id, &room, &connections).await;
        debug!(player = %player_id, %addr, "connection closed");
        Ok(())
    }

    /// Handle one decoded message. Returns the close code to shut the
    /// connection down with, or `None` to keep going.
    async fn dispatch(
        message: &ClientMessage,
        player_id: &str,
        room: &Arc<RwLock<Room>>,
        gate: &mut ConnectionGate,
        config: &ServerConfig,
    ) -> Option<u16> {
        match message {
            ClientMessage::Input {
                frame_id,
                input_data,
            } => {
                if input_data.len() > config.max_input_size {
                    if gate.record_violation() {
                        return Some(close_code::POLICY_VIOLATION);
                    }
                    return None;
                }

                let result = {
                    let mut guard = room.write().await;
                    guard.submit_input(player_id, *frame_id, input_data)
                };

                if let Err(error) = result {
                    debug!(player = %player_id, %error, "input rejected");
                    if gate.record_violation() {
                        return Some(close_code::POLICY_VIOLATION);
                    }
                }
                None
            }
            ClientMessage::Leave => Some(CloseCode::Normal.into()),
            ClientMessage::Auth { .. } | ClientMessage::Reconnect { .. } => {
                // Session is already established; repeated handshakes are
                // protocol noise.
                debug!(player = %player_id, "unexpected handshake message");
                None
            }
        }
    }

    async fn handle_disconnect(
        player_id: &str,
        room: &Arc<RwLock<Room>>,
        connections: &Arc<RwLock<BTreeMap<String, ConnectionEntry>>>,
    ) {
        connections.write().await.remove(player_id);

        let mut guard = room.write().await;
        if guard.remove(player_id) {
            guard.broadcast(&ServerMessage::PlayerLeft {
                player_id: player_id.to_string(),
            });
            info!(player = %player_id, room = %guard.room_id, "player left");
        }
    }

    /// Per-room ticker: poll the engine every tick interval, force-commit
    /// after the starvation timeout, broadcast every committed frame in
    /// order.
    fn spawn_room_loop(room: Arc<RwLock<Room>>, config: ServerConfig) {
        tokio::spawn(async move {
            let tick = Duration::from_micros(1_000_000 / config.tick_rate.max(1) as u64);
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let mut guard = room.write().await;
                if guard.closed {
                    break;
                }

                let committed = match guard.tick() {
                    Some(frame) => Some(frame),
                    None => guard.maybe_force_tick(config.frame_timeout),
                };

                if let Some(frame) = committed {
                    let payload = GameFramePayload::from_frame(&frame);
                    guard.broadcast(&ServerMessage::GameFrame(payload));
                }
            }

            debug!("room ticker exited");
        });
    }

    /// Periodic maintenance: drop idle connections, expire reconnect
    /// windows, destroy long-empty rooms.
    async fn run_cleanup_loop(
        rooms: Arc<RoomManager>,
        connections: Arc<RwLock<BTreeMap<String, ConnectionEntry>>>,
        config: ServerConfig,
    ) {
        let mut ticker = interval(Duration::from_secs(5));

        loop {
            ticker.tick().await;

            // Idle connections: queue a close frame on the connection's
            // own outbound channel; its loop forwards the frame and
            // exits, running the normal disconnect teardown. Membership
            // is also removed here so a socket wedged in a blocked send
            // cannot keep a ghost in the room.
            let idle: Vec<(String, String, mpsc::Sender<Message>)> = {
                let guard = connections.read().await;
                guard
                    .iter()
                    .filter(|(_, entry)| entry.last_rx.elapsed() > config.heartbeat_timeout)
                    .map(|(player, entry)| {
                        (player.clone(), entry.room_id.clone(), entry.sender.clone())
                    })
                    .collect()
            };

            for (player_id, room_id, sender) in idle {
                warn!(player = %player_id, "heartbeat timeout");
                let _ = sender
                    .try_send(close_message(CloseCode::Away.into(), "heartbeat timeout"));

                connections.write().await.remove(&player_id);
                if let Some(room) = rooms.get(&room_id).await {
                    let mut guard = room.write().await;
                    if guard.remove(&player_id) {
                        guard.broadcast(&ServerMessage::PlayerLeft {
                            player_id: player_id.clone(),
                        });
                    }
                }
            }

            rooms
                .cleanup(config.empty_room_timeout, config.disconnect_retention)
                .await;
        }
    }
}

/// What the first message resolved to.
enum Admission {
    Join {
        player_id: String,
        room_id: String,
    },
    Reconnect {
        player_id: String,
        room_id: String,
        last_frame: u32,
    },
}

fn decode_admission(message: &Message, config: &ServerConfig) -> Option<Admission> {
    let Message::Binary(data) = message else {
        return None;
    };
    if data.len() > config.max_message_bytes {
        return None;
    }

    match ClientMessage::from_bytes(data).ok()? {
        ClientMessage::Auth {
            player_id, room_id, ..
        } => {
            if valid_identifier(&player_id) && valid_identifier(&room_id) {
                Some(Admission::Join { player_id, room_id })
            } else {
                None
            }
        }
        ClientMessage::Reconnect {
            player_id,
            room_id,
            last_frame,
        } => {
            if valid_identifier(&player_id) && valid_identifier(&room_id) {
                Some(Admission::Reconnect {
                    player_id,
                    room_id,
                    last_frame,
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Identifiers are non-empty printable ASCII, at most 64 bytes.
fn valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| (0x21..=0x7E).contains(&b))
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

async fn send_error_now(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    code: u16,
    message: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let error = ServerMessage::Error {
        code,
        message: message.to_string(),
    };
    match error.to_bytes() {
        Ok(bytes) => sink.send(Message::Binary(bytes)).await,
        Err(_) => Ok(()),
    }
}

async fn touch_connection(
    connections: &Arc<RwLock<BTreeMap<String, ConnectionEntry>>>,
    player_id: &str,
) {
    if let Some(entry) = connections.write().await.get_mut(player_id) {
        entry.last_rx = Instant::now();
    }
}
