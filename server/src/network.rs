//! Server network layer handling UDP communications
//!
//! The receive loop turns client packets into pipeline operations:
//!
//! - `Connect` registers a session backed by a [`UdpTransport`] on the shared
//!   socket and publishes the current map through the notification queue
//! - `Ack` advances the session's acknowledged turn
//! - `Action` forwards a player command to the `player-commands` producer
//! - `Disconnect` removes the session
//!
//! Outgoing notifications never pass through here; the dispatcher sends them
//! through each session's transport.

use crate::commands::QueuedCommand;
use crate::game::GameMap;
use crate::game_session::GameSession;
use crate::notification_queue::{NotificationQueue, QueueError};
use crate::session_registry::SessionRegistry;
use crate::transport::UdpTransport;
use log::{debug, error, info, warn};
use shared::{Packet, Payload, SessionId, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::interval;

/// Sessions silent for longer than this are dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gold a newly seated player starts with.
pub const STARTING_GOLD: u32 = 1_000;

pub struct Server {
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<SessionRegistry>>,
    queue: NotificationQueue,
    map: Arc<RwLock<GameMap>>,
    commands: mpsc::UnboundedSender<QueuedCommand>,
    client_timeout: Duration,
}

impl Server {
    pub async fn bind(addr: &str, session: &GameSession) -> Result<Self, std::io::Error> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        Ok(Server {
            socket,
            sessions: session.sessions(),
            queue: session.queue(),
            map: session.map(),
            commands: session.command_sender(),
            client_timeout: CLIENT_TIMEOUT,
        })
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Receives and handles packets until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let mut timeout_check = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => match Packet::decode(&buffer[..len]) {
                        Ok(packet) => self.handle_packet(packet, addr).await,
                        Err(_) => warn!("Failed to deserialize packet from {}", addr),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = timeout_check.tick() => {
                    let timed_out = self.sessions.write().await.check_timeouts(self.client_timeout);
                    for session_id in timed_out {
                        info!("Session {} timed out", session_id);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Network receiver stopped");
    }

    async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        let data = match packet.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode packet for {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, addr).await {
            error!("Failed to send packet to {}: {}", addr, e);
        }
    }

    async fn session_at(&self, addr: SocketAddr) -> Option<SessionId> {
        self.sessions.read().await.find_by_peer(&addr.to_string())
    }

    /// Processes one incoming packet
    async fn handle_packet(&self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                nick,
            } => {
                info!(
                    "Client {} connecting from {} (version: {})",
                    nick, addr, client_version
                );
                if client_version != PROTOCOL_VERSION {
                    let response = Packet::Disconnected {
                        reason: format!("Protocol version {} required", PROTOCOL_VERSION),
                    };
                    self.send_packet(&response, addr).await;
                    return;
                }
                self.accept(nick, addr).await;
            }

            Packet::Ack { turn } => {
                if let Some(session_id) = self.session_at(addr).await {
                    self.sessions.write().await.acknowledge(session_id, turn);
                }
            }

            Packet::Action { command } => {
                let Some(session_id) = self.session_at(addr).await else {
                    warn!("Action from unknown client at {}", addr);
                    return;
                };
                let nick = {
                    let mut sessions = self.sessions.write().await;
                    sessions.touch(session_id);
                    sessions
                        .get(&session_id)
                        .map(|session| session.nick.clone())
                        .unwrap_or_default()
                };
                let queued = QueuedCommand {
                    session_id,
                    nick,
                    seat: session_id,
                    command,
                };
                if let Err(e) = self.commands.send(queued) {
                    error!("Failed to forward command to producer: {}", e);
                }
            }

            Packet::Disconnect => {
                if let Some(session_id) = self.session_at(addr).await {
                    self.sessions.write().await.remove_session(&session_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn accept(&self, nick: String, addr: SocketAddr) {
        // Remove existing connection if present
        let session_id = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.find_by_peer(&addr.to_string()) {
                info!("Removing existing session {} from {}", existing, addr);
                sessions.remove_session(&existing);
            }
            let transport = Arc::new(UdpTransport::new(Arc::clone(&self.socket), addr));
            sessions.add_session(&nick, transport)
        };

        let Some(session_id) = session_id else {
            let response = Packet::Disconnected {
                reason: "Server full".to_string(),
            };
            self.send_packet(&response, addr).await;
            return;
        };

        let turn = self.queue.gate().clock().current_turn();
        self.send_packet(&Packet::Connected { session_id, turn }, addr)
            .await;

        {
            let mut map = self.map.write().await;
            if map.seat(session_id).is_none() {
                map.add_seat(session_id, STARTING_GOLD);
            }
        }

        let queue = self.queue.clone();
        let map = Arc::clone(&self.map);
        tokio::spawn(async move {
            if let Err(e) = publish_map(&queue, &map, &nick).await {
                warn!("Could not publish map for session {}: {}", session_id, e);
            }
        });
    }
}

/// Queues the whole map for a player who just joined, followed by a join
/// message.
///
/// The snapshot is taken under a live ticket and the map lock is held until
/// every record is queued, so no change made after the snapshot can be queued
/// ahead of it.
pub async fn publish_map(
    queue: &NotificationQueue,
    map: &RwLock<GameMap>,
    nick: &str,
) -> Result<usize, QueueError> {
    let gate = queue.gate();
    let ticket = gate.register_when_open("network").await?;

    let result = {
        let map = map.read().await;
        let mut payloads = map.full_snapshot();
        payloads.push(Payload::Chat {
            nick: "server".to_string(),
            message: format!("{} joined the game", nick),
        });
        queue.enqueue_all(&ticket, payloads)
    };

    if let Err(e) = gate.complete_work(ticket) {
        debug!("Map for {} finished after its turn closed: {}", nick, e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::game_session::SessionOptions;
    use crate::session_registry::SessionState;
    use crate::transport::ChannelTransport;
    use crate::turn_clock::TurnClock;
    use crate::turn_gate::{TurnGate, TurnOutcome};
    use shared::{CreatureSnapshot, PlayerCommand, TileSnapshot};
    use std::collections::HashMap;

    /// What a client holds after applying `payloads` in order.
    #[derive(Default)]
    struct Replayed {
        tiles: HashMap<(i32, i32), TileSnapshot>,
        creatures: HashMap<String, CreatureSnapshot>,
    }

    impl Replayed {
        fn from_payloads(payloads: impl IntoIterator<Item = Payload>) -> Self {
            let mut replayed = Self::default();
            for payload in payloads {
                match payload {
                    Payload::TileChange(tile) => {
                        replayed.tiles.insert((tile.x, tile.y), tile);
                    }
                    Payload::CreatureAdded(creature) | Payload::CreatureUpdate(creature) => {
                        replayed.creatures.insert(creature.name.clone(), creature);
                    }
                    Payload::CreatureRemoved { name } => {
                        replayed.creatures.remove(&name);
                    }
                    _ => {}
                }
            }
            replayed
        }

        fn assert_matches(&self, map: &GameMap) {
            for payload in map.full_snapshot() {
                match payload {
                    Payload::TileChange(tile) => {
                        assert_eq!(self.tiles.get(&(tile.x, tile.y)), Some(&tile));
                    }
                    Payload::CreatureAdded(creature) => {
                        assert_eq!(self.creatures.get(&creature.name), Some(&creature));
                    }
                    _ => {}
                }
            }
            assert_eq!(self.creatures.len(), map.creatures().count());
        }
    }

    async fn start() -> (GameSession, SocketAddr, tokio::task::JoinHandle<()>) {
        let config = PipelineConfig::default().with_turns_per_second(20.0);
        let options = SessionOptions {
            creature_ai: false,
            ..SessionOptions::default()
        };
        let session = GameSession::start(config, GameMap::with_starting_dungeon(9, 9, 1), options)
            .unwrap();
        let server = Server::bind("127.0.0.1:0", &session).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run(session.shutdown_signal()));
        (session, addr, handle)
    }

    async fn recv(socket: &UdpSocket) -> Packet {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Packet::decode(&buf[..len]).unwrap()
    }

    async fn send(socket: &UdpSocket, packet: &Packet, addr: SocketAddr) {
        socket.send_to(&packet.encode().unwrap(), addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_creates_session() {
        let (session, addr, handle) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            nick: "keeper".to_string(),
        };
        send(&client, &connect, addr).await;

        let Packet::Connected { session_id, .. } = recv(&client).await else {
            panic!("expected Connected");
        };
        assert_eq!(session_id, 1);
        let state = session.sessions().read().await.state(&session_id);
        assert!(matches!(
            state,
            Some(SessionState::Connecting) | Some(SessionState::Active)
        ));
        assert!(session.map().read().await.seat(1).is_some());

        session.shutdown("done").await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (session, addr, handle) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION + 1,
            nick: "old".to_string(),
        };
        send(&client, &connect, addr).await;

        assert!(matches!(recv(&client).await, Packet::Disconnected { .. }));
        assert!(session.sessions().read().await.is_empty());

        session.shutdown("done").await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_action_reaches_clients_and_disconnect_removes() {
        let (session, addr, handle) = start().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            nick: "keeper".to_string(),
        };
        send(&client, &connect, addr).await;
        assert!(matches!(recv(&client).await, Packet::Connected { .. }));

        let chat = Packet::Action {
            command: PlayerCommand::Chat {
                message: "anyone there?".to_string(),
            },
        };
        send(&client, &chat, addr).await;

        loop {
            let Packet::Notification(notification) = recv(&client).await else {
                continue;
            };
            if let Payload::Chat { nick, message } = notification.payload {
                if message == "anyone there?" {
                    assert_eq!(nick, "keeper");
                    break;
                }
            }
        }

        send(&client, &Packet::Disconnect, addr).await;
        let sessions = session.sessions();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sessions.read().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        session.shutdown("done").await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_map_is_not_older_than_a_change_made_while_waiting() {
        let config = PipelineConfig::default().with_wait_for_dispatch(false);
        let gate = Arc::new(TurnGate::new(Arc::new(TurnClock::new()), &config));
        let (queue, mut receiver) = NotificationQueue::new(Arc::clone(&gate), 10_000);
        let map = Arc::new(RwLock::new(GameMap::with_starting_dungeon(15, 15, 1)));

        // Turn 0 has closed, so the join waits for turn 1 to open
        assert_eq!(
            gate.await_turn_complete(0).await.unwrap(),
            TurnOutcome::Completed
        );
        let join = tokio::spawn({
            let queue = queue.clone();
            let map = Arc::clone(&map);
            async move { publish_map(&queue, &map, "joiner").await }
        });
        tokio::task::yield_now().await;
        gate.advance().unwrap();

        let ticket = gate.register_current("player-commands").unwrap();
        {
            let mut map = map.write().await;
            let change = map.mark_tile(10, 7, true).unwrap();
            queue.enqueue(&ticket, change).unwrap();
        }
        gate.complete_work(ticket).unwrap();

        let published = join.await.unwrap().unwrap();
        assert!(published > 1);

        let mut payloads = Vec::new();
        while let Some(notification) = receiver.try_dequeue() {
            assert_eq!(notification.turn, 1);
            payloads.push(notification.payload);
        }
        let replayed = Replayed::from_payloads(payloads);
        let map = map.read().await;
        assert!(map.tile(10, 7).unwrap().marked_for_digging);
        assert!(replayed.tiles[&(10, 7)].marked_for_digging);
        replayed.assert_matches(&map);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joins_during_play_leave_clients_on_the_live_map() {
        let config = PipelineConfig::default().with_turns_per_second(200.0);
        let options = SessionOptions {
            ai_seed: Some(17),
            ..SessionOptions::default()
        };
        let session =
            GameSession::start(config, GameMap::with_starting_dungeon(15, 15, 1), options)
                .unwrap();
        let map = session.map();

        let (transport, mut records) = ChannelTransport::new("watcher", 100_000);
        session
            .sessions()
            .write()
            .await
            .add_session("watcher", Arc::new(transport))
            .unwrap();
        publish_map(&session.queue(), &map, "watcher").await.unwrap();

        let commands = session.command_sender();
        let mut joins = Vec::new();
        for round in 0..20 {
            commands
                .send(QueuedCommand {
                    session_id: 1,
                    nick: "watcher".to_string(),
                    seat: 1,
                    command: PlayerCommand::MarkTile {
                        x: 10,
                        y: 7,
                        marked: round % 2 == 0,
                    },
                })
                .unwrap();
            let queue = session.queue();
            let map = Arc::clone(&map);
            joins.push(tokio::spawn(async move {
                publish_map(&queue, &map, &format!("joiner-{}", round)).await
            }));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let clock = Arc::clone(session.gate().clock());
        let turn = clock.current_turn();
        tokio::time::timeout(Duration::from_secs(5), clock.wait_for_turn_after(turn + 2))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.shutdown("done"))
            .await
            .unwrap()
            .unwrap();

        let mut payloads = Vec::new();
        while let Ok(bytes) = records.try_recv() {
            let Packet::Notification(notification) = Packet::decode(&bytes).unwrap() else {
                panic!("unexpected packet");
            };
            payloads.push(notification.payload);
        }
        assert!(matches!(payloads.last(), Some(Payload::Exit { .. })));

        let replayed = Replayed::from_payloads(payloads);
        replayed.assert_matches(&*map.read().await);
    }
}
