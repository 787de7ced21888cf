use crate::mirror::DungeonMirror;
use log::{debug, error, info, warn};
use shared::{
    Packet, PlayerCommand, SessionId, TurnNumber, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    nick: String,
    session_id: Option<SessionId>,
    connected: bool,
    mirror: DungeonMirror,
    acked_turn: Option<TurnNumber>,
    disconnect_reason: Option<String>,
}

impl Client {
    pub async fn new(server_addr: &str, nick: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            nick: nick.to_string(),
            session_id: None,
            connected: false,
            mirror: DungeonMirror::new(),
            acked_turn: None,
            disconnect_reason: None,
        })
    }

    pub fn mirror(&self) -> &DungeonMirror {
        &self.mirror
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Why the server dropped us, if it did.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    pub async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server as {}...", self.nick);

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            nick: self.nick.clone(),
        };
        self.send_packet(&packet).await
    }

    pub async fn send_action(
        &self,
        command: PlayerCommand,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&Packet::Action { command }).await
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connected {
            self.send_packet(&Packet::Disconnect).await?;
            self.connected = false;
        }
        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::Connected { session_id, turn } => {
                info!("Connected! Session ID: {} (turn {})", session_id, turn);
                self.session_id = Some(session_id);
                self.connected = true;
            }

            Packet::Notification(notification) => {
                if !self.mirror.apply(&notification) {
                    debug!("Ignoring duplicate record {}", notification.sequence);
                    return Ok(());
                }
                let turn = notification.turn;
                if self.acked_turn.map_or(true, |acked| turn > acked) {
                    self.send_packet(&Packet::Ack { turn }).await?;
                    self.acked_turn = Some(turn);
                }
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.session_id = None;
                self.disconnect_reason = Some(reason);
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
        Ok(())
    }

    /// Receives until the server sends `Exit` or drops the connection.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    if addr != self.server_addr {
                        continue;
                    }
                    match Packet::decode(&buffer[..len]) {
                        Ok(packet) => self.handle_packet(packet).await?,
                        Err(e) => warn!("Failed to deserialize packet: {}", e),
                    }
                }
                Err(e) => error!("Error receiving packet: {}", e),
            }

            if let Some(reason) = self.mirror.exit_reason() {
                info!("Server ended the game: {}", reason);
                self.connected = false;
                return Ok(());
            }
            if self.disconnect_reason.is_some() {
                return Ok(());
            }
        }
    }
}
