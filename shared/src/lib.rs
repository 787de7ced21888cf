use serde::{Deserialize, Serialize};

pub mod snapshot;

pub use snapshot::{
    CreatureJob, CreatureSnapshot, GoalSnapshot, LightSnapshot, ParseJobError, PlayerCommand,
    RoomSnapshot, RoomType, SeatId, TileSnapshot, TileType, TrapSnapshot, TrapType,
};

/// Simulation turn. Starts at 0 and only ever moves forward by one.
pub type TurnNumber = u64;

/// Server-assigned identifier of a connected client session.
pub type SessionId = u32;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
        nick: String,
    },
    Ack {
        turn: TurnNumber,
    },
    Action {
        command: PlayerCommand,
    },
    Disconnect,

    Connected {
        session_id: SessionId,
        turn: TurnNumber,
    },
    Notification(Notification),
    Disconnected {
        reason: String,
    },
}

impl Packet {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// A turn-tagged description of one change to the dungeon.
///
/// `sequence` is assigned at enqueue time and is strictly increasing in queue
/// order, which lets receivers discard duplicates.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    pub turn: TurnNumber,
    pub sequence: u64,
    pub payload: Payload,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    TurnStarted,
    TileChange,
    CreatureUpdate,
    RoomChange,
    TrapChange,
    LightChange,
    PlayerAction,
    GoalUpdate,
    Chat,
    Exit,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Payload {
    TurnStarted { turns_per_second: f64 },
    TileChange(TileSnapshot),
    CreatureAdded(CreatureSnapshot),
    CreatureUpdate(CreatureSnapshot),
    CreatureRemoved { name: String },
    RoomChange(RoomSnapshot),
    RoomRemoved { name: String },
    TrapChange(TrapSnapshot),
    TrapRemoved { name: String },
    LightChange(LightSnapshot),
    LightRemoved { name: String },
    PlayerAction { seat: SeatId, command: PlayerCommand },
    GoalUpdate(GoalSnapshot),
    Chat { nick: String, message: String },
    Exit { reason: String },
}

impl Payload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Payload::TurnStarted { .. } => NotificationKind::TurnStarted,
            Payload::TileChange(_) => NotificationKind::TileChange,
            Payload::CreatureAdded(_)
            | Payload::CreatureUpdate(_)
            | Payload::CreatureRemoved { .. } => NotificationKind::CreatureUpdate,
            Payload::RoomChange(_) | Payload::RoomRemoved { .. } => NotificationKind::RoomChange,
            Payload::TrapChange(_) | Payload::TrapRemoved { .. } => NotificationKind::TrapChange,
            Payload::LightChange(_) | Payload::LightRemoved { .. } => {
                NotificationKind::LightChange
            }
            Payload::PlayerAction { .. } => NotificationKind::PlayerAction,
            Payload::GoalUpdate(_) => NotificationKind::GoalUpdate,
            Payload::Chat { .. } => NotificationKind::Chat,
            Payload::Exit { .. } => NotificationKind::Exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sample_creature() -> CreatureSnapshot {
        CreatureSnapshot {
            name: "Kobold_3".to_string(),
            class_name: "Kobold".to_string(),
            job: CreatureJob::BasicWorker,
            seat: 1,
            x: 4.0,
            y: 7.5,
            hp: 10.0,
            max_hp: 12.0,
            level: 1,
        }
    }

    #[test]
    fn test_payload_kinds() {
        let creature = sample_creature();
        assert_eq!(
            Payload::CreatureAdded(creature.clone()).kind(),
            NotificationKind::CreatureUpdate
        );
        assert_eq!(
            Payload::CreatureRemoved {
                name: creature.name
            }
            .kind(),
            NotificationKind::CreatureUpdate
        );
        assert_eq!(
            Payload::RoomRemoved {
                name: "Quarters_1".to_string()
            }
            .kind(),
            NotificationKind::RoomChange
        );
        assert_eq!(
            Payload::Exit {
                reason: "shutdown".to_string()
            }
            .kind(),
            NotificationKind::Exit
        );
    }

    #[test]
    fn test_packet_serialization_notification() {
        let packet = Packet::Notification(Notification {
            turn: 42,
            sequence: 7,
            payload: Payload::CreatureUpdate(sample_creature()),
        });

        let bytes = packet.encode().unwrap();
        assert!(bytes.len() < MAX_PACKET_SIZE);

        match Packet::decode(&bytes).unwrap() {
            Packet::Notification(notification) => {
                assert_eq!(notification.turn, 42);
                assert_eq!(notification.sequence, 7);
                assert_eq!(notification.kind(), NotificationKind::CreatureUpdate);
                match notification.payload {
                    Payload::CreatureUpdate(creature) => {
                        assert_eq!(creature.name, "Kobold_3");
                        assert_approx_eq!(creature.y, 7.5, 1e-9);
                    }
                    other => panic!("Wrong payload after deserialization: {:?}", other),
                }
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_connect() {
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            nick: "keeper".to_string(),
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Packet::decode(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
