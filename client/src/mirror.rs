//! Client-side copy of the dungeon, rebuilt from notifications.
//!
//! The mirror only ever moves forward: a notification whose sequence is not
//! newer than the last one applied is ignored, which makes re-delivery
//! harmless.

use shared::{
    CreatureSnapshot, GoalSnapshot, LightSnapshot, Notification, Payload, RoomSnapshot, SeatId,
    TileSnapshot, TrapSnapshot, TurnNumber,
};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default, Clone)]
pub struct DungeonMirror {
    tiles: HashMap<(i32, i32), TileSnapshot>,
    creatures: BTreeMap<String, CreatureSnapshot>,
    rooms: BTreeMap<String, RoomSnapshot>,
    traps: BTreeMap<String, TrapSnapshot>,
    lights: BTreeMap<String, LightSnapshot>,
    goals: BTreeMap<String, GoalSnapshot>,
    chat: Vec<(String, String)>,
    actions: Vec<SeatId>,
    current_turn: TurnNumber,
    turns_per_second: Option<f64>,
    last_sequence: Option<u64>,
    exit_reason: Option<String>,
}

impl DungeonMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a notification. Returns false if it was already seen.
    pub fn apply(&mut self, notification: &Notification) -> bool {
        if self
            .last_sequence
            .is_some_and(|last| notification.sequence <= last)
        {
            return false;
        }
        self.last_sequence = Some(notification.sequence);
        self.current_turn = self.current_turn.max(notification.turn);

        match &notification.payload {
            Payload::TurnStarted { turns_per_second } => {
                self.turns_per_second = Some(*turns_per_second);
            }
            Payload::TileChange(tile) => {
                self.tiles.insert((tile.x, tile.y), tile.clone());
            }
            Payload::CreatureAdded(creature) | Payload::CreatureUpdate(creature) => {
                self.creatures
                    .insert(creature.name.clone(), creature.clone());
            }
            Payload::CreatureRemoved { name } => {
                self.creatures.remove(name);
            }
            Payload::RoomChange(room) => {
                self.rooms.insert(room.name.clone(), room.clone());
            }
            Payload::RoomRemoved { name } => {
                self.rooms.remove(name);
            }
            Payload::TrapChange(trap) => {
                self.traps.insert(trap.name.clone(), trap.clone());
            }
            Payload::TrapRemoved { name } => {
                self.traps.remove(name);
            }
            Payload::LightChange(light) => {
                self.lights.insert(light.name.clone(), light.clone());
            }
            Payload::LightRemoved { name } => {
                self.lights.remove(name);
            }
            Payload::PlayerAction { seat, .. } => self.actions.push(*seat),
            Payload::GoalUpdate(goal) => {
                self.goals.insert(goal.name.clone(), goal.clone());
            }
            Payload::Chat { nick, message } => {
                self.chat.push((nick.clone(), message.clone()));
            }
            Payload::Exit { reason } => self.exit_reason = Some(reason.clone()),
        }
        true
    }

    pub fn current_turn(&self) -> TurnNumber {
        self.current_turn
    }

    pub fn turns_per_second(&self) -> Option<f64> {
        self.turns_per_second
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn tile(&self, x: i32, y: i32) -> Option<&TileSnapshot> {
        self.tiles.get(&(x, y))
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn creature(&self, name: &str) -> Option<&CreatureSnapshot> {
        self.creatures.get(name)
    }

    pub fn creatures(&self) -> impl Iterator<Item = &CreatureSnapshot> {
        self.creatures.values()
    }

    pub fn room(&self, name: &str) -> Option<&RoomSnapshot> {
        self.rooms.get(name)
    }

    pub fn trap(&self, name: &str) -> Option<&TrapSnapshot> {
        self.traps.get(name)
    }

    pub fn light(&self, name: &str) -> Option<&LightSnapshot> {
        self.lights.get(name)
    }

    pub fn goal(&self, name: &str) -> Option<&GoalSnapshot> {
        self.goals.get(name)
    }

    pub fn chat_log(&self) -> &[(String, String)] {
        &self.chat
    }

    /// Seats of every player action seen, in order.
    pub fn actions(&self) -> &[SeatId] {
        &self.actions
    }

    pub fn exit_reason(&self) -> Option<&str> {
        self.exit_reason.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::{CreatureJob, RoomType, TileType};

    fn record(turn: TurnNumber, sequence: u64, payload: Payload) -> Notification {
        Notification {
            turn,
            sequence,
            payload,
        }
    }

    fn kobold(x: f64) -> CreatureSnapshot {
        CreatureSnapshot {
            name: "Kobold_0".to_string(),
            class_name: "Kobold".to_string(),
            job: CreatureJob::BasicWorker,
            seat: 1,
            x,
            y: 2.0,
            hp: 10.0,
            max_hp: 10.0,
            level: 1,
        }
    }

    #[test]
    fn test_applies_in_order() {
        let mut mirror = DungeonMirror::new();
        assert!(mirror.apply(&record(
            1,
            0,
            Payload::TurnStarted {
                turns_per_second: 1.4
            }
        )));
        assert!(mirror.apply(&record(1, 1, Payload::CreatureAdded(kobold(1.0)))));
        assert!(mirror.apply(&record(2, 2, Payload::CreatureUpdate(kobold(2.0)))));

        assert_eq!(mirror.current_turn(), 2);
        assert_approx_eq!(mirror.turns_per_second().unwrap(), 1.4, 1e-9);
        assert_approx_eq!(mirror.creature("Kobold_0").unwrap().x, 2.0, 1e-9);
        assert_eq!(mirror.last_sequence(), Some(2));
    }

    #[test]
    fn test_redelivery_is_ignored() {
        let mut mirror = DungeonMirror::new();
        let chat = record(
            3,
            5,
            Payload::Chat {
                nick: "keeper".to_string(),
                message: "hello".to_string(),
            },
        );
        assert!(mirror.apply(&chat));
        assert!(!mirror.apply(&chat));
        assert!(!mirror.apply(&record(3, 4, Payload::CreatureAdded(kobold(0.0)))));

        assert_eq!(mirror.chat_log().len(), 1);
        assert!(mirror.creature("Kobold_0").is_none());
    }

    #[test]
    fn test_removals() {
        let mut mirror = DungeonMirror::new();
        let room = RoomSnapshot {
            name: "Quarters_0".to_string(),
            room_type: RoomType::Quarters,
            seat: 1,
            tiles: vec![(3, 3)],
        };
        mirror.apply(&record(0, 0, Payload::RoomChange(room)));
        mirror.apply(&record(0, 1, Payload::CreatureAdded(kobold(1.0))));
        assert!(mirror.room("Quarters_0").is_some());

        mirror.apply(&record(
            1,
            2,
            Payload::RoomRemoved {
                name: "Quarters_0".to_string(),
            },
        ));
        mirror.apply(&record(
            1,
            3,
            Payload::CreatureRemoved {
                name: "Kobold_0".to_string(),
            },
        ));
        assert!(mirror.room("Quarters_0").is_none());
        assert_eq!(mirror.creatures().count(), 0);
    }

    #[test]
    fn test_tile_overwrites_and_exit() {
        let mut mirror = DungeonMirror::new();
        let mut tile = TileSnapshot {
            x: 4,
            y: 5,
            tile_type: TileType::Dirt,
            fullness: 100.0,
            claimed_by: None,
            marked_for_digging: false,
        };
        mirror.apply(&record(0, 0, Payload::TileChange(tile.clone())));
        tile.fullness = 75.0;
        tile.marked_for_digging = true;
        mirror.apply(&record(0, 1, Payload::TileChange(tile)));

        assert_eq!(mirror.tile_count(), 1);
        assert_approx_eq!(mirror.tile(4, 5).unwrap().fullness, 75.0, 1e-9);

        mirror.apply(&record(
            2,
            2,
            Payload::Exit {
                reason: "server shutting down".to_string(),
            },
        ));
        assert_eq!(mirror.exit_reason(), Some("server shutting down"));
    }
}
