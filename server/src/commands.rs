//! Player command producer
//!
//! The network front end forwards client actions over an unbounded channel.
//! Once per turn the producer drains whatever has arrived, applies each action
//! to the map and emits the player action followed by the change it caused.

use crate::game::GameMap;
use crate::notification_queue::{NotificationQueue, QueueError};
use crate::producer::TurnProducer;
use crate::turn_gate::WorkTicket;
use async_trait::async_trait;
use log::warn;
use shared::{Payload, PlayerCommand, SeatId, SessionId};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// A client action waiting for the next turn.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub session_id: SessionId,
    pub nick: String,
    pub seat: SeatId,
    pub command: PlayerCommand,
}

pub struct CommandProducer {
    map: Arc<RwLock<GameMap>>,
    commands: mpsc::UnboundedReceiver<QueuedCommand>,
}

impl CommandProducer {
    pub fn new(map: Arc<RwLock<GameMap>>) -> (Self, mpsc::UnboundedSender<QueuedCommand>) {
        let (sender, commands) = mpsc::unbounded_channel();
        (Self { map, commands }, sender)
    }

    /// Applies one command. Rejected commands produce nothing.
    pub fn apply(map: &mut GameMap, queued: QueuedCommand) -> Vec<Payload> {
        let QueuedCommand {
            session_id,
            nick,
            seat,
            command,
        } = queued;

        let outcome = match &command {
            PlayerCommand::Chat { message } => {
                return vec![Payload::Chat {
                    nick,
                    message: message.clone(),
                }];
            }
            PlayerCommand::MarkTile { x, y, marked } => map.mark_tile(*x, *y, *marked),
            PlayerCommand::BuildRoom { room_type, tiles } => map.build_room(*room_type, seat, tiles),
            PlayerCommand::PlaceTrap { trap_type, x, y } => map.place_trap(*trap_type, seat, *x, *y),
            PlayerCommand::DropCreature { name, x, y } => map.drop_creature(name, *x, *y, seat),
        };

        match outcome {
            Ok(change) => vec![Payload::PlayerAction { seat, command }, change],
            Err(e) => {
                warn!(
                    "Rejected {:?} from session {} ({}): {}",
                    command, session_id, nick, e
                );
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl TurnProducer for CommandProducer {
    fn name(&self) -> &str {
        "player-commands"
    }

    async fn produce(
        &mut self,
        ticket: &WorkTicket,
        queue: &NotificationQueue,
    ) -> Result<usize, QueueError> {
        let mut pending = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            pending.push(command);
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let mut map = self.map.write().await;
        let payloads: Vec<Payload> = pending
            .into_iter()
            .flat_map(|command| Self::apply(&mut map, command))
            .collect();
        queue.enqueue_all(ticket, payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::notification_queue::NotificationReceiver;
    use crate::turn_clock::TurnClock;
    use crate::turn_gate::TurnGate;
    use shared::{RoomType, TileType};

    fn pipeline() -> (NotificationQueue, NotificationReceiver) {
        let config = PipelineConfig::default().with_wait_for_dispatch(false);
        let gate = Arc::new(TurnGate::new(Arc::new(TurnClock::new()), &config));
        NotificationQueue::new(gate, 100)
    }

    async fn produce_once(
        producer: &mut CommandProducer,
        queue: &NotificationQueue,
        receiver: &mut NotificationReceiver,
    ) -> Vec<Payload> {
        let gate = queue.gate();
        let ticket = gate.register_current("player-commands").unwrap();
        let queued = producer.produce(&ticket, queue).await.unwrap();
        gate.complete_work(ticket).unwrap();

        let mut payloads = Vec::new();
        while let Some(notification) = receiver.try_dequeue() {
            payloads.push(notification.payload);
        }
        assert_eq!(payloads.len(), queued);
        payloads
    }

    fn queued(command: PlayerCommand) -> QueuedCommand {
        QueuedCommand {
            session_id: 1,
            nick: "keeper".to_string(),
            seat: 1,
            command,
        }
    }

    #[test]
    fn test_chat_passes_through() {
        let mut map = GameMap::new(5, 5);
        let payloads = CommandProducer::apply(
            &mut map,
            queued(PlayerCommand::Chat {
                message: "hi".to_string(),
            }),
        );
        assert_eq!(
            payloads,
            vec![Payload::Chat {
                nick: "keeper".to_string(),
                message: "hi".to_string()
            }]
        );
    }

    #[test]
    fn test_mark_tile_emits_action_then_change() {
        let mut map = GameMap::with_starting_dungeon(15, 15, 1);
        let command = PlayerCommand::MarkTile {
            x: 10,
            y: 7,
            marked: true,
        };
        let payloads = CommandProducer::apply(&mut map, queued(command.clone()));

        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], Payload::PlayerAction { seat: 1, command });
        let Payload::TileChange(tile) = &payloads[1] else {
            panic!("expected tile change");
        };
        assert!(tile.marked_for_digging);
        assert_eq!(tile.tile_type, TileType::Dirt);
    }

    #[test]
    fn test_rejected_command_produces_nothing() {
        let mut map = GameMap::with_starting_dungeon(15, 15, 1);
        let payloads = CommandProducer::apply(
            &mut map,
            queued(PlayerCommand::BuildRoom {
                room_type: RoomType::Treasury,
                tiles: vec![(1, 1)],
            }),
        );
        assert!(payloads.is_empty());
    }

    #[tokio::test]
    async fn test_produce_drains_channel_in_order() {
        let map = Arc::new(RwLock::new(GameMap::with_starting_dungeon(15, 15, 1)));
        let (mut producer, sender) = CommandProducer::new(Arc::clone(&map));
        let (queue, mut receiver) = pipeline();

        assert!(produce_once(&mut producer, &queue, &mut receiver).await.is_empty());

        for message in ["one", "two"] {
            sender
                .send(queued(PlayerCommand::Chat {
                    message: message.to_string(),
                }))
                .unwrap();
        }
        sender
            .send(queued(PlayerCommand::BuildRoom {
                room_type: RoomType::Quarters,
                tiles: vec![(5, 5)],
            }))
            .unwrap();

        let payloads = produce_once(&mut producer, &queue, &mut receiver).await;
        assert_eq!(payloads.len(), 4);
        assert!(matches!(&payloads[0], Payload::Chat { message, .. } if message == "one"));
        assert!(matches!(&payloads[1], Payload::Chat { message, .. } if message == "two"));
        assert!(matches!(payloads[2], Payload::PlayerAction { .. }));
        assert!(matches!(payloads[3], Payload::RoomChange(_)));
        assert!(produce_once(&mut producer, &queue, &mut receiver).await.is_empty());
    }
}
