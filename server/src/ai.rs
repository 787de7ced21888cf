//! Creature AI producer
//!
//! Workers dig marked tiles next to them and claim what they dig out; every
//! other creature wanders. No pathfinding: a creature only ever looks at its
//! four neighbours.

use crate::game::GameMap;
use crate::notification_queue::{NotificationQueue, QueueError};
use crate::producer::TurnProducer;
use crate::turn_gate::WorkTicket;
use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Payload, SeatId, TileType};
use std::sync::Arc;
use tokio::sync::RwLock;

const NEIGHBOURS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Fullness a worker removes per turn.
pub const DIG_RATE: f64 = 25.0;

/// Chance per turn that an idle creature takes a step.
const WANDER_CHANCE: f64 = 0.5;

/// Goal completed by digging out a gold tile.
pub const MINE_GOLD_GOAL: &str = "MineGold";

pub struct CreatureAi {
    map: Arc<RwLock<GameMap>>,
    rng: StdRng,
}

impl CreatureAi {
    pub fn new(map: Arc<RwLock<GameMap>>, seed: u64) -> Self {
        Self {
            map,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Runs one turn of AI for every creature, in name order.
    pub fn take_turn(&mut self, map: &mut GameMap) -> Vec<Payload> {
        let mut payloads = Vec::new();

        for name in map.creature_names() {
            let Some(creature) = map.creature(&name) else {
                continue;
            };
            let (x, y) = creature.tile();
            let seat = creature.seat;
            let is_worker = creature.job.is_worker();

            if is_worker {
                let target = NEIGHBOURS
                    .iter()
                    .map(|(dx, dy)| (x + dx, y + dy))
                    .find(|&(tx, ty)| {
                        map.tile(tx, ty)
                            .is_some_and(|tile| tile.marked_for_digging && tile.fullness > 0.0)
                    });
                if let Some((tx, ty)) = target {
                    payloads.extend(Self::dig(map, &name, tx, ty, seat));
                    continue;
                }
            }

            if self.rng.gen_bool(WANDER_CHANCE) {
                let (dx, dy) = NEIGHBOURS[self.rng.gen_range(0..NEIGHBOURS.len())];
                if let Ok(payload) = map.move_creature(&name, dx, dy) {
                    payloads.push(payload);
                }
            }
        }

        payloads
    }

    fn dig(map: &mut GameMap, name: &str, x: i32, y: i32, seat: SeatId) -> Vec<Payload> {
        let was_gold = map.tile(x, y).is_some_and(|tile| tile.tile_type == TileType::Gold);
        let mut payloads = Vec::new();

        match map.dig_tile(x, y, DIG_RATE, seat) {
            Ok(payload) => payloads.push(payload),
            Err(e) => {
                debug!("{} could not dig ({}, {}): {}", name, x, y, e);
                return payloads;
            }
        }

        if map.tile(x, y).is_some_and(|tile| tile.is_floor()) {
            if let Ok(payload) = map.claim_tile(x, y, seat) {
                payloads.push(payload);
            }
            if was_gold && map.goal(MINE_GOLD_GOAL).is_some_and(|goal| !goal.completed) {
                if let Ok(payload) = map.complete_goal(MINE_GOLD_GOAL) {
                    payloads.push(payload);
                }
            }
        }
        payloads
    }
}

#[async_trait]
impl TurnProducer for CreatureAi {
    fn name(&self) -> &str {
        "creature-ai"
    }

    async fn produce(
        &mut self,
        ticket: &WorkTicket,
        queue: &NotificationQueue,
    ) -> Result<usize, QueueError> {
        let map = Arc::clone(&self.map);
        let mut map = map.write().await;
        let payloads = self.take_turn(&mut map);
        queue.enqueue_all(ticket, payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::game::{Creature, Snapshot, FULL_TILE};
    use crate::turn_clock::TurnClock;
    use crate::turn_gate::TurnGate;
    use shared::CreatureJob;

    fn ai_with(map: GameMap, seed: u64) -> (CreatureAi, Arc<RwLock<GameMap>>) {
        let map = Arc::new(RwLock::new(map));
        (CreatureAi::new(Arc::clone(&map), seed), map)
    }

    #[tokio::test]
    async fn test_worker_digs_marked_neighbour() {
        let mut map = GameMap::new(7, 7);
        map.add_seat(1, 0);
        map.dig_tile(3, 3, FULL_TILE, 1).unwrap();
        map.add_creature(Creature::new(
            "Kobold_0",
            "Kobold",
            CreatureJob::BasicWorker,
            1,
            3.0,
            3.0,
        ))
        .unwrap();
        map.mark_tile(4, 3, true).unwrap();

        let (mut ai, map) = ai_with(map, 7);
        let turns_to_dig = (FULL_TILE / DIG_RATE).ceil() as usize;
        let mut all = Vec::new();
        for _ in 0..turns_to_dig {
            all.extend(ai.take_turn(&mut *map.write().await));
        }

        let map = map.read().await;
        let tile = map.tile(4, 3).unwrap();
        assert!(tile.is_floor());
        assert_eq!(tile.claimed_by, Some(1));
        assert_eq!(map.creature("Kobold_0").unwrap().tile(), (3, 3));
        assert!(all.iter().all(|p| matches!(p, Payload::TileChange(_))));
        assert_eq!(all.len(), turns_to_dig + 1);
    }

    #[tokio::test]
    async fn test_digging_gold_completes_goal() {
        let mut map = GameMap::with_starting_dungeon(15, 15, 1);
        map.dig_tile(10, 7, FULL_TILE, 1).unwrap();
        map.add_creature(Creature::new(
            "Imp_0",
            "Imp",
            CreatureJob::AdvancedWorker,
            1,
            10.0,
            7.0,
        ))
        .unwrap();
        map.mark_tile(11, 7, true).unwrap();

        let (mut ai, map) = ai_with(map, 1);
        let mut all = Vec::new();
        for _ in 0..20 {
            all.extend(ai.take_turn(&mut *map.write().await));
        }

        let map = map.read().await;
        assert!(map.goal(MINE_GOLD_GOAL).unwrap().completed);
        assert_eq!(map.seat(1).unwrap().gold, 1_100);
        let goal_updates = all
            .iter()
            .filter(|p| matches!(p, Payload::GoalUpdate(_)))
            .count();
        assert_eq!(goal_updates, 1);
    }

    #[test]
    fn test_fighters_only_wander_onto_floor() {
        let mut map = GameMap::with_starting_dungeon(15, 15, 1);
        let troll = Creature::new("Troll_0", "Troll", CreatureJob::StrongFighter, 1, 7.0, 7.0);
        map.add_creature(troll).unwrap();
        let (mut ai, _) = ai_with(GameMap::new(3, 3), 3);

        for _ in 0..50 {
            for payload in ai.take_turn(&mut map) {
                if let Payload::CreatureUpdate(snapshot) = payload {
                    let tile = map
                        .tile(snapshot.x.round() as i32, snapshot.y.round() as i32)
                        .unwrap();
                    assert!(tile.is_floor());
                }
            }
        }
        let (x, y) = map.creature("Troll_0").unwrap().tile();
        assert!((5..=9).contains(&x) && (5..=9).contains(&y));
    }

    #[test]
    fn test_same_seed_same_moves() {
        let base = GameMap::with_starting_dungeon(15, 15, 1);
        let (mut a, _) = ai_with(GameMap::new(3, 3), 42);
        let (mut b, _) = ai_with(GameMap::new(3, 3), 42);
        let mut map_a = base.clone();
        let mut map_b = base;

        for _ in 0..10 {
            assert_eq!(a.take_turn(&mut map_a), b.take_turn(&mut map_b));
        }
    }

    #[tokio::test]
    async fn test_produce_queues_moves_matching_the_map() {
        let config = PipelineConfig::default().with_wait_for_dispatch(false);
        let gate = Arc::new(TurnGate::new(Arc::new(TurnClock::new()), &config));
        let (queue, mut receiver) = NotificationQueue::new(Arc::clone(&gate), 1_000);
        let (mut ai, map) = ai_with(GameMap::with_starting_dungeon(15, 15, 1), 11);

        let mut queued = 0;
        for _ in 0..5 {
            let ticket = gate.register_current("creature-ai").unwrap();
            queued += ai.produce(&ticket, &queue).await.unwrap();
            gate.complete_work(ticket).unwrap();
        }

        let mut last = std::collections::HashMap::new();
        let mut seen = 0;
        while let Some(notification) = receiver.try_dequeue() {
            assert_eq!(notification.turn, 0);
            if let Payload::CreatureUpdate(creature) = notification.payload {
                last.insert(creature.name.clone(), creature);
            }
            seen += 1;
        }
        assert_eq!(seen, queued);

        let map = map.read().await;
        for (name, creature) in last {
            assert_eq!(map.creature(&name).unwrap().snapshot(), creature);
        }
    }
}
