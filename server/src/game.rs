//! Authoritative dungeon state
//!
//! Every mutation returns the payloads describing what changed, built from
//! owned snapshots, so producers can enqueue them without holding the map lock
//! any longer than the mutation itself.

use log::{debug, info};
use shared::{
    CreatureJob, CreatureSnapshot, GoalSnapshot, LightSnapshot, Payload, RoomSnapshot, RoomType,
    SeatId, TileSnapshot, TileType, TrapSnapshot, TrapType,
};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Fullness of an undug tile.
pub const FULL_TILE: f64 = 100.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapError {
    #[error("no tile at ({0}, {1})")]
    NoSuchTile(i32, i32),
    #[error("tile ({0}, {1}) is not open floor")]
    NotFloor(i32, i32),
    #[error("tile ({x}, {y}) is not claimed by seat {seat}")]
    NotClaimed { x: i32, y: i32, seat: SeatId },
    #[error("tile ({0}, {1}) is already occupied by a room or trap")]
    Occupied(i32, i32),
    #[error("tile ({0}, {1}) cannot be dug")]
    NotDiggable(i32, i32),
    #[error("a room needs at least one tile")]
    EmptyRoom,
    #[error("no creature named '{0}'")]
    NoSuchCreature(String),
    #[error("a creature named '{0}' already exists")]
    DuplicateCreature(String),
    #[error("no goal named '{0}'")]
    NoSuchGoal(String),
}

/// Owned snapshot of one entity, in the form carried by notifications.
pub trait Snapshot {
    type Output;

    fn snapshot(&self) -> Self::Output;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub x: i32,
    pub y: i32,
    pub tile_type: TileType,
    pub fullness: f64,
    pub claimed_by: Option<SeatId>,
    pub marked_for_digging: bool,
}

impl Tile {
    fn new(x: i32, y: i32, tile_type: TileType, fullness: f64) -> Self {
        Self {
            x,
            y,
            tile_type,
            fullness,
            claimed_by: None,
            marked_for_digging: false,
        }
    }

    /// Open ground a creature can stand on.
    pub fn is_floor(&self) -> bool {
        self.fullness <= 0.0 && !matches!(self.tile_type, TileType::Water | TileType::Lava)
    }
}

impl Snapshot for Tile {
    type Output = TileSnapshot;

    fn snapshot(&self) -> TileSnapshot {
        TileSnapshot {
            x: self.x,
            y: self.y,
            tile_type: self.tile_type,
            fullness: self.fullness,
            claimed_by: self.claimed_by,
            marked_for_digging: self.marked_for_digging,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Creature {
    pub name: String,
    pub class_name: String,
    pub job: CreatureJob,
    pub seat: SeatId,
    pub x: f64,
    pub y: f64,
    pub hp: f64,
    pub max_hp: f64,
    pub level: u32,
}

impl Creature {
    pub fn new(
        name: &str,
        class_name: &str,
        job: CreatureJob,
        seat: SeatId,
        x: f64,
        y: f64,
    ) -> Self {
        let max_hp = if job.is_worker() { 12.0 } else { 30.0 };
        Self {
            name: name.to_string(),
            class_name: class_name.to_string(),
            job,
            seat,
            x,
            y,
            hp: max_hp,
            max_hp,
            level: 1,
        }
    }

    /// The tile the creature is standing on.
    pub fn tile(&self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }
}

impl Snapshot for Creature {
    type Output = CreatureSnapshot;

    fn snapshot(&self) -> CreatureSnapshot {
        CreatureSnapshot {
            name: self.name.clone(),
            class_name: self.class_name.clone(),
            job: self.job,
            seat: self.seat,
            x: self.x,
            y: self.y,
            hp: self.hp,
            max_hp: self.max_hp,
            level: self.level,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub name: String,
    pub room_type: RoomType,
    pub seat: SeatId,
    pub tiles: Vec<(i32, i32)>,
}

impl Snapshot for Room {
    type Output = RoomSnapshot;

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            name: self.name.clone(),
            room_type: self.room_type,
            seat: self.seat,
            tiles: self.tiles.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub name: String,
    pub trap_type: TrapType,
    pub seat: SeatId,
    pub tiles: Vec<(i32, i32)>,
}

impl Snapshot for Trap {
    type Output = TrapSnapshot;

    fn snapshot(&self) -> TrapSnapshot {
        TrapSnapshot {
            name: self.name.clone(),
            trap_type: self.trap_type,
            seat: self.seat,
            tiles: self.tiles.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapLight {
    pub name: String,
    pub position: (f64, f64, f64),
    pub diffuse: (f32, f32, f32),
    pub specular: (f32, f32, f32),
    pub attenuation_range: f64,
}

impl Snapshot for MapLight {
    type Output = LightSnapshot;

    fn snapshot(&self) -> LightSnapshot {
        LightSnapshot {
            name: self.name.clone(),
            position: self.position,
            diffuse: self.diffuse,
            specular: self.specular,
            attenuation_range: self.attenuation_range,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub name: String,
    pub description: String,
    pub seat: SeatId,
    pub completed: bool,
}

impl Snapshot for Goal {
    type Output = GoalSnapshot;

    fn snapshot(&self) -> GoalSnapshot {
        GoalSnapshot {
            name: self.name.clone(),
            description: self.description.clone(),
            seat: self.seat,
            completed: self.completed,
        }
    }
}

/// A player's seat at the table. Gold is spent on rooms and traps.
#[derive(Debug, Clone, PartialEq)]
pub struct Seat {
    pub id: SeatId,
    pub gold: u32,
}

pub const ROOM_COST_PER_TILE: u32 = 25;
pub const TRAP_COST: u32 = 150;

#[derive(Debug, Clone)]
pub struct GameMap {
    pub width: i32,
    pub height: i32,
    tiles: HashMap<(i32, i32), Tile>,
    creatures: BTreeMap<String, Creature>,
    rooms: BTreeMap<String, Room>,
    traps: BTreeMap<String, Trap>,
    lights: BTreeMap<String, MapLight>,
    goals: BTreeMap<String, Goal>,
    seats: BTreeMap<SeatId, Seat>,
    next_room_id: u32,
    next_trap_id: u32,
}

impl GameMap {
    /// A solid dirt map with an impassable rock border.
    pub fn new(width: i32, height: i32) -> Self {
        let mut tiles = HashMap::with_capacity((width.max(0) * height.max(0)) as usize);
        for x in 0..width {
            for y in 0..height {
                let border = x == 0 || y == 0 || x == width - 1 || y == height - 1;
                let tile_type = if border { TileType::Rock } else { TileType::Dirt };
                tiles.insert((x, y), Tile::new(x, y, tile_type, FULL_TILE));
            }
        }

        Self {
            width,
            height,
            tiles,
            creatures: BTreeMap::new(),
            rooms: BTreeMap::new(),
            traps: BTreeMap::new(),
            lights: BTreeMap::new(),
            goals: BTreeMap::new(),
            seats: BTreeMap::new(),
            next_room_id: 1,
            next_trap_id: 1,
        }
    }

    /// A small map with a claimed, dug-out starting area for `seat`.
    pub fn with_starting_dungeon(width: i32, height: i32, seat: SeatId) -> Self {
        let mut map = Self::new(width, height);
        map.add_seat(seat, 1_000);

        let (cx, cy) = (width / 2, height / 2);
        for x in (cx - 2)..=(cx + 2) {
            for y in (cy - 2)..=(cy + 2) {
                if let Some(tile) = map.tiles.get_mut(&(x, y)) {
                    if tile.tile_type != TileType::Rock {
                        tile.fullness = 0.0;
                        tile.tile_type = TileType::Claimed;
                        tile.claimed_by = Some(seat);
                    }
                }
            }
        }
        if let Some(tile) = map.tiles.get_mut(&(cx + 4, cy)) {
            tile.tile_type = TileType::Gold;
        }

        let temple = vec![(cx, cy), (cx + 1, cy), (cx, cy + 1), (cx + 1, cy + 1)];
        map.rooms.insert(
            "DungeonTemple_0".to_string(),
            Room {
                name: "DungeonTemple_0".to_string(),
                room_type: RoomType::DungeonTemple,
                seat,
                tiles: temple,
            },
        );
        for i in 0..3 {
            let name = format!("Kobold_{}", i);
            let kobold = Creature::new(
                &name,
                "Kobold",
                CreatureJob::BasicWorker,
                seat,
                (cx - 1 + i) as f64,
                (cy - 1) as f64,
            );
            map.creatures.insert(name, kobold);
        }
        map.lights.insert(
            "TempleLight".to_string(),
            MapLight {
                name: "TempleLight".to_string(),
                position: (cx as f64, cy as f64, 3.0),
                diffuse: (0.8, 0.6, 0.3),
                specular: (0.2, 0.2, 0.2),
                attenuation_range: 10.0,
            },
        );
        map.goals.insert(
            "MineGold".to_string(),
            Goal {
                name: "MineGold".to_string(),
                description: "Dig out a gold vein".to_string(),
                seat,
                completed: false,
            },
        );
        map
    }

    pub fn add_seat(&mut self, id: SeatId, gold: u32) {
        self.seats.insert(id, Seat { id, gold });
    }

    pub fn seat(&self, id: SeatId) -> Option<&Seat> {
        self.seats.get(&id)
    }

    pub fn tile(&self, x: i32, y: i32) -> Option<&Tile> {
        self.tiles.get(&(x, y))
    }

    pub fn creature(&self, name: &str) -> Option<&Creature> {
        self.creatures.get(name)
    }

    pub fn creatures(&self) -> impl Iterator<Item = &Creature> {
        self.creatures.values()
    }

    pub fn creature_names(&self) -> Vec<String> {
        self.creatures.keys().cloned().collect()
    }

    pub fn room(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub fn trap(&self, name: &str) -> Option<&Trap> {
        self.traps.get(name)
    }

    pub fn goal(&self, name: &str) -> Option<&Goal> {
        self.goals.get(name)
    }

    /// Snapshot of everything a newly connected client needs to draw the map.
    pub fn full_snapshot(&self) -> Vec<Payload> {
        let mut coords: Vec<&(i32, i32)> = self.tiles.keys().collect();
        coords.sort();

        let mut payloads: Vec<Payload> = coords
            .into_iter()
            .filter_map(|coord| self.tiles.get(coord))
            .map(|tile| Payload::TileChange(tile.snapshot()))
            .collect();
        payloads.extend(self.rooms.values().map(|r| Payload::RoomChange(r.snapshot())));
        payloads.extend(self.traps.values().map(|t| Payload::TrapChange(t.snapshot())));
        payloads.extend(self.lights.values().map(|l| Payload::LightChange(l.snapshot())));
        payloads.extend(self.creatures.values().map(|c| Payload::CreatureAdded(c.snapshot())));
        payloads.extend(self.goals.values().map(|g| Payload::GoalUpdate(g.snapshot())));
        payloads
    }

    fn tile_mut(&mut self, x: i32, y: i32) -> Result<&mut Tile, MapError> {
        self.tiles.get_mut(&(x, y)).ok_or(MapError::NoSuchTile(x, y))
    }

    fn is_occupied(&self, x: i32, y: i32) -> bool {
        self.rooms.values().any(|room| room.tiles.contains(&(x, y)))
            || self.traps.values().any(|trap| trap.tiles.contains(&(x, y)))
    }

    pub fn mark_tile(&mut self, x: i32, y: i32, marked: bool) -> Result<Payload, MapError> {
        let tile = self.tile_mut(x, y)?;
        if !tile.tile_type.is_diggable() || tile.fullness <= 0.0 {
            return Err(MapError::NotDiggable(x, y));
        }
        tile.marked_for_digging = marked;
        Ok(Payload::TileChange(tile.snapshot()))
    }

    /// Removes up to `amount` fullness from a diggable tile.
    ///
    /// Digging out a gold tile pays its gold to `seat`.
    pub fn dig_tile(
        &mut self,
        x: i32,
        y: i32,
        amount: f64,
        seat: SeatId,
    ) -> Result<Payload, MapError> {
        let tile = self.tile_mut(x, y)?;
        if !tile.tile_type.is_diggable() || tile.fullness <= 0.0 {
            return Err(MapError::NotDiggable(x, y));
        }

        tile.fullness = (tile.fullness - amount).max(0.0);
        let mut mined = 0;
        if tile.fullness <= 0.0 {
            if tile.tile_type == TileType::Gold {
                mined = 100;
                tile.tile_type = TileType::Dirt;
            }
            tile.marked_for_digging = false;
            debug!("Tile ({}, {}) dug out", x, y);
        }
        let payload = Payload::TileChange(tile.snapshot());

        if mined > 0 {
            if let Some(seat) = self.seats.get_mut(&seat) {
                seat.gold += mined;
            }
        }
        Ok(payload)
    }

    pub fn claim_tile(&mut self, x: i32, y: i32, seat: SeatId) -> Result<Payload, MapError> {
        let tile = self.tile_mut(x, y)?;
        if !tile.is_floor() {
            return Err(MapError::NotFloor(x, y));
        }
        tile.tile_type = TileType::Claimed;
        tile.claimed_by = Some(seat);
        Ok(Payload::TileChange(tile.snapshot()))
    }

    pub fn add_creature(&mut self, creature: Creature) -> Result<Payload, MapError> {
        if self.creatures.contains_key(&creature.name) {
            return Err(MapError::DuplicateCreature(creature.name));
        }
        info!(
            "Added creature {} ({}) for seat {} at ({}, {})",
            creature.name, creature.job, creature.seat, creature.x, creature.y
        );
        let payload = Payload::CreatureAdded(creature.snapshot());
        self.creatures.insert(creature.name.clone(), creature);
        Ok(payload)
    }

    pub fn remove_creature(&mut self, name: &str) -> Result<Payload, MapError> {
        self.creatures
            .remove(name)
            .ok_or_else(|| MapError::NoSuchCreature(name.to_string()))?;
        info!("Removed creature {}", name);
        Ok(Payload::CreatureRemoved {
            name: name.to_string(),
        })
    }

    /// Moves a creature one tile if the destination is open floor.
    pub fn move_creature(&mut self, name: &str, dx: i32, dy: i32) -> Result<Payload, MapError> {
        let (x, y) = self
            .creatures
            .get(name)
            .map(Creature::tile)
            .ok_or_else(|| MapError::NoSuchCreature(name.to_string()))?;
        let (nx, ny) = (x + dx, y + dy);
        match self.tiles.get(&(nx, ny)) {
            Some(tile) if tile.is_floor() => {}
            Some(_) => return Err(MapError::NotFloor(nx, ny)),
            None => return Err(MapError::NoSuchTile(nx, ny)),
        }

        let creature = self
            .creatures
            .get_mut(name)
            .ok_or_else(|| MapError::NoSuchCreature(name.to_string()))?;
        creature.x = nx as f64;
        creature.y = ny as f64;
        Ok(Payload::CreatureUpdate(creature.snapshot()))
    }

    /// Drops a creature from the seat's hand onto open floor.
    pub fn drop_creature(
        &mut self,
        name: &str,
        x: f64,
        y: f64,
        seat: SeatId,
    ) -> Result<Payload, MapError> {
        let (tx, ty) = (x.round() as i32, y.round() as i32);
        match self.tiles.get(&(tx, ty)) {
            Some(tile) if tile.is_floor() => {}
            Some(_) => return Err(MapError::NotFloor(tx, ty)),
            None => return Err(MapError::NoSuchTile(tx, ty)),
        }
        let creature = self
            .creatures
            .get_mut(name)
            .filter(|creature| creature.seat == seat)
            .ok_or_else(|| MapError::NoSuchCreature(name.to_string()))?;
        creature.x = x;
        creature.y = y;
        Ok(Payload::CreatureUpdate(creature.snapshot()))
    }

    /// Builds a room over tiles the seat has claimed and can afford.
    ///
    /// Returns the room payload; no gold is spent if any tile is unsuitable.
    pub fn build_room(
        &mut self,
        room_type: RoomType,
        seat: SeatId,
        tiles: &[(i32, i32)],
    ) -> Result<Payload, MapError> {
        if tiles.is_empty() {
            return Err(MapError::EmptyRoom);
        }
        for &(x, y) in tiles {
            let tile = self.tile(x, y).ok_or(MapError::NoSuchTile(x, y))?;
            if tile.claimed_by != Some(seat) || !tile.is_floor() {
                return Err(MapError::NotClaimed { x, y, seat });
            }
            if self.is_occupied(x, y) {
                return Err(MapError::Occupied(x, y));
            }
        }
        self.spend(seat, ROOM_COST_PER_TILE * tiles.len() as u32);

        let name = format!("{:?}_{}", room_type, self.next_room_id);
        self.next_room_id += 1;
        let room = Room {
            name: name.clone(),
            room_type,
            seat,
            tiles: tiles.to_vec(),
        };
        info!("Seat {} built {} over {} tiles", seat, name, tiles.len());
        let payload = Payload::RoomChange(room.snapshot());
        self.rooms.insert(name, room);
        Ok(payload)
    }

    pub fn remove_room(&mut self, name: &str) -> Option<Payload> {
        self.rooms.remove(name).map(|room| Payload::RoomRemoved { name: room.name })
    }

    pub fn place_trap(
        &mut self,
        trap_type: TrapType,
        seat: SeatId,
        x: i32,
        y: i32,
    ) -> Result<Payload, MapError> {
        let tile = self.tile(x, y).ok_or(MapError::NoSuchTile(x, y))?;
        if tile.claimed_by != Some(seat) || !tile.is_floor() {
            return Err(MapError::NotClaimed { x, y, seat });
        }
        if self.is_occupied(x, y) {
            return Err(MapError::Occupied(x, y));
        }
        self.spend(seat, TRAP_COST);

        let name = format!("{:?}Trap_{}", trap_type, self.next_trap_id);
        self.next_trap_id += 1;
        let trap = Trap {
            name: name.clone(),
            trap_type,
            seat,
            tiles: vec![(x, y)],
        };
        let payload = Payload::TrapChange(trap.snapshot());
        self.traps.insert(name, trap);
        Ok(payload)
    }

    pub fn remove_trap(&mut self, name: &str) -> Option<Payload> {
        self.traps.remove(name).map(|trap| Payload::TrapRemoved { name: trap.name })
    }

    pub fn add_light(&mut self, light: MapLight) -> Payload {
        let payload = Payload::LightChange(light.snapshot());
        self.lights.insert(light.name.clone(), light);
        payload
    }

    pub fn remove_light(&mut self, name: &str) -> Option<Payload> {
        self.lights.remove(name).map(|light| Payload::LightRemoved { name: light.name })
    }

    pub fn add_goal(&mut self, goal: Goal) -> Payload {
        let payload = Payload::GoalUpdate(goal.snapshot());
        self.goals.insert(goal.name.clone(), goal);
        payload
    }

    pub fn complete_goal(&mut self, name: &str) -> Result<Payload, MapError> {
        let goal = self
            .goals
            .get_mut(name)
            .ok_or_else(|| MapError::NoSuchGoal(name.to_string()))?;
        if !goal.completed {
            info!("Seat {} completed goal {}", goal.seat, goal.name);
        }
        goal.completed = true;
        Ok(Payload::GoalUpdate(goal.snapshot()))
    }

    /// Deducts gold, stopping at zero.
    fn spend(&mut self, seat: SeatId, amount: u32) {
        if let Some(seat) = self.seats.get_mut(&seat) {
            seat.gold = seat.gold.saturating_sub(amount);
        }
    }
}
