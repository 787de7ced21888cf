//! Immutable snapshots of dungeon entities.
//!
//! A snapshot is an owned copy of the serializable state of one entity at the
//! moment it changed. Notifications carry snapshots, never references into the
//! live map, so broadcasting can never observe a half-written entity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Seat (player slot) that owns an entity.
pub type SeatId = u32;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileType {
    Dirt,
    Gold,
    Rock,
    Water,
    Lava,
    Claimed,
    Null,
}

impl TileType {
    /// Whether a worker can dig this tile out.
    pub fn is_diggable(self) -> bool {
        matches!(self, TileType::Dirt | TileType::Gold | TileType::Claimed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TileSnapshot {
    pub x: i32,
    pub y: i32,
    pub tile_type: TileType,
    /// 0.0 for a dug-out floor, 100.0 for solid ground.
    pub fullness: f64,
    pub claimed_by: Option<SeatId>,
    pub marked_for_digging: bool,
}

/// Role a creature plays in the dungeon.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreatureJob {
    BasicWorker,
    AdvancedWorker,
    Scout,
    WeakFighter,
    WeakSpellcaster,
    WeakBuilder,
    StrongFighter,
    StrongSpellcaster,
    StrongBuilder,
    Guard,
    SpecialCreature,
    Summon,
    SuperCreature,
}

impl CreatureJob {
    pub fn is_worker(self) -> bool {
        matches!(self, CreatureJob::BasicWorker | CreatureJob::AdvancedWorker)
    }

    fn as_str(self) -> &'static str {
        match self {
            CreatureJob::BasicWorker => "BasicWorker",
            CreatureJob::AdvancedWorker => "AdvancedWorker",
            CreatureJob::Scout => "Scout",
            CreatureJob::WeakFighter => "WeakFighter",
            CreatureJob::WeakSpellcaster => "WeakSpellcaster",
            CreatureJob::WeakBuilder => "WeakBuilder",
            CreatureJob::StrongFighter => "StrongFighter",
            CreatureJob::StrongSpellcaster => "StrongSpellcaster",
            CreatureJob::StrongBuilder => "StrongBuilder",
            CreatureJob::Guard => "Guard",
            CreatureJob::SpecialCreature => "SpecialCreature",
            CreatureJob::Summon => "Summon",
            CreatureJob::SuperCreature => "SuperCreature",
        }
    }
}

impl fmt::Display for CreatureJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown creature job: {0}")]
pub struct ParseJobError(pub String);

impl FromStr for CreatureJob {
    type Err = ParseJobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let job = match s {
            "BasicWorker" => CreatureJob::BasicWorker,
            "AdvancedWorker" => CreatureJob::AdvancedWorker,
            "Scout" => CreatureJob::Scout,
            "WeakFighter" => CreatureJob::WeakFighter,
            "WeakSpellcaster" => CreatureJob::WeakSpellcaster,
            "WeakBuilder" => CreatureJob::WeakBuilder,
            "StrongFighter" => CreatureJob::StrongFighter,
            "StrongSpellcaster" => CreatureJob::StrongSpellcaster,
            "StrongBuilder" => CreatureJob::StrongBuilder,
            "Guard" => CreatureJob::Guard,
            "SpecialCreature" => CreatureJob::SpecialCreature,
            "Summon" => CreatureJob::Summon,
            "SuperCreature" => CreatureJob::SuperCreature,
            other => return Err(ParseJobError(other.to_string())),
        };
        Ok(job)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CreatureSnapshot {
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

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomType {
    DungeonTemple,
    Quarters,
    Treasury,
    Portal,
    Forge,
    Dojo,
    Library,
    Hatchery,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub name: String,
    pub room_type: RoomType,
    pub seat: SeatId,
    pub tiles: Vec<(i32, i32)>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapType {
    Cannon,
    Spike,
    Boulder,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TrapSnapshot {
    pub name: String,
    pub trap_type: TrapType,
    pub seat: SeatId,
    pub tiles: Vec<(i32, i32)>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LightSnapshot {
    pub name: String,
    pub position: (f64, f64, f64),
    pub diffuse: (f32, f32, f32),
    pub specular: (f32, f32, f32),
    pub attenuation_range: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GoalSnapshot {
    pub name: String,
    pub description: String,
    pub seat: SeatId,
    pub completed: bool,
}

/// Requests a client makes on behalf of its seat.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum PlayerCommand {
    MarkTile { x: i32, y: i32, marked: bool },
    BuildRoom { room_type: RoomType, tiles: Vec<(i32, i32)> },
    PlaceTrap { trap_type: TrapType, x: i32, y: i32 },
    DropCreature { name: String, x: f64, y: f64 },
    Chat { message: String },
}
