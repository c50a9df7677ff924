use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a station in the live world.
    pub struct StationId;

    /// Identifies a link graph component in the live world.
    pub struct GraphId;
}

/// Identifies a node within one link graph component.
///
/// Node handles are dense small integers, stable until the node is removed.
/// On removal the last node is swapped into the hole and re-keyed, so a
/// handle is only ever reused after an explicit removal. Never hold a
/// `NodeId` across a removal or a component merge without re-resolving it
/// through the owning station.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u16);

/// Sentinel for "no node".
pub const INVALID_NODE: NodeId = NodeId(u16::MAX);

/// Identifies a cargo type. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CargoId(pub u8);

/// Broad routing class of a cargo type. Determines whether the flow solver
/// routes by travel time or by raw distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CargoClass {
    Passenger,
    Mail,
    Express,
    Bulk,
}

impl CargoClass {
    /// Time-sensitive cargo routes by observed travel time; bulk cargo
    /// routes by directness.
    pub fn is_time_sensitive(self) -> bool {
        matches!(
            self,
            CargoClass::Passenger | CargoClass::Mail | CargoClass::Express
        )
    }
}

/// A map location, used for distance estimates when no travel time has been
/// observed on a link yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileIndex {
    pub x: u32,
    pub y: u32,
}

impl TileIndex {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Manhattan distance in tiles.
    pub fn distance(self, other: TileIndex) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Sentinel timestamp meaning "never" / "dead". A link aspect stamped with
/// this value does not count as live.
pub const INVALID_TICK: Ticks = Ticks::MAX;

/// Ticks per simulated day. The scheduler spawns and joins jobs once per day.
pub const DAY_TICKS: Ticks = 74;

/// Assumed travel time per tile when a link has no observed travel time.
pub const TILE_TRAVEL_TICKS: u64 = 4;
