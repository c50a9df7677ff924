//! Binary snapshots of a network via `bitcode`, with a versioned header.
//!
//! In-flight jobs are deliberately not part of the wire format: their
//! components are folded into the waiting queue instead, so a reloaded
//! network re-spawns equivalent jobs rather than attempting to revive a
//! half-computed snapshot.

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::graph::LinkGraph;
use crate::id::{CargoClass, CargoId, GraphId, StationId, Ticks};
use crate::network::{Network, Station};
use crate::settings::DistributionSettings;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a linkflow network snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0x4C46_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every serialized snapshot. Enables format detection
/// and version checking before trusting the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    /// Tick count at the time the snapshot was taken.
    pub tick: Ticks,
}

impl SnapshotHeader {
    pub fn new(tick: Ticks) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            tick,
        }
    }

    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Network snapshot
// ---------------------------------------------------------------------------

/// The serializable portion of a network. Running jobs are represented by
/// their component handles in `queue`.
#[derive(Debug, Serialize, Deserialize)]
struct NetworkSnapshot {
    header: SnapshotHeader,
    cargo: CargoId,
    class: CargoClass,
    settings: DistributionSettings,
    graphs: SlotMap<GraphId, LinkGraph>,
    stations: SlotMap<StationId, Station>,
    queue: Vec<GraphId>,
}

/// Serialize a network, folding in-flight jobs back into the queue.
pub fn serialize_network(network: &Network) -> Result<Vec<u8>, SerializeError> {
    let snapshot = NetworkSnapshot {
        header: SnapshotHeader::new(network.tick()),
        cargo: network.cargo(),
        class: network.class(),
        settings: network.settings().clone(),
        graphs: network.graphs().clone(),
        stations: network.stations().clone(),
        queue: network.schedule().persistable_queue(),
    };
    bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
}

/// Deserialize a network. The caller decides when to start the re-spawned
/// jobs (typically via [`Network::spawn_all_jobs`] once the world is up).
pub fn deserialize_network(data: &[u8]) -> Result<Network, DeserializeError> {
    let snapshot: NetworkSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    snapshot.header.validate()?;
    Ok(Network::from_parts(
        snapshot.cargo,
        snapshot.class,
        snapshot.settings,
        snapshot.header.tick,
        snapshot.graphs,
        snapshot.stations,
        snapshot.queue,
    ))
}

/// Read just the header of serialized data, for version probing.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: NetworkSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeUpdateMode;
    use crate::id::TileIndex;

    fn populated_network() -> Network {
        let mut net = Network::new(
            CargoId(3),
            CargoClass::Express,
            DistributionSettings::default(),
        );
        let a = net.add_station(TileIndex::new(0, 0));
        let b = net.add_station(TileIndex::new(10, 5));
        let c = net.add_station(TileIndex::new(25, 0));
        let mode = EdgeUpdateMode::REFRESH | EdgeUpdateMode::UNRESTRICTED;
        net.refresh_link(a, b, 100, 20, 55, mode);
        net.refresh_link(b, c, 80, 10, 40, mode | EdgeUpdateMode::AIRCRAFT);
        net.update_station_supply(a, 60);
        net.set_station_demand(c, 60);
        for _ in 0..200 {
            net.step();
        }
        net
    }

    // -----------------------------------------------------------------------
    // Test 1: a network round-trips through the snapshot format
    // -----------------------------------------------------------------------
    #[test]
    fn network_round_trips() {
        let net = populated_network();
        let bytes = serialize_network(&net).unwrap();
        let restored = deserialize_network(&bytes).unwrap();

        assert_eq!(restored.cargo(), net.cargo());
        assert_eq!(restored.class(), net.class());
        assert_eq!(restored.tick(), net.tick());
        assert_eq!(restored.graphs().len(), net.graphs().len());
        assert_eq!(restored.stations().len(), net.stations().len());
        for (gid, graph) in net.graphs() {
            let other = &restored.graphs()[gid];
            assert_eq!(other.node_count(), graph.node_count());
            for (f, t, edge) in graph.edges() {
                let restored_edge = other.get_edge(f, t).unwrap();
                assert_eq!(restored_edge.capacity, edge.capacity);
                assert_eq!(restored_edge.usage, edge.usage);
                assert_eq!(
                    restored_edge.last_unrestricted_update,
                    edge.last_unrestricted_update
                );
            }
        }
        for (sid, station) in net.stations() {
            let other = &restored.stations()[sid];
            assert_eq!(other.node, station.node);
            assert_eq!(other.link_graph, station.link_graph);
            assert_eq!(other.flows, station.flows);
        }
    }

    // -----------------------------------------------------------------------
    // Test 2: in-flight jobs land in the restored queue
    // -----------------------------------------------------------------------
    #[test]
    fn running_jobs_fold_into_queue() {
        let net = populated_network();
        let total =
            net.schedule().queued_len() + net.schedule().running_len();
        assert!(total > 0);

        let bytes = serialize_network(&net).unwrap();
        let restored = deserialize_network(&bytes).unwrap();
        assert_eq!(restored.schedule().queued_len(), total);
        assert_eq!(restored.schedule().running_len(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 3: header probing and validation
    // -----------------------------------------------------------------------
    #[test]
    fn header_validation() {
        let net = populated_network();
        let bytes = serialize_network(&net).unwrap();
        let header = read_snapshot_header(&bytes).unwrap();
        assert_eq!(header.magic, SNAPSHOT_MAGIC);
        assert_eq!(header.version, FORMAT_VERSION);
        assert_eq!(header.tick, net.tick());

        let bad = SnapshotHeader {
            magic: 0xDEAD_BEEF,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(
            bad.validate(),
            Err(DeserializeError::InvalidMagic(0xDEAD_BEEF))
        ));

        let future = SnapshotHeader {
            version: FORMAT_VERSION + 1,
            ..SnapshotHeader::new(0)
        };
        assert!(matches!(
            future.validate(),
            Err(DeserializeError::FutureVersion(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 4: garbage input fails with a decode error, not a panic
    // -----------------------------------------------------------------------
    #[test]
    fn garbage_input_is_rejected() {
        assert!(matches!(
            deserialize_network(&[0x00, 0x01, 0x02]),
            Err(DeserializeError::Decode(_))
        ));
    }
}
