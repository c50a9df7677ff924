//! Flow share tables: the output artifact of a distribution run.
//!
//! A station keeps one [`FlowStatMap`] per cargo, keyed by the *origin*
//! station of the cargo. Each [`FlowStat`] lists via-stations (next hops)
//! with proportional shares. Readers must tolerate a missing entry: it
//! means "no computed route yet, fall back to a local decision".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::StationId;

// ---------------------------------------------------------------------------
// FlowStat
// ---------------------------------------------------------------------------

/// One share of flow toward a via (next-hop) station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowShare {
    /// Next hop for this share of the cargo.
    pub via: StationId,
    /// Proportional amount.
    pub amount: u32,
    /// Restricted shares are kept for through-traffic accounting but are
    /// not offered to newly generated cargo.
    pub restricted: bool,
}

/// Flow shares for one origin station: where cargo originating there should
/// go next from the station holding this stat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStat {
    shares: Vec<FlowShare>,
}

impl FlowStat {
    pub fn new(via: StationId, amount: u32, restricted: bool) -> Self {
        Self {
            shares: vec![FlowShare {
                via,
                amount,
                restricted,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    pub fn shares(&self) -> &[FlowShare] {
        &self.shares
    }

    /// Sum of all shares, restricted included.
    pub fn total(&self) -> u64 {
        self.shares.iter().map(|s| s.amount as u64).sum()
    }

    /// Sum of the shares available to newly generated cargo.
    pub fn unrestricted_total(&self) -> u64 {
        self.shares
            .iter()
            .filter(|s| !s.restricted)
            .map(|s| s.amount as u64)
            .sum()
    }

    /// Add `amount` onto the share toward `via`, creating it if absent.
    pub fn append_share(&mut self, via: StationId, amount: u32, restricted: bool) {
        if let Some(share) = self
            .shares
            .iter_mut()
            .find(|s| s.via == via && s.restricted == restricted)
        {
            share.amount = share.amount.saturating_add(amount);
        } else {
            self.shares.push(FlowShare {
                via,
                amount,
                restricted,
            });
        }
    }

    /// Pick a via proportionally to the unrestricted shares. `scrambler`
    /// supplies the caller's randomness so this stays deterministic per
    /// call site. Returns `None` when no unrestricted share exists.
    pub fn via(&self, scrambler: u32) -> Option<StationId> {
        let total = self.unrestricted_total();
        if total == 0 {
            return None;
        }
        let mut point = (scrambler as u64) % total;
        for share in self.shares.iter().filter(|s| !s.restricted) {
            if point < share.amount as u64 {
                return Some(share.via);
            }
            point -= share.amount as u64;
        }
        None
    }

    /// Mark every share toward `via` restricted.
    pub fn restrict_via(&mut self, via: StationId) {
        let mut extra = 0u32;
        self.shares.retain_mut(|s| {
            if s.via == via && !s.restricted {
                extra = extra.saturating_add(s.amount);
                false
            } else {
                true
            }
        });
        if extra > 0 {
            self.append_share(via, extra, true);
        }
    }

    /// Drop every share toward `via`.
    pub fn erase_via(&mut self, via: StationId) {
        self.shares.retain(|s| s.via != via);
    }
}

// ---------------------------------------------------------------------------
// FlowStatMap
// ---------------------------------------------------------------------------

/// Per-station flow table: origin station -> [`FlowStat`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatMap {
    stats: BTreeMap<StationId, FlowStat>,
}

impl FlowStatMap {
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn get(&self, origin: StationId) -> Option<&FlowStat> {
        self.stats.get(&origin)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StationId, &FlowStat)> {
        self.stats.iter().map(|(&o, s)| (o, s))
    }

    pub fn origins(&self) -> impl Iterator<Item = StationId> + '_ {
        self.stats.keys().copied()
    }

    /// Add a share for cargo originating at `origin` toward `via`.
    pub fn add_share(&mut self, origin: StationId, via: StationId, amount: u32, restricted: bool) {
        self.stats
            .entry(origin)
            .or_default()
            .append_share(via, amount, restricted);
    }

    pub fn insert(&mut self, origin: StationId, stat: FlowStat) {
        self.stats.insert(origin, stat);
    }

    pub fn remove(&mut self, origin: StationId) -> Option<FlowStat> {
        self.stats.remove(&origin)
    }

    /// Erase the dead destination from this table: the stat keyed by it and
    /// every share routed via it, cascading to flows that only existed to
    /// feed the erased ones. Returns the origins whose stats vanished, so a
    /// caller can continue the cascade across stations.
    pub fn erase_destination(&mut self, dead: StationId) -> Vec<StationId> {
        let mut vanished = Vec::new();
        self.stats.remove(&dead);
        self.stats.retain(|&origin, stat| {
            stat.erase_via(dead);
            if stat.is_empty() {
                vanished.push(origin);
                false
            } else {
                true
            }
        });
        vanished
    }

    /// Downgrade every share via `dead` to restricted instead of deleting.
    pub fn restrict_destination(&mut self, dead: StationId) {
        for stat in self.stats.values_mut() {
            stat.restrict_via(dead);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn stations(count: usize) -> Vec<StationId> {
        let mut pool: SlotMap<StationId, ()> = SlotMap::with_key();
        (0..count).map(|_| pool.insert(())).collect()
    }

    // -----------------------------------------------------------------------
    // Test 1: append accumulates per (via, restricted) bucket
    // -----------------------------------------------------------------------
    #[test]
    fn append_share_accumulates() {
        let st = stations(2);
        let mut stat = FlowStat::new(st[0], 10, false);
        stat.append_share(st[0], 5, false);
        stat.append_share(st[1], 7, false);
        stat.append_share(st[0], 3, true);

        assert_eq!(stat.total(), 25);
        assert_eq!(stat.unrestricted_total(), 22);
        assert_eq!(stat.shares().len(), 3);
    }

    // -----------------------------------------------------------------------
    // Test 2: proportional via selection
    // -----------------------------------------------------------------------
    #[test]
    fn via_selection_proportional() {
        let st = stations(2);
        let mut stat = FlowStat::new(st[0], 10, false);
        stat.append_share(st[1], 30, false);

        // Points 0..10 land on the first share, 10..40 on the second.
        assert_eq!(stat.via(0), Some(st[0]));
        assert_eq!(stat.via(9), Some(st[0]));
        assert_eq!(stat.via(10), Some(st[1]));
        assert_eq!(stat.via(39), Some(st[1]));
        assert_eq!(stat.via(40), Some(st[0]), "wraps modulo the total");
    }

    // -----------------------------------------------------------------------
    // Test 3: via ignores restricted shares; returns None when all are
    // -----------------------------------------------------------------------
    #[test]
    fn via_skips_restricted() {
        let st = stations(2);
        let mut stat = FlowStat::new(st[0], 10, true);
        assert_eq!(stat.via(0), None);

        stat.append_share(st[1], 5, false);
        assert_eq!(stat.via(0), Some(st[1]));
    }

    // -----------------------------------------------------------------------
    // Test 4: restrict_via folds shares into one restricted bucket
    // -----------------------------------------------------------------------
    #[test]
    fn restrict_via_folds() {
        let st = stations(2);
        let mut stat = FlowStat::new(st[0], 10, false);
        stat.append_share(st[0], 4, true);
        stat.append_share(st[1], 6, false);

        stat.restrict_via(st[0]);
        assert_eq!(stat.unrestricted_total(), 6);
        assert_eq!(stat.total(), 20, "restriction preserves the amount");
        assert_eq!(stat.via(0), Some(st[1]));
    }

    // -----------------------------------------------------------------------
    // Test 5: erase_destination cascades through emptied stats
    // -----------------------------------------------------------------------
    #[test]
    fn erase_destination_cascades() {
        let st = stations(4);
        let mut map = FlowStatMap::default();
        // Origin 1 routes only via the dead station 0; origin 2 also has an
        // alternative via 3.
        map.add_share(st[1], st[0], 10, false);
        map.add_share(st[2], st[0], 5, false);
        map.add_share(st[2], st[3], 5, false);
        // A stat keyed by the dead station itself.
        map.add_share(st[0], st[3], 8, false);

        let vanished = map.erase_destination(st[0]);
        assert_eq!(vanished, vec![st[1]]);
        assert!(map.get(st[0]).is_none(), "stat keyed by dead origin removed");
        assert!(map.get(st[1]).is_none(), "emptied stat removed");
        let survivor = map.get(st[2]).unwrap();
        assert_eq!(survivor.total(), 5);
        assert_eq!(survivor.shares()[0].via, st[3]);
    }

    // -----------------------------------------------------------------------
    // Test 6: restrict_destination keeps amounts but blocks new cargo
    // -----------------------------------------------------------------------
    #[test]
    fn restrict_destination_keeps_amounts() {
        let st = stations(3);
        let mut map = FlowStatMap::default();
        map.add_share(st[1], st[0], 10, false);
        map.add_share(st[1], st[2], 2, false);

        map.restrict_destination(st[0]);
        let stat = map.get(st[1]).unwrap();
        assert_eq!(stat.total(), 12);
        assert_eq!(stat.unrestricted_total(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 7: missing entry means "no computed route"
    // -----------------------------------------------------------------------
    #[test]
    fn missing_entry_tolerated() {
        let st = stations(1);
        let map = FlowStatMap::default();
        assert!(map.get(st[0]).is_none());
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
    }
}
