//! Cargo-distribution settings.
//!
//! A [`DistributionSettings`] value is snapshotted twice: once per component
//! at creation time and once per job at spawn time. Neither snapshot is ever
//! live-updated; changing the world's settings only affects components and
//! jobs created afterwards.

use serde::{Deserialize, Serialize};

use crate::id::{CargoClass, DAY_TICKS, Ticks};

/// How cargo at a station chooses among computed flow shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionType {
    /// No computed routing; cargo follows vehicle orders only.
    Manual,
    /// Supply is distributed toward demand without requiring a return flow.
    Asymmetric,
    /// Supply is paired with a matching return flow where possible.
    Symmetric,
}

/// Settings governing demand computation and flow solving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSettings {
    /// Distribution policy for passenger-class cargo.
    pub distribution_pax: DistributionType,
    /// Distribution policy for mail/express cargo.
    pub distribution_mail: DistributionType,
    /// Distribution policy for everything else.
    pub distribution_default: DistributionType,

    /// Ticks between two scheduled runs over the same component.
    pub recalc_interval: Ticks,

    /// Highest tolerated edge load during the first solver pass, in percent
    /// of capacity. `None` lifts the cap entirely (both passes behave like
    /// the overload pass).
    pub max_saturation: Option<u16>,

    /// Demand weighting: how strongly distance reduces a destination's
    /// attractiveness, in percent. 0 disables the distance penalty.
    pub demand_distance_modifier: u16,

    /// Time advantage attributed to aircraft links when estimating travel
    /// time for links without an observed sample. 0 disables the scaling;
    /// larger values divide the tile-distance estimate.
    pub aircraft_time_factor: u16,
}

impl DistributionSettings {
    /// The policy in effect for the given cargo class.
    pub fn distribution(&self, class: CargoClass) -> DistributionType {
        match class {
            CargoClass::Passenger => self.distribution_pax,
            CargoClass::Mail | CargoClass::Express => self.distribution_mail,
            CargoClass::Bulk => self.distribution_default,
        }
    }
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            distribution_pax: DistributionType::Symmetric,
            distribution_mail: DistributionType::Asymmetric,
            distribution_default: DistributionType::Asymmetric,
            recalc_interval: 16 * DAY_TICKS,
            max_saturation: Some(80),
            demand_distance_modifier: 100,
            aircraft_time_factor: 4,
        }
    }
}
