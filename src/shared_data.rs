// src/shared_data.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type EdgeId = String;
pub type LaneId = String;
pub type VehicleId = String;
pub type IntersectionId = String;
pub type ControllerId = String;

/// Vehicle classes known to lane permission masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Passenger,
    Bus,
    Truck,
    Emergency,
}

impl VehicleClass {
    /// Priority vehicles are handled by the emergency controller, never claimed.
    pub fn is_priority(self) -> bool {
        matches!(self, VehicleClass::Emergency)
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VehicleClass::Passenger => write!(f, "passenger"),
            VehicleClass::Bus => write!(f, "bus"),
            VehicleClass::Truck => write!(f, "truck"),
            VehicleClass::Emergency => write!(f, "emergency"),
        }
    }
}

/// Why a vehicle was taken out of the simulation by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    /// The final edge is closed; the trip counts as completed.
    ForcedArrival,
    Teleport,
}

/// Edge part of a `<edge>_<index>` lane id.
pub fn lane_edge(lane_id: &str) -> &str {
    match lane_id.rsplit_once('_') {
        Some((edge, index)) if !edge.is_empty() && index.chars().all(|c| c.is_ascii_digit()) => {
            edge
        }
        _ => lane_id,
    }
}

/// Opposite-direction lane under the `-<edge>` naming convention.
pub fn opposite_lane(lane_id: &str) -> String {
    match lane_id.strip_prefix('-') {
        Some(rest) => rest.to_string(),
        None => format!("-{}", lane_id),
    }
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
