// surface.rs
//
// The synchronous query/command surface the controllers consume. Any backend
// (the in-process grid, a bridge to an external simulator) implements it.

use crate::error::ControlResult;
use crate::network::graph::NetworkConditions;
use crate::shared_data::{EdgeId, IntersectionId, LaneId, RemovalReason, VehicleClass, VehicleId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Green,
    Yellow,
    /// All-red or any other non-green, non-yellow state.
    Transition,
}

/// One entry of an intersection's fixed cyclic signal plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub index: usize,
    /// One state character per controlled lane: `G`/`g` green, `y`/`Y` yellow, else red.
    pub state: String,
}

impl Phase {
    pub fn new(index: usize, state: impl Into<String>) -> Self {
        Self {
            index,
            state: state.into(),
        }
    }

    pub fn kind(&self) -> PhaseKind {
        if self.state.chars().any(|c| matches!(c, 'G' | 'g')) {
            PhaseKind::Green
        } else if self.state.chars().any(|c| matches!(c, 'y' | 'Y')) {
            PhaseKind::Yellow
        } else {
            PhaseKind::Transition
        }
    }

    pub fn is_green_for(&self, lane_index: usize) -> bool {
        matches!(self.state.chars().nth(lane_index), Some('G' | 'g'))
    }

    /// Whether a vehicle at the stop line of this lane may enter the junction.
    pub fn lets_through(&self, lane_index: usize) -> bool {
        matches!(self.state.chars().nth(lane_index), Some('G' | 'g' | 'y' | 'Y'))
    }
}

/// Simulation query/command surface. Every call may fail with
/// `ControlError::SimulationUnavailable` when the simulation is not running.
pub trait SimulationSurface: NetworkConditions + Send + Sync {
    fn is_available(&self) -> bool;
    /// Simulation clock in seconds.
    fn current_time(&self) -> ControlResult<f64>;

    fn phase(&self, intersection_id: &str) -> ControlResult<usize>;
    fn set_phase(&self, intersection_id: &str, phase: usize) -> ControlResult<()>;
    fn phase_definitions(&self, intersection_id: &str) -> ControlResult<Vec<Phase>>;
    fn controlled_lanes(&self, intersection_id: &str) -> ControlResult<Vec<LaneId>>;

    fn lane_vehicle_count(&self, lane_id: &str) -> ControlResult<u32>;
    /// Cumulative waiting time of the vehicles currently on the lane.
    fn lane_waiting_time(&self, lane_id: &str) -> ControlResult<f64>;
    fn set_lane_disallowed(
        &self,
        lane_id: &str,
        classes: &HashSet<VehicleClass>,
    ) -> ControlResult<()>;

    /// Active vehicles, sorted by id.
    fn vehicle_ids(&self) -> ControlResult<Vec<VehicleId>>;
    fn vehicle_class(&self, vehicle_id: &str) -> ControlResult<VehicleClass>;
    fn vehicle_position(&self, vehicle_id: &str) -> ControlResult<(f64, f64)>;
    fn vehicle_speed(&self, vehicle_id: &str) -> ControlResult<f64>;
    fn vehicle_route(&self, vehicle_id: &str) -> ControlResult<Vec<EdgeId>>;
    fn vehicle_road(&self, vehicle_id: &str) -> ControlResult<EdgeId>;
    fn vehicle_lane(&self, vehicle_id: &str) -> ControlResult<LaneId>;
    fn vehicle_route_index(&self, vehicle_id: &str) -> ControlResult<usize>;
    /// Next signalized intersection on the vehicle's route and the distance to its stop line.
    fn next_signal(&self, vehicle_id: &str) -> ControlResult<Option<(IntersectionId, f64)>>;

    fn edge_length(&self, edge_id: &str) -> ControlResult<f64>;
    fn edge_max_speed(&self, edge_id: &str) -> ControlResult<f64>;

    fn add_vehicle(
        &self,
        vehicle_id: &str,
        route: &[EdgeId],
        class: VehicleClass,
    ) -> ControlResult<()>;
    /// Replaces the route; it must start at the vehicle's current edge.
    fn set_vehicle_route(&self, vehicle_id: &str, route: &[EdgeId]) -> ControlResult<()>;
    fn remove_vehicle(&self, vehicle_id: &str, reason: RemovalReason) -> ControlResult<()>;
    fn advance_step(&self) -> ControlResult<()>;
}
