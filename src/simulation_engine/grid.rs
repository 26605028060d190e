// grid.rs
//
// Minimal in-process micro-simulation behind `SimulationSurface`. Vehicles cruise
// along their route at a class-dependent speed, stop at red stop lines and in
// front of closed edges, and leave the network at the end of their route. There
// is no car following; it exists to drive the controllers in demos and tests.

use crate::error::{ControlError, ControlResult};
use crate::network::graph::NetworkConditions;
use crate::network::topology::TopologyDocument;
use crate::shared_data::{
    EdgeId, IntersectionId, LaneId, RemovalReason, VehicleClass, VehicleId,
};
use crate::simulation_engine::surface::{Phase, SimulationSurface};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct SimEdge {
    length: f64,
    max_speed: f64,
    lanes: Vec<LaneId>,
    from: Option<(f64, f64)>,
    to: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
struct SimSignal {
    phases: Vec<Phase>,
    controlled_lanes: Vec<LaneId>,
    current: usize,
}

#[derive(Debug, Clone)]
struct SimVehicle {
    class: VehicleClass,
    route: Vec<EdgeId>,
    route_index: usize,
    lane: LaneId,
    /// Distance travelled along the current edge.
    position: f64,
    speed: f64,
    waiting_time: f64,
}

impl SimVehicle {
    fn edge(&self) -> &str {
        &self.route[self.route_index]
    }
}

fn desired_speed(class: VehicleClass) -> f64 {
    match class {
        VehicleClass::Passenger => 13.89,
        VehicleClass::Bus => 11.0,
        VehicleClass::Truck => 10.0,
        VehicleClass::Emergency => 20.0,
    }
}

#[derive(Debug, Default)]
struct GridState {
    time: f64,
    edges: HashMap<EdgeId, SimEdge>,
    lane_disallowed: HashMap<LaneId, HashSet<VehicleClass>>,
    signals: BTreeMap<IntersectionId, SimSignal>,
    /// Controlled lane -> (intersection, index into its state strings).
    stop_lines: HashMap<LaneId, (IntersectionId, usize)>,
    vehicles: BTreeMap<VehicleId, SimVehicle>,
    arrived: usize,
}

impl GridState {
    fn edge(&self, edge_id: &str) -> ControlResult<&SimEdge> {
        self.edges
            .get(edge_id)
            .ok_or_else(|| ControlError::unknown("edge", edge_id))
    }

    fn signal(&self, intersection_id: &str) -> ControlResult<&SimSignal> {
        self.signals
            .get(intersection_id)
            .ok_or_else(|| ControlError::unknown("intersection", intersection_id))
    }

    fn vehicle(&self, vehicle_id: &str) -> ControlResult<&SimVehicle> {
        self.vehicles
            .get(vehicle_id)
            .ok_or_else(|| ControlError::unknown("vehicle", vehicle_id))
    }

    fn lane_allows(&self, lane: &str, class: VehicleClass) -> bool {
        self.lane_disallowed
            .get(lane)
            .map_or(true, |set| !set.contains(&class))
    }

    /// First lane of the edge open to the class, or its first lane when all are closed.
    fn entry_lane(&self, edge: &SimEdge, class: VehicleClass) -> LaneId {
        edge.lanes
            .iter()
            .find(|lane| self.lane_allows(lane, class))
            .or_else(|| edge.lanes.first())
            .cloned()
            .unwrap_or_default()
    }

    fn edge_closed_to(&self, edge: &SimEdge, class: VehicleClass) -> bool {
        !edge.lanes.iter().any(|lane| self.lane_allows(lane, class))
    }

    fn red_at(&self, lane: &str) -> bool {
        match self.stop_lines.get(lane) {
            Some((intersection, index)) => self
                .signals
                .get(intersection)
                .map_or(false, |s| !s.phases[s.current].lets_through(*index)),
            None => false,
        }
    }

    fn advance(&mut self, dt: f64) {
        self.time += dt;
        let ids: Vec<VehicleId> = self.vehicles.keys().cloned().collect();
        let mut finished = Vec::new();

        for id in ids {
            let Some(mut vehicle) = self.vehicles.remove(&id) else {
                continue;
            };
            let mut budget: Option<f64> = None;
            let mut moved = 0.0;
            let mut arrived = false;

            loop {
                let Some(edge) = self.edges.get(vehicle.edge()) else {
                    arrived = true;
                    break;
                };
                let left = *budget.get_or_insert_with(|| {
                    let cruise = desired_speed(vehicle.class);
                    // Emergency vehicles may exceed the limit.
                    if vehicle.class == VehicleClass::Emergency {
                        cruise * dt
                    } else {
                        cruise.min(edge.max_speed) * dt
                    }
                });
                let remaining = edge.length - vehicle.position;
                if left < remaining {
                    vehicle.position += left;
                    moved += left;
                    break;
                }
                if vehicle.route_index + 1 >= vehicle.route.len() {
                    arrived = true;
                    break;
                }
                let next_id = vehicle.route[vehicle.route_index + 1].clone();
                let next_lane = match self.edges.get(&next_id) {
                    Some(next) if !self.edge_closed_to(next, vehicle.class) => {
                        Some(self.entry_lane(next, vehicle.class))
                    }
                    _ => None,
                };
                let length = edge.length;
                match next_lane {
                    Some(lane) if !self.red_at(&vehicle.lane) => {
                        budget = Some(left - remaining);
                        moved += remaining;
                        vehicle.route_index += 1;
                        vehicle.position = 0.0;
                        vehicle.lane = lane;
                    }
                    _ => {
                        // Queue at the stop line.
                        vehicle.position = length;
                        moved += remaining;
                        break;
                    }
                }
            }

            if arrived {
                finished.push(id);
                continue;
            }
            vehicle.speed = moved / dt;
            if moved <= f64::EPSILON {
                vehicle.waiting_time += dt;
            } else {
                vehicle.waiting_time = 0.0;
            }
            self.vehicles.insert(id, vehicle);
        }

        self.arrived += finished.len();
        for id in finished {
            log::debug!("[GridSimulation] vehicle {} arrived at t={:.1}", id, self.time);
        }
    }
}

/// Thread-safe in-process simulation.
#[derive(Debug)]
pub struct GridSimulation {
    state: Mutex<GridState>,
    available: AtomicBool,
    step_length: f64,
    faults: Mutex<HashSet<String>>,
}

impl GridSimulation {
    pub fn from_topology(doc: &TopologyDocument, step_length: f64) -> ControlResult<Self> {
        doc.validate()?;
        let nodes: HashMap<&str, (f64, f64)> =
            doc.nodes.iter().map(|n| (n.id.as_str(), (n.x, n.y))).collect();

        let mut state = GridState::default();
        for spec in &doc.edges {
            let lookup = |node: &Option<String>| node.as_deref().and_then(|n| nodes.get(n).copied());
            state.edges.insert(
                spec.id.clone(),
                SimEdge {
                    length: spec.length,
                    max_speed: spec.max_speed,
                    lanes: spec.lane_ids(),
                    from: lookup(&spec.from),
                    to: lookup(&spec.to),
                },
            );
            for lane in spec.lane_ids() {
                state.lane_disallowed.insert(lane, HashSet::new());
            }
        }
        for spec in &doc.intersections {
            for (i, lane) in spec.controlled_lanes.iter().enumerate() {
                state
                    .stop_lines
                    .insert(lane.clone(), (spec.id.clone(), i));
            }
            state.signals.insert(
                spec.id.clone(),
                SimSignal {
                    phases: spec
                        .phases
                        .iter()
                        .enumerate()
                        .map(|(i, s)| Phase::new(i, s.clone()))
                        .collect(),
                    controlled_lanes: spec.controlled_lanes.clone(),
                    current: 0,
                },
            );
        }

        Ok(Self {
            state: Mutex::new(state),
            available: AtomicBool::new(true),
            step_length: if step_length > 0.0 { step_length } else { 1.0 },
            faults: Mutex::new(HashSet::new()),
        })
    }

    /// Simulates the simulation being unloaded or reloaded.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes every call of `operation` fail until `clear_faults`. Lane writes
    /// also honour `set_lane_disallowed:<lane>` for a single lane.
    pub fn inject_fault(&self, operation: &str) {
        self.faults_guard().insert(operation.to_string());
    }

    pub fn clear_faults(&self) {
        self.faults_guard().clear();
    }

    pub fn arrived_count(&self) -> usize {
        self.lock().arrived
    }

    /// Moves a vehicle to `position` meters along the `route_index`-th edge of its route.
    pub fn place_vehicle(
        &self,
        vehicle_id: &str,
        route_index: usize,
        position: f64,
    ) -> ControlResult<()> {
        let mut state = self.lock();
        let GridState {
            vehicles,
            edges,
            lane_disallowed,
            ..
        } = &mut *state;
        let vehicle = vehicles
            .get_mut(vehicle_id)
            .ok_or_else(|| ControlError::unknown("vehicle", vehicle_id))?;
        let edge_id = vehicle
            .route
            .get(route_index)
            .ok_or_else(|| ControlError::Simulation(format!("route index {} out of range", route_index)))?;
        let edge = edges
            .get(edge_id)
            .ok_or_else(|| ControlError::unknown("edge", edge_id.as_str()))?;
        let class = vehicle.class;
        vehicle.lane = edge
            .lanes
            .iter()
            .find(|l| lane_disallowed.get(*l).map_or(true, |s| !s.contains(&class)))
            .or_else(|| edge.lanes.first())
            .cloned()
            .unwrap_or_default();
        vehicle.route_index = route_index;
        vehicle.position = position.clamp(0.0, edge.length);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, GridState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults_guard(&self) -> MutexGuard<'_, HashSet<String>> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Availability and fault check run before every surface call.
    fn check(&self, operation: &str) -> ControlResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ControlError::SimulationUnavailable);
        }
        if self.faults_guard().contains(operation) {
            return Err(ControlError::Simulation(format!("{} failed", operation)));
        }
        Ok(())
    }

    fn checked(&self, operation: &str) -> ControlResult<MutexGuard<'_, GridState>> {
        self.check(operation)?;
        Ok(self.lock())
    }
}

impl NetworkConditions for GridSimulation {
    fn lane_disallowed(&self, lane_id: &str) -> ControlResult<HashSet<VehicleClass>> {
        let state = self.checked("lane_disallowed")?;
        state
            .lane_disallowed
            .get(lane_id)
            .cloned()
            .ok_or_else(|| ControlError::unknown("lane", lane_id))
    }

    fn edge_travel_time(&self, edge_id: &str) -> ControlResult<f64> {
        let state = self.checked("edge_travel_time")?;
        let edge = state.edge(edge_id)?;
        let speeds: Vec<f64> = state
            .vehicles
            .values()
            .filter(|v| v.edge() == edge_id)
            .map(|v| v.speed)
            .collect();
        if speeds.is_empty() {
            return Ok(edge.length / edge.max_speed.max(0.1));
        }
        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        Ok(edge.length / mean.max(0.1))
    }
}

impl SimulationSurface for GridSimulation {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn current_time(&self) -> ControlResult<f64> {
        Ok(self.checked("current_time")?.time)
    }

    fn phase(&self, intersection_id: &str) -> ControlResult<usize> {
        Ok(self.checked("phase")?.signal(intersection_id)?.current)
    }

    fn set_phase(&self, intersection_id: &str, phase: usize) -> ControlResult<()> {
        let mut state = self.checked("set_phase")?;
        let signal = state
            .signals
            .get_mut(intersection_id)
            .ok_or_else(|| ControlError::unknown("intersection", intersection_id))?;
        if phase >= signal.phases.len() {
            return Err(ControlError::Simulation(format!(
                "phase {} out of range for {} ({} phases)",
                phase,
                intersection_id,
                signal.phases.len()
            )));
        }
        signal.current = phase;
        Ok(())
    }

    fn phase_definitions(&self, intersection_id: &str) -> ControlResult<Vec<Phase>> {
        Ok(self
            .checked("phase_definitions")?
            .signal(intersection_id)?
            .phases
            .clone())
    }

    fn controlled_lanes(&self, intersection_id: &str) -> ControlResult<Vec<LaneId>> {
        Ok(self
            .checked("controlled_lanes")?
            .signal(intersection_id)?
            .controlled_lanes
            .clone())
    }

    fn lane_vehicle_count(&self, lane_id: &str) -> ControlResult<u32> {
        let state = self.checked("lane_vehicle_count")?;
        if !state.lane_disallowed.contains_key(lane_id) {
            return Err(ControlError::unknown("lane", lane_id));
        }
        Ok(state.vehicles.values().filter(|v| v.lane == lane_id).count() as u32)
    }

    fn lane_waiting_time(&self, lane_id: &str) -> ControlResult<f64> {
        let state = self.checked("lane_waiting_time")?;
        if !state.lane_disallowed.contains_key(lane_id) {
            return Err(ControlError::unknown("lane", lane_id));
        }
        Ok(state
            .vehicles
            .values()
            .filter(|v| v.lane == lane_id)
            .map(|v| v.waiting_time)
            .sum())
    }

    fn set_lane_disallowed(
        &self,
        lane_id: &str,
        classes: &HashSet<VehicleClass>,
    ) -> ControlResult<()> {
        self.check(&format!("set_lane_disallowed:{}", lane_id))?;
        let mut state = self.checked("set_lane_disallowed")?;
        let slot = state
            .lane_disallowed
            .get_mut(lane_id)
            .ok_or_else(|| ControlError::unknown("lane", lane_id))?;
        *slot = classes.clone();
        Ok(())
    }

    fn vehicle_ids(&self) -> ControlResult<Vec<VehicleId>> {
        Ok(self.checked("vehicle_ids")?.vehicles.keys().cloned().collect())
    }

    fn vehicle_class(&self, vehicle_id: &str) -> ControlResult<VehicleClass> {
        Ok(self.checked("vehicle_class")?.vehicle(vehicle_id)?.class)
    }

    fn vehicle_position(&self, vehicle_id: &str) -> ControlResult<(f64, f64)> {
        let state = self.checked("vehicle_position")?;
        let vehicle = state.vehicle(vehicle_id)?;
        let edge = state.edge(vehicle.edge())?;
        match (edge.from, edge.to) {
            (Some((x0, y0)), Some((x1, y1))) => {
                let t = vehicle.position / edge.length;
                Ok((x0 + (x1 - x0) * t, y0 + (y1 - y0) * t))
            }
            _ => Ok((vehicle.position, 0.0)),
        }
    }

    fn vehicle_speed(&self, vehicle_id: &str) -> ControlResult<f64> {
        Ok(self.checked("vehicle_speed")?.vehicle(vehicle_id)?.speed)
    }

    fn vehicle_route(&self, vehicle_id: &str) -> ControlResult<Vec<EdgeId>> {
        Ok(self
            .checked("vehicle_route")?
            .vehicle(vehicle_id)?
            .route
            .clone())
    }

    fn vehicle_road(&self, vehicle_id: &str) -> ControlResult<EdgeId> {
        Ok(self
            .checked("vehicle_road")?
            .vehicle(vehicle_id)?
            .edge()
            .to_string())
    }

    fn vehicle_lane(&self, vehicle_id: &str) -> ControlResult<LaneId> {
        Ok(self
            .checked("vehicle_lane")?
            .vehicle(vehicle_id)?
            .lane
            .clone())
    }

    fn vehicle_route_index(&self, vehicle_id: &str) -> ControlResult<usize> {
        Ok(self
            .checked("vehicle_route_index")?
            .vehicle(vehicle_id)?
            .route_index)
    }

    fn next_signal(&self, vehicle_id: &str) -> ControlResult<Option<(IntersectionId, f64)>> {
        let state = self.checked("next_signal")?;
        let vehicle = state.vehicle(vehicle_id)?;
        let current = state.edge(vehicle.edge())?;
        let mut distance = current.length - vehicle.position;
        if let Some((intersection, _)) = state.stop_lines.get(&vehicle.lane) {
            return Ok(Some((intersection.clone(), distance)));
        }
        for edge_id in &vehicle.route[vehicle.route_index + 1..] {
            let edge = state.edge(edge_id)?;
            distance += edge.length;
            if let Some((intersection, _)) =
                edge.lanes.iter().find_map(|lane| state.stop_lines.get(lane))
            {
                return Ok(Some((intersection.clone(), distance)));
            }
        }
        Ok(None)
    }

    fn edge_length(&self, edge_id: &str) -> ControlResult<f64> {
        Ok(self.checked("edge_length")?.edge(edge_id)?.length)
    }

    fn edge_max_speed(&self, edge_id: &str) -> ControlResult<f64> {
        Ok(self.checked("edge_max_speed")?.edge(edge_id)?.max_speed)
    }

    fn add_vehicle(
        &self,
        vehicle_id: &str,
        route: &[EdgeId],
        class: VehicleClass,
    ) -> ControlResult<()> {
        let mut state = self.checked("add_vehicle")?;
        if state.vehicles.contains_key(vehicle_id) {
            return Err(ControlError::Simulation(format!(
                "vehicle {} already exists",
                vehicle_id
            )));
        }
        let first = route
            .first()
            .ok_or_else(|| ControlError::Simulation(format!("empty route for {}", vehicle_id)))?;
        for edge_id in route {
            state.edge(edge_id)?;
        }
        let lane = state.entry_lane(state.edge(first)?, class);
        state.vehicles.insert(
            vehicle_id.to_string(),
            SimVehicle {
                class,
                route: route.to_vec(),
                route_index: 0,
                lane,
                position: 0.0,
                speed: 0.0,
                waiting_time: 0.0,
            },
        );
        Ok(())
    }

    fn set_vehicle_route(&self, vehicle_id: &str, route: &[EdgeId]) -> ControlResult<()> {
        let mut state = self.checked("set_vehicle_route")?;
        for edge_id in route {
            state.edge(edge_id)?;
        }
        let vehicle = state
            .vehicles
            .get_mut(vehicle_id)
            .ok_or_else(|| ControlError::unknown("vehicle", vehicle_id))?;
        if route.first().map(String::as_str) != Some(vehicle.edge()) {
            return Err(ControlError::Simulation(format!(
                "new route for {} must start at its current edge {}",
                vehicle_id,
                vehicle.edge()
            )));
        }
        vehicle.route = route.to_vec();
        vehicle.route_index = 0;
        Ok(())
    }

    fn remove_vehicle(&self, vehicle_id: &str, reason: RemovalReason) -> ControlResult<()> {
        let mut state = self.checked("remove_vehicle")?;
        state
            .vehicles
            .remove(vehicle_id)
            .ok_or_else(|| ControlError::unknown("vehicle", vehicle_id))?;
        if reason == RemovalReason::ForcedArrival {
            state.arrived += 1;
        }
        log::debug!("[GridSimulation] removed {} ({:?})", vehicle_id, reason);
        Ok(())
    }

    fn advance_step(&self) -> ControlResult<()> {
        let mut state = self.checked("advance_step")?;
        state.advance(self.step_length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::topology::demo_grid;

    fn grid() -> GridSimulation {
        GridSimulation::from_topology(&demo_grid(3, 3), 1.0).unwrap()
    }

    fn route(edges: &[&str]) -> Vec<EdgeId> {
        edges.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn vehicle_travels_and_arrives() {
        let sim = grid();
        sim.add_vehicle("car", &route(&["h00", "h01"]), VehicleClass::Passenger)
            .unwrap();
        // J01 starts on phase 0: horizontal green.
        for _ in 0..30 {
            sim.advance_step().unwrap();
        }
        assert!(sim.vehicle_ids().unwrap().is_empty());
        assert_eq!(sim.arrived_count(), 1);
        assert_eq!(sim.current_time().unwrap(), 30.0);
    }

    #[test]
    fn red_light_holds_vehicles_and_accumulates_waiting() {
        let sim = grid();
        // J01 lanes: h00_0, -h01_0 (horizontal), then -v01_0 (vertical).
        sim.set_phase("J01", 3).unwrap();
        sim.add_vehicle("car", &route(&["h00", "h01"]), VehicleClass::Passenger)
            .unwrap();
        for _ in 0..15 {
            sim.advance_step().unwrap();
        }
        assert_eq!(sim.vehicle_road("car").unwrap(), "h00");
        assert_eq!(sim.vehicle_speed("car").unwrap(), 0.0);
        assert_eq!(sim.lane_vehicle_count("h00_0").unwrap(), 1);
        assert!(sim.lane_waiting_time("h00_0").unwrap() > 0.0);
        // Slow traffic shows up in the travel-time estimate.
        assert!(sim.edge_travel_time("h00").unwrap() > 100.0);

        sim.set_phase("J01", 0).unwrap();
        sim.advance_step().unwrap();
        assert_eq!(sim.vehicle_road("car").unwrap(), "h01");
        assert_eq!(sim.lane_waiting_time("h01_0").unwrap(), 0.0);
    }

    #[test]
    fn closed_next_edge_holds_vehicle() {
        let sim = grid();
        let closed: HashSet<VehicleClass> = [VehicleClass::Passenger].into_iter().collect();
        sim.set_lane_disallowed("h01_0", &closed).unwrap();
        sim.add_vehicle("car", &route(&["h00", "h01"]), VehicleClass::Passenger)
            .unwrap();
        for _ in 0..20 {
            sim.advance_step().unwrap();
        }
        assert_eq!(sim.vehicle_road("car").unwrap(), "h00");
        assert!(sim.lane_disallowed("h01_0").unwrap().contains(&VehicleClass::Passenger));
    }

    #[test]
    fn next_signal_reports_distance_to_stop_line() {
        let sim = grid();
        sim.add_vehicle(
            "ambulance_0",
            &route(&["h00", "h01"]),
            VehicleClass::Emergency,
        )
        .unwrap();
        sim.place_vehicle("ambulance_0", 0, 40.0).unwrap();
        let (intersection, distance) = sim.next_signal("ambulance_0").unwrap().unwrap();
        assert_eq!(intersection, "J01");
        assert!((distance - 60.0).abs() < 1e-9);
        assert_eq!(sim.vehicle_position("ambulance_0").unwrap(), (40.0, 0.0));

        // h01 ends at corner n02, which has no signal.
        sim.place_vehicle("ambulance_0", 1, 10.0).unwrap();
        assert_eq!(sim.next_signal("ambulance_0").unwrap(), None);
    }

    #[test]
    fn route_replacement_must_start_on_current_edge() {
        let sim = grid();
        sim.add_vehicle("car", &route(&["h00", "h01"]), VehicleClass::Passenger)
            .unwrap();
        assert!(sim
            .set_vehicle_route("car", &route(&["h01", "v02"]))
            .is_err());
        sim.set_vehicle_route("car", &route(&["h00", "v01", "h11"]))
            .unwrap();
        assert_eq!(sim.vehicle_route("car").unwrap().len(), 3);
        assert_eq!(sim.vehicle_route_index("car").unwrap(), 0);
    }

    #[test]
    fn unavailable_and_faulty_calls_fail() {
        let sim = grid();
        sim.set_available(false);
        assert!(matches!(
            sim.vehicle_ids(),
            Err(ControlError::SimulationUnavailable)
        ));
        sim.set_available(true);
        sim.inject_fault("vehicle_ids");
        assert!(matches!(sim.vehicle_ids(), Err(ControlError::Simulation(_))));
        assert!(sim.current_time().is_ok());
        sim.clear_faults();
        assert!(sim.vehicle_ids().is_ok());
    }

    #[test]
    fn unknown_objects_are_reported() {
        let sim = grid();
        assert!(matches!(
            sim.phase("J99"),
            Err(ControlError::UnknownObject { kind: "intersection", .. })
        ));
        assert!(sim.set_phase("J11", 17).is_err());
        assert!(sim
            .remove_vehicle("ghost", RemovalReason::ForcedArrival)
            .is_err());
    }
}
