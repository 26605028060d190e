// emergency_controller.rs
//
// Keeps emergency vehicles on the road and asks for priority when one of them
// nears a signalized intersection.

use crate::communication::{Message, Outbox, PriorityRequest};
use crate::config::{EmergencyTuning, EMERGENCY_ADDRESS, RELAY_ADDRESS};
use crate::error::{ControlError, ControlResult};
use crate::network::RouteDatabase;
use crate::scheduler::Controller;
use crate::shared_data::{VehicleClass, VehicleId};
use crate::simulation_engine::SimulationSurface;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub struct EmergencyController {
    surface: Arc<dyn SimulationSurface>,
    outbox: Arc<dyn Outbox>,
    routes: Arc<RouteDatabase>,
    tuning: EmergencyTuning,
    rng: StdRng,
    /// Tracked emergency vehicle -> simulation time it was first seen.
    active: BTreeMap<VehicleId, f64>,
    ordinary: HashSet<VehicleId>,
    spawned: usize,
    last_spawn: Option<f64>,
    requests_sent: u64,
}

impl EmergencyController {
    pub fn new(
        surface: Arc<dyn SimulationSurface>,
        outbox: Arc<dyn Outbox>,
        routes: Arc<RouteDatabase>,
        tuning: EmergencyTuning,
        seed: u64,
    ) -> Self {
        Self {
            surface,
            outbox,
            routes,
            tuning,
            rng: StdRng::seed_from_u64(seed),
            active: BTreeMap::new(),
            ordinary: HashSet::new(),
            spawned: 0,
            last_spawn: None,
            requests_sent: 0,
        }
    }

    pub fn active(&self) -> Vec<&str> {
        self.active.keys().map(String::as_str).collect()
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn step(&mut self) -> ControlResult<()> {
        if !self.surface.is_available() {
            return Err(ControlError::SimulationUnavailable);
        }
        let now = self.surface.current_time()?;
        self.maybe_spawn(now)?;

        let present = self.surface.vehicle_ids()?;
        self.adopt(&present, now)?;

        let mut finished = Vec::new();
        for (vehicle, since) in &self.active {
            if !present.contains(vehicle) {
                // Freshly inserted vehicles may not be listed yet.
                if now - since >= self.tuning.grace_period {
                    finished.push(vehicle.clone());
                }
                continue;
            }
            let next = match self.surface.next_signal(vehicle) {
                Ok(next) => next,
                Err(ControlError::UnknownObject { .. }) => continue,
                Err(e) => return Err(e),
            };
            let Some((intersection, distance)) = next else {
                continue;
            };
            if distance >= self.tuning.approach_distance {
                continue;
            }
            let request = PriorityRequest::new(vehicle.as_str(), intersection, now);
            match self
                .outbox
                .send(Message::request(EMERGENCY_ADDRESS, RELAY_ADDRESS, request.encode()))
            {
                Ok(()) => {
                    self.requests_sent += 1;
                    log::debug!(
                        "[EmergencyController] {} is {:.0} m from {}, priority requested",
                        vehicle,
                        distance,
                        request.intersection
                    );
                }
                Err(e) => log::warn!("[EmergencyController] priority request lost: {}", e),
            }
        }

        for vehicle in finished {
            self.active.remove(&vehicle);
            log::info!("[EmergencyController] {} finished", vehicle);
        }
        Ok(())
    }

    fn maybe_spawn(&mut self, now: f64) -> ControlResult<()> {
        if self.tuning.spawn_period <= 0.0 || self.active.len() >= self.tuning.max_active {
            return Ok(());
        }
        if self
            .last_spawn
            .is_some_and(|last| now - last < self.tuning.spawn_period)
        {
            return Ok(());
        }
        let Some(route) = self.routes.routes().choose(&mut self.rng) else {
            return Ok(());
        };
        let id = format!("ambulance_{}", self.spawned);
        self.surface.add_vehicle(&id, route, VehicleClass::Emergency)?;
        log::info!("[EmergencyController] spawned {} on {:?}", id, route);
        self.spawned += 1;
        self.last_spawn = Some(now);
        self.active.insert(id, now);
        Ok(())
    }

    /// Tracks emergency vehicles that entered the network some other way.
    fn adopt(&mut self, present: &[VehicleId], now: f64) -> ControlResult<()> {
        for vehicle in present {
            if self.active.contains_key(vehicle) || self.ordinary.contains(vehicle) {
                continue;
            }
            match self.surface.vehicle_class(vehicle) {
                Ok(VehicleClass::Emergency) => {
                    log::info!("[EmergencyController] tracking {}", vehicle);
                    self.active.insert(vehicle.clone(), now);
                }
                Ok(_) => {
                    self.ordinary.insert(vehicle.clone());
                }
                Err(ControlError::UnknownObject { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        // Forget ordinary vehicles that left.
        self.ordinary.retain(|v| present.contains(v));
        Ok(())
    }
}

impl Controller for EmergencyController {
    fn name(&self) -> String {
        "EmergencyController".to_string()
    }

    async fn tick(&mut self) -> ControlResult<()> {
        self.step()
    }
}
