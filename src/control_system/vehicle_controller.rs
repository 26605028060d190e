// vehicle_controller.rs
//
// One controller per managed vehicle slot. It claims a free vehicle, follows it
// until it disappears and reroutes it when its remaining route is slow or closed.

use crate::config::VehicleTuning;
use crate::control_system::claim_registry::ClaimRegistry;
use crate::error::{ControlError, ControlResult};
use crate::network::Router;
use crate::scheduler::Controller;
use crate::shared_data::{ControllerId, EdgeId, RemovalReason, VehicleId};
use crate::simulation_engine::SimulationSurface;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Vehicles that were given a new route at least once. Entries are never removed.
#[derive(Debug, Default)]
pub struct RerouteLog {
    rerouted: Mutex<HashSet<VehicleId>>,
}

impl RerouteLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a vehicle is recorded.
    pub fn record(&self, vehicle: &str) -> bool {
        self.rerouted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vehicle.to_string())
    }

    pub fn contains(&self, vehicle: &str) -> bool {
        self.rerouted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(vehicle)
    }

    pub fn count(&self) -> usize {
        self.rerouted.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerouteReason {
    /// Remaining time exceeds the ideal time by the reroute factor.
    Slow,
    /// Remaining time exceeds the ideal time by more than the absolute delay.
    Delayed,
    /// An edge ahead is closed.
    Blocked,
}

/// Reroute decision for one evaluation. A blockage wins over the timing checks.
pub fn reroute_reason(
    remaining_time: f64,
    ideal_time: f64,
    blocked: bool,
    tuning: &VehicleTuning,
) -> Option<RerouteReason> {
    if blocked {
        Some(RerouteReason::Blocked)
    } else if ideal_time > 0.0 && remaining_time > ideal_time * tuning.reroute_factor {
        Some(RerouteReason::Slow)
    } else if remaining_time - ideal_time > tuning.max_absolute_delay {
        Some(RerouteReason::Delayed)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VehicleState {
    Unassigned,
    Controlling {
        vehicle: VehicleId,
        /// Simulation time of the next reroute evaluation; `None` means now.
        next_check: Option<f64>,
    },
}

pub struct VehicleController {
    id: ControllerId,
    surface: Arc<dyn SimulationSurface>,
    registry: Arc<ClaimRegistry>,
    router: Arc<Router>,
    reroutes: Arc<RerouteLog>,
    tuning: VehicleTuning,
    state: VehicleState,
    completed: u64,
}

impl VehicleController {
    pub fn new(
        id: impl Into<ControllerId>,
        surface: Arc<dyn SimulationSurface>,
        registry: Arc<ClaimRegistry>,
        router: Arc<Router>,
        reroutes: Arc<RerouteLog>,
        tuning: VehicleTuning,
    ) -> Self {
        Self {
            id: id.into(),
            surface,
            registry,
            router,
            reroutes,
            tuning,
            state: VehicleState::Unassigned,
            completed: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    /// Trips that ended while this controller held the vehicle.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn step(&mut self) -> ControlResult<()> {
        if !self.surface.is_available() {
            return Err(ControlError::SimulationUnavailable);
        }
        match self.state.clone() {
            VehicleState::Unassigned => self.try_acquire(),
            VehicleState::Controlling {
                vehicle,
                next_check,
            } => self.supervise(&vehicle, next_check),
        }
    }

    fn try_acquire(&mut self) -> ControlResult<()> {
        for candidate in self.surface.vehicle_ids()? {
            if self.registry.is_claimed(&candidate) {
                continue;
            }
            let class = match self.surface.vehicle_class(&candidate) {
                Ok(class) => class,
                // Left between the two queries.
                Err(ControlError::UnknownObject { .. }) => continue,
                Err(e) => return Err(e),
            };
            if class.is_priority() {
                continue;
            }
            if self.registry.try_claim(&candidate, &self.id) {
                log::info!("[VehicleController {}] claimed {}", self.id, candidate);
                self.state = VehicleState::Controlling {
                    vehicle: candidate,
                    next_check: None,
                };
                return Ok(());
            }
        }
        Ok(())
    }

    fn supervise(&mut self, vehicle: &str, next_check: Option<f64>) -> ControlResult<()> {
        // Only a successful listing without the vehicle counts as disappearance.
        if !self.surface.vehicle_ids()?.iter().any(|v| v == vehicle) {
            log::info!("[VehicleController {}] {} left the network", self.id, vehicle);
            self.finish(vehicle);
            return Ok(());
        }

        let route = self.surface.vehicle_route(vehicle)?;
        let index = self.surface.vehicle_route_index(vehicle)?;
        if let Some(last) = route.last() {
            let next_is_final = index + 2 == route.len();
            if next_is_final && self.router.graph().is_blocked(&*self.surface, last) {
                log::warn!(
                    "[VehicleController {}] final edge {} of {} is closed, forcing arrival",
                    self.id,
                    last,
                    vehicle
                );
                self.surface
                    .remove_vehicle(vehicle, RemovalReason::ForcedArrival)?;
                self.finish(vehicle);
                return Ok(());
            }
        }

        let now = self.surface.current_time()?;
        if next_check.map_or(true, |due| now >= due) {
            self.evaluate_reroute(vehicle, &route, index)?;
            self.state = VehicleState::Controlling {
                vehicle: vehicle.to_string(),
                next_check: Some(now + self.tuning.reroute_check_period),
            };
        }
        Ok(())
    }

    fn finish(&mut self, vehicle: &str) {
        self.registry.release(vehicle);
        self.completed += 1;
        self.state = VehicleState::Unassigned;
    }

    fn evaluate_reroute(&self, vehicle: &str, route: &[EdgeId], index: usize) -> ControlResult<()> {
        let Some(dest) = route.last() else {
            return Ok(());
        };
        let current = self.surface.vehicle_road(vehicle)?;
        if current.is_empty() || current.starts_with(':') || current == *dest {
            return Ok(());
        }
        let start = if route.get(index) == Some(&current) {
            index
        } else {
            route.iter().position(|e| *e == current).unwrap_or(0)
        };
        let remaining = &route[start..];

        let graph = self.router.graph();
        let conditions = &*self.surface;
        let remaining_time: f64 = remaining
            .iter()
            .map(|e| graph.travel_time(conditions, e))
            .sum();
        let ideal_time: f64 = remaining
            .iter()
            .filter_map(|e| graph.edge(e))
            .map(|e| e.free_flow_time())
            .sum();
        let blocked = remaining[1..].iter().any(|e| graph.is_blocked(conditions, e));

        let Some(reason) = reroute_reason(remaining_time, ideal_time, blocked, &self.tuning) else {
            return Ok(());
        };
        log::debug!(
            "[VehicleController {}] {} needs a reroute ({:?}): remaining {:.1}s, ideal {:.1}s",
            self.id,
            vehicle,
            reason,
            remaining_time,
            ideal_time
        );

        match self.router.find_route(conditions, &current, dest) {
            Ok(new_route) if new_route.as_slice() != remaining => {
                self.surface.set_vehicle_route(vehicle, &new_route)?;
                self.reroutes.record(vehicle);
                log::info!(
                    "[VehicleController {}] rerouted {} at {}: {:?} -> {:?}",
                    self.id,
                    vehicle,
                    current,
                    remaining,
                    new_route
                );
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e @ ControlError::NoRoute { .. }) => {
                log::debug!("[VehicleController {}] keeping route of {}: {}", self.id, vehicle, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Controller for VehicleController {
    fn name(&self) -> String {
        format!("VehicleController {}", self.id)
    }

    async fn tick(&mut self) -> ControlResult<()> {
        self.step()
    }
}
