// traffic_light_controller.rs
//
// Adaptive signal control for one intersection. Green phases end early when
// another phase has clearly more demand, or when their target duration runs out;
// yellow and all-red phases always run their fixed safety time.

use crate::communication::{Mailbox, Message, Outbox, PriorityRequest};
use crate::config::{signal_address, SignalTiming, MONITOR_ADDRESS};
use crate::error::{ControlError, ControlResult};
use crate::scheduler::Controller;
use crate::shared_data::{lane_edge, IntersectionId, LaneId};
use crate::simulation_engine::{Phase, PhaseKind, SimulationSurface};
use std::sync::Arc;

/// Demand score of one phase: queued vehicles plus weighted waiting time.
pub fn demand_score(vehicles: u32, waiting_time: f64, waiting_weight: f64) -> f64 {
    vehicles as f64 + waiting_weight * waiting_time
}

/// Demand of every phase over the lanes it shows green. `counts` and `waits` are
/// indexed like the controlled lanes.
pub fn phase_demands(phases: &[Phase], counts: &[u32], waits: &[f64], waiting_weight: f64) -> Vec<f64> {
    phases
        .iter()
        .map(|phase| {
            let (vehicles, waiting) = (0..counts.len())
                .filter(|&i| phase.is_green_for(i))
                .fold((0u32, 0.0), |(v, w), i| {
                    (v + counts[i], w + waits.get(i).copied().unwrap_or(0.0))
                });
            demand_score(vehicles, waiting, waiting_weight)
        })
        .collect()
}

/// New target green after adaptive sizing on the current phase's vehicle count.
pub fn adapt_target(target: f64, current_vehicles: u32, timing: &SignalTiming) -> f64 {
    if current_vehicles > timing.high_traffic {
        (target + timing.extend_step).min(timing.max_green)
    } else if current_vehicles < timing.low_traffic {
        (target - timing.shrink_step).max(timing.min_green)
    } else {
        target
    }
}

/// Whether the green phase `current` should hand over to its successor.
pub fn green_should_end(
    elapsed: f64,
    current: usize,
    demands: &[f64],
    target: f64,
    timing: &SignalTiming,
) -> bool {
    if elapsed >= target {
        return true;
    }
    if elapsed < timing.min_green {
        return false;
    }
    let current_demand = demands.get(current).copied().unwrap_or(0.0);
    let best_other = demands
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != current)
        .map(|(_, d)| *d)
        .fold(f64::NEG_INFINITY, f64::max);
    best_other > current_demand * timing.demand_factor
}

/// Pending demand boost for the phase serving a priority vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct Preemption {
    pub phase: usize,
    pub vehicle: String,
    pub expires_at: f64,
}

pub struct SignalController {
    id: IntersectionId,
    address: String,
    surface: Arc<dyn SimulationSurface>,
    mailbox: Mailbox,
    outbox: Arc<dyn Outbox>,
    timing: SignalTiming,
    phases: Vec<Phase>,
    lanes: Vec<LaneId>,
    phase: usize,
    phase_start: f64,
    target_green: f64,
    preemption: Option<Preemption>,
    last_report: Option<f64>,
}

impl SignalController {
    /// Loads the signal plan of `intersection_id`. A missing intersection or a plan
    /// that does not match the controlled lanes is a configuration error.
    pub fn new(
        intersection_id: impl Into<IntersectionId>,
        surface: Arc<dyn SimulationSurface>,
        mailbox: Mailbox,
        outbox: Arc<dyn Outbox>,
        timing: SignalTiming,
    ) -> ControlResult<Self> {
        let id = intersection_id.into();
        let phases = surface
            .phase_definitions(&id)
            .map_err(ControlError::into_configuration)?;
        let lanes = surface
            .controlled_lanes(&id)
            .map_err(ControlError::into_configuration)?;
        if phases.is_empty() {
            return Err(ControlError::Configuration(format!(
                "intersection '{}' has no phases",
                id
            )));
        }
        if let Some(bad) = phases.iter().find(|p| p.state.chars().count() != lanes.len()) {
            return Err(ControlError::Configuration(format!(
                "phase {} of '{}' has {} states for {} controlled lanes",
                bad.index,
                id,
                bad.state.chars().count(),
                lanes.len()
            )));
        }

        let mut phase_start = 0.0;
        if surface.is_available() {
            if let Err(e) = surface.set_phase(&id, 0) {
                log::warn!("[SignalController {}] could not reset to phase 0: {}", id, e);
            }
            phase_start = surface.current_time().unwrap_or(0.0);
        }
        let target_green = timing
            .initial_green
            .clamp(timing.min_green, timing.max_green);
        log::info!(
            "[SignalController {}] controlling {} lanes with {} phases",
            id,
            lanes.len(),
            phases.len()
        );

        Ok(Self {
            address: signal_address(&id),
            id,
            surface,
            mailbox,
            outbox,
            timing,
            phases,
            lanes,
            phase: 0,
            phase_start,
            target_green,
            preemption: None,
            last_report: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    pub fn target_green(&self) -> f64 {
        self.target_green
    }

    pub fn pending_preemption(&self) -> Option<&Preemption> {
        self.preemption.as_ref()
    }

    pub fn step(&mut self) -> ControlResult<()> {
        if !self.surface.is_available() {
            return Err(ControlError::SimulationUnavailable);
        }
        let requests: Vec<PriorityRequest> = self
            .mailbox
            .drain()
            .into_iter()
            .filter_map(|m| {
                let parsed = PriorityRequest::parse(&m.body);
                if parsed.is_none() {
                    log::debug!("[SignalController {}] ignoring '{}' from {}", self.id, m.body, m.sender);
                }
                parsed
            })
            .collect();

        let now = self.surface.current_time()?;
        let active = self.surface.phase(&self.id)?;
        if active != self.phase {
            log::info!(
                "[SignalController {}] phase changed externally {} -> {}",
                self.id,
                self.phase,
                active
            );
            self.phase = active;
            self.phase_start = now;
        }
        for request in requests {
            self.register_request(&request, now);
        }
        self.settle_preemption(now);

        let elapsed = now - self.phase_start;
        let Some(current) = self.phases.get(active).cloned() else {
            return Err(ControlError::Simulation(format!(
                "{} reports phase {} outside its plan",
                self.id, active
            )));
        };
        let switch = match current.kind() {
            PhaseKind::Green => self.evaluate_green(&current, elapsed, now)?,
            PhaseKind::Yellow => elapsed >= self.timing.yellow_time,
            PhaseKind::Transition => elapsed >= self.timing.red_time,
        };
        if switch {
            let next = (active + 1) % self.phases.len();
            self.surface.set_phase(&self.id, next)?;
            log::debug!(
                "[SignalController {}] phase {} -> {} after {:.1}s",
                self.id,
                active,
                next,
                elapsed
            );
            self.phase = next;
            self.phase_start = now;
            self.settle_preemption(now);
        }

        self.report(now);
        Ok(())
    }

    fn evaluate_green(&mut self, current: &Phase, elapsed: f64, now: f64) -> ControlResult<bool> {
        let mut counts = Vec::with_capacity(self.lanes.len());
        let mut waits = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            counts.push(self.surface.lane_vehicle_count(lane)?);
            waits.push(self.surface.lane_waiting_time(lane)?);
        }
        let mut demands = phase_demands(&self.phases, &counts, &waits, self.timing.waiting_weight);

        if let Some(preemption) = &self.preemption {
            log::debug!(
                "[SignalController {}] boosting phase {} for {}",
                self.id,
                preemption.phase,
                preemption.vehicle
            );
            if let Some(demand) = demands.get_mut(preemption.phase) {
                *demand += self.timing.preemption_boost;
            }
        }

        let current_vehicles: u32 = (0..counts.len())
            .filter(|&i| current.is_green_for(i))
            .map(|i| counts[i])
            .sum();
        self.target_green = adapt_target(self.target_green, current_vehicles, &self.timing);

        Ok(green_should_end(
            elapsed,
            current.index,
            &demands,
            self.target_green,
            &self.timing,
        ))
    }

    /// A preemption holds until its phase turns green or its window closes.
    fn settle_preemption(&mut self, now: f64) {
        let Some(preemption) = &self.preemption else {
            return;
        };
        if preemption.phase == self.phase {
            log::info!(
                "[SignalController {}] phase {} serving {}",
                self.id,
                self.phase,
                preemption.vehicle
            );
            self.preemption = None;
        } else if now > preemption.expires_at {
            log::debug!(
                "[SignalController {}] preemption for {} expired",
                self.id,
                preemption.vehicle
            );
            self.preemption = None;
        }
    }

    fn register_request(&mut self, request: &PriorityRequest, now: f64) {
        if request.intersection != self.id {
            log::debug!(
                "[SignalController {}] dropping request for {}",
                self.id,
                request.intersection
            );
            return;
        }
        match self.approach_phase(&request.vehicle) {
            Ok(Some(phase)) => {
                log::info!(
                    "[SignalController {}] priority request from {}, favouring phase {}",
                    self.id,
                    request.vehicle,
                    phase
                );
                self.preemption = Some(Preemption {
                    phase,
                    vehicle: request.vehicle.clone(),
                    expires_at: now + self.timing.preemption_window,
                });
            }
            Ok(None) => log::debug!(
                "[SignalController {}] {} does not approach a controlled lane",
                self.id,
                request.vehicle
            ),
            Err(e) => log::debug!(
                "[SignalController {}] cannot resolve approach of {}: {}",
                self.id,
                request.vehicle,
                e
            ),
        }
    }

    /// First phase, in cycle order from the active one, that is green for the
    /// vehicle's next controlled approach.
    fn approach_phase(&self, vehicle: &str) -> ControlResult<Option<usize>> {
        let route = self.surface.vehicle_route(vehicle)?;
        let index = self.surface.vehicle_route_index(vehicle)?;
        let approach: Vec<usize> = route
            .iter()
            .skip(index)
            .map(|edge| {
                self.lanes
                    .iter()
                    .enumerate()
                    .filter(|(_, lane)| lane_edge(lane) == edge)
                    .map(|(i, _)| i)
                    .collect::<Vec<usize>>()
            })
            .find(|lanes| !lanes.is_empty())
            .unwrap_or_default();
        if approach.is_empty() {
            return Ok(None);
        }
        let n = self.phases.len();
        Ok((0..n)
            .map(|k| (self.phase + k) % n)
            .find(|&p| approach.iter().any(|&i| self.phases[p].is_green_for(i))))
    }

    fn report(&mut self, now: f64) {
        let due = self
            .last_report
            .map_or(true, |last| now - last >= self.timing.report_period);
        if !due {
            return;
        }
        self.last_report = Some(now);
        let body = format!(
            "Phase: {}, Time on phase: {:.1}s",
            self.phase,
            now - self.phase_start
        );
        if let Err(e) = self
            .outbox
            .send(Message::inform(self.address.clone(), MONITOR_ADDRESS, body))
        {
            log::warn!("[SignalController {}] status report not sent: {}", self.id, e);
        }
    }
}

impl Controller for SignalController {
    fn name(&self) -> String {
        format!("SignalController {}", self.id)
    }

    async fn tick(&mut self) -> ControlResult<()> {
        self.step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::MessageBus;
    use crate::network::demo_grid;
    use crate::shared_data::{EdgeId, VehicleClass};
    use crate::simulation_engine::GridSimulation;

    fn two_phase() -> Vec<Phase> {
        vec![Phase::new(0, "Gr"), Phase::new(1, "rG")]
    }

    #[test]
    fn dominant_current_phase_keeps_green() {
        let timing = SignalTiming::default();
        let demands = [10.0, 1.0];
        assert!(!green_should_end(timing.min_green, 0, &demands, 10.0, &timing));
    }

    #[test]
    fn clearly_busier_phase_takes_over_after_min_green() {
        let timing = SignalTiming::default();
        let demands = [1.0, 10.0];
        assert!(green_should_end(timing.min_green, 0, &demands, 10.0, &timing));
        // Not before min_green.
        assert!(!green_should_end(timing.min_green - 0.1, 0, &demands, 10.0, &timing));
        // 1.2 does not exceed 1.0 x 1.25.
        assert!(!green_should_end(6.0, 0, &[1.0, 1.2], 10.0, &timing));
        // Target reached ends the green regardless of demand.
        assert!(green_should_end(10.0, 0, &[10.0, 0.0], 10.0, &timing));
    }

    #[test]
    fn demand_is_monotonic_in_vehicles_and_waiting() {
        for vehicles in 0..20u32 {
            for wait in [0.0, 0.5, 3.0, 40.0] {
                let base = demand_score(vehicles, wait, 0.2);
                assert!(demand_score(vehicles + 1, wait, 0.2) >= base);
                assert!(demand_score(vehicles, wait + 1.0, 0.2) >= base);
            }
        }
    }

    #[test]
    fn demands_sum_lanes_green_in_each_phase() {
        let demands = phase_demands(&two_phase(), &[3, 1], &[10.0, 0.0], 0.2);
        assert_eq!(demands, vec![5.0, 1.0]);
        let phases = vec![Phase::new(0, "GGr"), Phase::new(1, "yyr"), Phase::new(2, "rrG")];
        let demands = phase_demands(&phases, &[1, 2, 4], &[0.0, 0.0, 5.0], 0.2);
        assert_eq!(demands, vec![3.0, 0.0, 5.0]);
    }

    #[test]
    fn target_green_stays_within_bounds() {
        let timing = SignalTiming::default();
        let mut target = timing.initial_green;
        for _ in 0..20 {
            target = adapt_target(target, 15, &timing);
        }
        assert_eq!(target, timing.max_green);
        for _ in 0..30 {
            target = adapt_target(target, 0, &timing);
        }
        assert_eq!(target, timing.min_green);
        assert_eq!(adapt_target(12.0, 5, &timing), 12.0);
    }

    struct Rig {
        sim: Arc<GridSimulation>,
        bus: Arc<MessageBus>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                sim: Arc::new(GridSimulation::from_topology(&demo_grid(3, 3), 1.0).unwrap()),
                bus: Arc::new(MessageBus::new()),
            }
        }

        fn controller(&self, id: &str) -> ControlResult<SignalController> {
            let mailbox = self.bus.register(signal_address(id));
            SignalController::new(
                id,
                self.sim.clone(),
                mailbox,
                self.bus.clone(),
                SignalTiming::default(),
            )
        }

        fn advance(&self, seconds: usize) {
            for _ in 0..seconds {
                self.sim.advance_step().unwrap();
            }
        }

        fn add(&self, id: &str, route: &[&str], class: VehicleClass) {
            let route: Vec<EdgeId> = route.iter().map(|e| e.to_string()).collect();
            self.sim.add_vehicle(id, &route, class).unwrap();
        }
    }

    #[test]
    fn unknown_intersection_is_a_configuration_error() {
        let rig = Rig::new();
        assert!(matches!(
            rig.controller("J99"),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn phase_durations_respect_timing() {
        let rig = Rig::new();
        let mut controller = rig.controller("J11").unwrap();
        let timing = SignalTiming::default();
        let tick = timing.tick_period_secs as usize;

        let mut current = rig.sim.phase("J11").unwrap();
        let mut since = rig.sim.current_time().unwrap();
        let mut seen = Vec::new();
        for _ in 0..100 {
            controller.step().unwrap();
            let phase = rig.sim.phase("J11").unwrap();
            let now = rig.sim.current_time().unwrap();
            if phase != current {
                seen.push((current, now - since));
                current = phase;
                since = now;
            }
            rig.advance(tick);
        }

        assert!(seen.len() > 6);
        let slack = timing.tick_period_secs;
        for (phase, duration) in seen {
            match phase % 3 {
                0 => assert!(
                    duration >= timing.min_green && duration <= timing.max_green + slack,
                    "green {} lasted {}",
                    phase,
                    duration
                ),
                1 => assert!((duration - timing.yellow_time).abs() <= slack),
                _ => assert!((duration - timing.red_time).abs() <= slack),
            }
        }
    }

    #[test]
    fn external_phase_change_restarts_the_timer() {
        let rig = Rig::new();
        let mut controller = rig.controller("J11").unwrap();
        rig.advance(3);
        rig.sim.set_phase("J11", 3).unwrap();
        controller.step().unwrap();
        assert_eq!(controller.phase(), 3);
        rig.advance(4);
        controller.step().unwrap();
        // Only 4 s into the adopted green: below min_green, no switch.
        assert_eq!(rig.sim.phase("J11").unwrap(), 3);
    }

    #[test]
    fn priority_request_wins_a_switch_it_would_lose() {
        let rig = Rig::new();
        let mut monitor = rig.bus.register(MONITOR_ADDRESS);
        let mut controller = rig.controller("J11").unwrap();
        rig.advance(6);
        // Horizontal approach (phase 0) is busier than the vertical one (phase 3).
        rig.add("car_a", &["h10", "h11"], VehicleClass::Passenger);
        rig.add("car_b", &["h10", "h11"], VehicleClass::Passenger);
        rig.add("ambulance_0", &["v01", "v11"], VehicleClass::Emergency);

        controller.step().unwrap();
        assert_eq!(rig.sim.phase("J11").unwrap(), 0);

        let request = PriorityRequest::new("ambulance_0", "J11", 6.0);
        rig.bus
            .send(Message::request("priority_relay", signal_address("J11"), request.encode()))
            .unwrap();
        controller.step().unwrap();
        assert_eq!(rig.sim.phase("J11").unwrap(), 1);
        // Held through yellow and all-red, cleared once phase 3 is green.
        rig.advance(4);
        controller.step().unwrap();
        assert_eq!(rig.sim.phase("J11").unwrap(), 2);
        assert_eq!(controller.pending_preemption().map(|p| p.phase), Some(3));
        rig.advance(4);
        controller.step().unwrap();
        assert_eq!(rig.sim.phase("J11").unwrap(), 3);
        assert!(controller.pending_preemption().is_none());

        let report = monitor.try_receive().unwrap();
        assert_eq!(report.sender, "signal_J11");
        assert!(report.body.starts_with("Phase: 0, Time on phase: 6.0s"));
    }

    #[test]
    fn early_request_still_wins_once_min_green_has_passed() {
        let rig = Rig::new();
        let mut controller = rig.controller("J11").unwrap();
        rig.add("car_a", &["h10", "h11"], VehicleClass::Passenger);
        rig.add("car_b", &["h10", "h11"], VehicleClass::Passenger);
        rig.add("ambulance_0", &["v01", "v11"], VehicleClass::Emergency);
        rig.advance(2);

        let request = PriorityRequest::new("ambulance_0", "J11", 2.0);
        rig.bus
            .send(Message::request("priority_relay", signal_address("J11"), request.encode()))
            .unwrap();
        controller.step().unwrap();
        // Below min_green: no switch, the request stays pending.
        assert_eq!(rig.sim.phase("J11").unwrap(), 0);
        assert_eq!(controller.pending_preemption().map(|p| p.phase), Some(3));

        rig.advance(4);
        controller.step().unwrap();
        assert_eq!(rig.sim.phase("J11").unwrap(), 1);
    }

    #[test]
    fn expired_preemption_is_dropped() {
        let rig = Rig::new();
        let mut controller = rig.controller("J11").unwrap();
        rig.add("ambulance_0", &["v01", "v11"], VehicleClass::Emergency);
        rig.bus
            .send(Message::request(
                "priority_relay",
                signal_address("J11"),
                "priority_request:ambulance_0:J11",
            ))
            .unwrap();
        rig.sim.set_phase("J11", 1).unwrap();
        controller.step().unwrap();
        assert_eq!(controller.pending_preemption().map(|p| p.phase), Some(3));

        // The window closes before phase 3 comes round.
        rig.advance(11);
        controller.step().unwrap();
        assert_eq!(rig.sim.phase("J11").unwrap(), 2);
        assert!(controller.pending_preemption().is_none());
    }

    #[test]
    fn requests_for_other_intersections_are_ignored() {
        let rig = Rig::new();
        let mut controller = rig.controller("J11").unwrap();
        rig.add("ambulance_0", &["v01", "v11"], VehicleClass::Emergency);
        rig.bus
            .send(Message::request(
                "priority_relay",
                signal_address("J11"),
                "priority_request:ambulance_0:J01",
            ))
            .unwrap();
        rig.bus
            .send(Message::request(
                "priority_relay",
                signal_address("J11"),
                "priority_request:ghost:J11",
            ))
            .unwrap();
        controller.step().unwrap();
        assert!(controller.pending_preemption().is_none());
    }
}
