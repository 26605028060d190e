// disruption.rs
//
// Lane closures. Closing a lane adds `Passenger` to its disallowed classes and
// does the same for the opposite-direction lane when there is one.

use crate::config::DisruptionTuning;
use crate::error::{ControlError, ControlResult};
use crate::scheduler::Controller;
use crate::shared_data::{opposite_lane, LaneId, VehicleClass};
use crate::simulation_engine::SimulationSurface;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;

fn set_passenger_access(surface: &dyn SimulationSurface, lane: &str, open: bool) -> ControlResult<()> {
    let mut disallowed = surface.lane_disallowed(lane)?;
    let changed = if open {
        disallowed.remove(&VehicleClass::Passenger)
    } else {
        disallowed.insert(VehicleClass::Passenger)
    };
    if changed {
        surface.set_lane_disallowed(lane, &disallowed)?;
    }
    Ok(())
}

/// Closes or reopens `lane` and its opposite, pushing each lane onto `touched`
/// as soon as its write lands. A failure on the opposite lane leaves the first
/// one recorded.
pub fn set_lane_pair(
    surface: &dyn SimulationSurface,
    lane: &str,
    open: bool,
    touched: &mut Vec<LaneId>,
) -> ControlResult<()> {
    set_passenger_access(surface, lane, open)?;
    touched.push(lane.to_string());
    let opposite = opposite_lane(lane);
    match set_passenger_access(surface, &opposite, open) {
        Ok(()) => touched.push(opposite),
        // One-way street.
        Err(ControlError::UnknownObject { .. }) => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisruptionState {
    Open { until: Option<f64> },
    Closed { lanes: Vec<LaneId>, until: f64 },
}

/// Alternates between an open period and the closure of one random lane pair.
pub struct DisruptionController {
    surface: Arc<dyn SimulationSurface>,
    candidates: Vec<LaneId>,
    tuning: DisruptionTuning,
    rng: StdRng,
    state: DisruptionState,
}

impl DisruptionController {
    pub fn new(
        surface: Arc<dyn SimulationSurface>,
        candidates: Vec<LaneId>,
        tuning: DisruptionTuning,
        seed: u64,
    ) -> Self {
        Self {
            surface,
            candidates,
            tuning,
            rng: StdRng::seed_from_u64(seed),
            state: DisruptionState::Open { until: None },
        }
    }

    pub fn state(&self) -> &DisruptionState {
        &self.state
    }

    pub fn step(&mut self) -> ControlResult<()> {
        if !self.surface.is_available() {
            return Err(ControlError::SimulationUnavailable);
        }
        let now = self.surface.current_time()?;
        match &self.state {
            DisruptionState::Open { until: None } => {
                self.state = DisruptionState::Open {
                    until: Some(now + self.tuning.open_duration),
                };
            }
            DisruptionState::Open { until: Some(until) } if now >= *until => {
                let Some(lane) = self.candidates.choose(&mut self.rng).cloned() else {
                    return Ok(());
                };
                let mut lanes = Vec::new();
                let closed = set_lane_pair(&*self.surface, &lane, false, &mut lanes);
                if !lanes.is_empty() {
                    log::info!(
                        "[DisruptionController] closing {:?} for {}s",
                        lanes,
                        self.tuning.closure_duration
                    );
                    self.state = DisruptionState::Closed {
                        lanes,
                        until: now + self.tuning.closure_duration,
                    };
                }
                closed?;
            }
            DisruptionState::Closed { lanes, until } if now >= *until => {
                for lane in lanes {
                    set_passenger_access(&*self.surface, lane, true)?;
                }
                log::info!(
                    "[DisruptionController] reopening {:?} for {}s",
                    lanes,
                    self.tuning.open_duration
                );
                self.state = DisruptionState::Open {
                    until: Some(now + self.tuning.open_duration),
                };
            }
            _ => {}
        }
        Ok(())
    }
}

impl Controller for DisruptionController {
    fn name(&self) -> String {
        "DisruptionController".to_string()
    }

    async fn tick(&mut self) -> ControlResult<()> {
        self.step()
    }
}

/// Manual closure: closes the lane pair immediately and reopens it after `duration`.
pub struct LaneClosure {
    surface: Arc<dyn SimulationSurface>,
    lane: LaneId,
    duration: Duration,
}

impl LaneClosure {
    pub fn new(surface: Arc<dyn SimulationSurface>, lane: impl Into<LaneId>, duration: Duration) -> Self {
        Self {
            surface,
            lane: lane.into(),
            duration,
        }
    }
}

impl Controller for LaneClosure {
    fn name(&self) -> String {
        format!("LaneClosure {}", self.lane)
    }

    async fn tick(&mut self) -> ControlResult<()> {
        if !self.surface.is_available() {
            return Err(ControlError::SimulationUnavailable);
        }
        let mut lanes = Vec::new();
        let closed = set_lane_pair(&*self.surface, &self.lane, false, &mut lanes);
        if lanes.is_empty() {
            return closed;
        }
        match &closed {
            Ok(()) => log::info!("[LaneClosure] closed {:?} for {:?}", lanes, self.duration),
            Err(e) => log::warn!("[LaneClosure] only closed {:?}: {}", lanes, e),
        }
        tokio::time::sleep(self.duration).await;
        if !self.surface.is_available() {
            return Err(ControlError::SimulationUnavailable);
        }
        for lane in &lanes {
            set_passenger_access(&*self.surface, lane, true)?;
        }
        log::info!("[LaneClosure] reopened {:?}", lanes);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{demo_grid, NetworkConditions};
    use crate::scheduler::{self, Behaviour};
    use crate::simulation_engine::GridSimulation;

    fn grid() -> Arc<GridSimulation> {
        Arc::new(GridSimulation::from_topology(&demo_grid(2, 2), 1.0).unwrap())
    }

    fn closed(sim: &GridSimulation, lane: &str) -> bool {
        sim.lane_disallowed(lane)
            .unwrap()
            .contains(&VehicleClass::Passenger)
    }

    #[test]
    fn closes_and_reopens_on_schedule() {
        let sim = grid();
        let tuning = DisruptionTuning {
            closure_duration: 3.0,
            open_duration: 2.0,
            ..DisruptionTuning::default()
        };
        let mut controller = DisruptionController::new(sim.clone(), vec!["h00_0".to_string()], tuning, 9);

        // t = 0: the open period starts.
        controller.step().unwrap();
        assert!(!closed(&sim, "h00_0"));

        sim.advance_step().unwrap();
        sim.advance_step().unwrap();
        controller.step().unwrap();
        assert!(closed(&sim, "h00_0"));
        assert!(closed(&sim, "-h00_0"));
        assert_eq!(
            controller.state(),
            &DisruptionState::Closed {
                lanes: vec!["h00_0".to_string(), "-h00_0".to_string()],
                until: 5.0
            }
        );

        sim.advance_step().unwrap();
        controller.step().unwrap();
        assert!(closed(&sim, "h00_0"));

        sim.advance_step().unwrap();
        sim.advance_step().unwrap();
        controller.step().unwrap();
        assert!(!closed(&sim, "h00_0"));
        assert!(!closed(&sim, "-h00_0"));
        assert_eq!(controller.state(), &DisruptionState::Open { until: Some(7.0) });
    }

    #[test]
    fn other_disallowed_classes_survive_reopening() {
        let sim = grid();
        let trucks = [VehicleClass::Truck].into_iter().collect();
        sim.set_lane_disallowed("v00_0", &trucks).unwrap();
        set_lane_pair(&*sim, "v00_0", false, &mut Vec::new()).unwrap();
        assert_eq!(sim.lane_disallowed("v00_0").unwrap().len(), 2);
        set_lane_pair(&*sim, "v00_0", true, &mut Vec::new()).unwrap();
        assert_eq!(sim.lane_disallowed("v00_0").unwrap(), trucks);
    }

    #[test]
    fn missing_opposite_lane_is_skipped() {
        let sim = grid();
        let mut touched = Vec::new();
        set_lane_pair(&*sim, "h00_0", false, &mut touched).unwrap();
        assert_eq!(touched.len(), 2);
        let mut touched = Vec::new();
        assert!(set_lane_pair(&*sim, "nowhere_0", false, &mut touched).is_err());
        assert!(touched.is_empty());
    }

    #[test]
    fn failed_opposite_write_still_reopens_the_first_lane() {
        let sim = grid();
        let tuning = DisruptionTuning {
            closure_duration: 3.0,
            open_duration: 1.0,
            ..DisruptionTuning::default()
        };
        let mut controller = DisruptionController::new(sim.clone(), vec!["h00_0".to_string()], tuning, 9);
        controller.step().unwrap();
        sim.advance_step().unwrap();

        sim.inject_fault("set_lane_disallowed:-h00_0");
        assert!(controller.step().is_err());
        assert!(closed(&sim, "h00_0"));
        assert!(!closed(&sim, "-h00_0"));
        assert_eq!(
            controller.state(),
            &DisruptionState::Closed {
                lanes: vec!["h00_0".to_string()],
                until: 4.0
            }
        );

        sim.clear_faults();
        for _ in 0..3 {
            sim.advance_step().unwrap();
        }
        controller.step().unwrap();
        assert!(!closed(&sim, "h00_0"));
        assert_eq!(controller.state(), &DisruptionState::Open { until: Some(5.0) });
    }

    #[tokio::test]
    async fn manual_closure_reopens_a_half_closed_pair() {
        let sim = grid();
        sim.inject_fault("set_lane_disallowed:v00_0");
        let handle = scheduler::spawn(
            LaneClosure::new(sim.clone(), "-v00_0", Duration::from_millis(60)),
            Behaviour::OneShot(Duration::ZERO),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closed(&sim, "-v00_0"));
        assert!(!closed(&sim, "v00_0"));
        handle.await.unwrap();
        assert!(!closed(&sim, "-v00_0"));
    }

    #[tokio::test]
    async fn manual_closure_reopens_after_duration() {
        let sim = grid();
        let handle = scheduler::spawn(
            LaneClosure::new(sim.clone(), "-v00_0", Duration::from_millis(80)),
            Behaviour::OneShot(Duration::ZERO),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(closed(&sim, "-v00_0"));
        assert!(closed(&sim, "v00_0"));
        handle.await.unwrap();
        assert!(!closed(&sim, "-v00_0"));
        assert!(!closed(&sim, "v00_0"));
    }
}
