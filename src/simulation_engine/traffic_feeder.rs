use crate::error::ControlResult;
use crate::network::RouteDatabase;
use crate::scheduler::Controller;
use crate::shared_data::VehicleClass;
use crate::simulation_engine::surface::SimulationSurface;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Steps the simulation clock and injects background passenger traffic.
pub struct TrafficFeeder {
    surface: Arc<dyn SimulationSurface>,
    routes: Arc<RouteDatabase>,
    spawn_probability: f64,
    rng: StdRng,
    spawned: u64,
}

impl TrafficFeeder {
    pub fn new(
        surface: Arc<dyn SimulationSurface>,
        routes: Arc<RouteDatabase>,
        spawn_probability: f64,
        seed: u64,
    ) -> Self {
        Self {
            surface,
            routes,
            spawn_probability: spawn_probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
            spawned: 0,
        }
    }

    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    /// One simulation step plus, maybe, one new vehicle.
    pub fn step(&mut self) -> ControlResult<()> {
        self.surface.advance_step()?;
        if !self.rng.random_bool(self.spawn_probability) {
            return Ok(());
        }
        let Some(route) = self.routes.routes().choose(&mut self.rng) else {
            return Ok(());
        };
        let id = format!("veh_{}", self.spawned);
        self.surface.add_vehicle(&id, route, VehicleClass::Passenger)?;
        self.spawned += 1;
        log::debug!("[TrafficFeeder] spawned {} on {:?}", id, route);
        Ok(())
    }
}

impl Controller for TrafficFeeder {
    fn name(&self) -> String {
        "TrafficFeeder".to_string()
    }

    async fn tick(&mut self) -> ControlResult<()> {
        self.step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::graph::StaticConditions;
    use crate::network::{demo_grid, NetworkGraph};
    use crate::simulation_engine::grid::GridSimulation;

    #[test]
    fn steps_clock_and_spawns_on_known_routes() {
        let doc = demo_grid(3, 3);
        let graph = NetworkGraph::from_topology(&doc).unwrap();
        let routes = RouteDatabase::precompute(
            &graph,
            &StaticConditions,
            vec![("h00".to_string(), "h11".to_string())],
        );
        let sim = Arc::new(GridSimulation::from_topology(&doc, 1.0).unwrap());
        let mut feeder = TrafficFeeder::new(sim.clone(), Arc::new(routes), 1.0, 7);

        feeder.step().unwrap();
        feeder.step().unwrap();
        assert_eq!(sim.current_time().unwrap(), 2.0);
        assert_eq!(feeder.spawned(), 2);
        assert_eq!(sim.vehicle_ids().unwrap(), vec!["veh_0", "veh_1"]);
        assert_eq!(sim.vehicle_route("veh_0").unwrap().first().map(String::as_str), Some("h00"));
    }

    #[test]
    fn zero_probability_only_steps() {
        let doc = demo_grid(2, 3);
        let sim = Arc::new(GridSimulation::from_topology(&doc, 0.5).unwrap());
        let mut feeder = TrafficFeeder::new(sim.clone(), Arc::new(RouteDatabase::default()), 0.0, 1);
        for _ in 0..4 {
            feeder.step().unwrap();
        }
        assert_eq!(sim.current_time().unwrap(), 2.0);
        assert!(sim.vehicle_ids().unwrap().is_empty());
    }
}
