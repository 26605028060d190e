// simulation_engine/mod.rs
pub mod grid;
pub mod surface;
pub mod traffic_feeder;

pub use grid::GridSimulation;
pub use surface::{Phase, PhaseKind, SimulationSurface};
pub use traffic_feeder::TrafficFeeder;
