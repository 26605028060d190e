// control_system/mod.rs
pub mod claim_registry;
pub mod disruption;
pub mod emergency_controller;
pub mod priority_relay;
pub mod traffic_light_controller;
pub mod vehicle_controller;

pub use claim_registry::ClaimRegistry;
pub use disruption::{set_lane_pair, DisruptionController, DisruptionState, LaneClosure};
pub use emergency_controller::EmergencyController;
pub use priority_relay::{PriorityRelay, RelayOutcome};
pub use traffic_light_controller::SignalController;
pub use vehicle_controller::{RerouteLog, VehicleController, VehicleState};
