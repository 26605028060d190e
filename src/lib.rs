pub mod communication;
pub mod config;
pub mod control_system;
pub mod coordinator;
pub mod error;
pub mod monitoring;
pub mod network;
pub mod scheduler;
pub mod shared_data;
pub mod simulation_engine;

pub use error::{ControlError, ControlResult};
