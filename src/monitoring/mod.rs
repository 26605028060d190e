// monitoring/mod.rs
pub mod traffic_monitoring_system;

pub use traffic_monitoring_system::{log_to_csv, MonitoringSystem};
