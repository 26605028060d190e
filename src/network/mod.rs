// network/mod.rs
pub mod graph;
pub mod route_database;
pub mod router;
pub mod topology;

pub use graph::{Edge, EdgeWeight, NetworkConditions, NetworkGraph, StaticConditions};
pub use route_database::RouteDatabase;
pub use router::Router;
pub use topology::{demo_grid, RoutesDocument, TopologyDocument};
