// coordinator.rs
//
// Builds the shared state from `Settings` and spawns every controller on the
// current tokio runtime.

use crate::communication::amqp::{amqp_mailbox, AmqpOutbox};
use crate::communication::{Mailbox, MessageBus, Outbox};
use crate::config::{
    signal_address, vehicle_controller_id, Settings, TransportSettings, MONITOR_ADDRESS,
    RELAY_ADDRESS,
};
use crate::control_system::{
    ClaimRegistry, DisruptionController, EmergencyController, LaneClosure, PriorityRelay,
    RerouteLog, SignalController, VehicleController,
};
use crate::error::{ControlError, ControlResult};
use crate::monitoring::MonitoringSystem;
use crate::network::{
    demo_grid, NetworkGraph, RouteDatabase, Router, RoutesDocument, StaticConditions,
    TopologyDocument,
};
use crate::scheduler::{self, secs, Behaviour};
use crate::simulation_engine::{GridSimulation, SimulationSurface, TrafficFeeder};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where mailboxes come from and where messages go.
enum Transport {
    InMemory(Arc<MessageBus>),
    Amqp { url: String, outbox: Arc<AmqpOutbox> },
}

impl Transport {
    fn connect(settings: &TransportSettings) -> ControlResult<Self> {
        match settings {
            TransportSettings::InMemory => Ok(Transport::InMemory(Arc::new(MessageBus::new()))),
            TransportSettings::Amqp { url } => Ok(Transport::Amqp {
                url: url.clone(),
                outbox: Arc::new(AmqpOutbox::connect(url)?),
            }),
        }
    }

    fn outbox(&self) -> Arc<dyn Outbox> {
        match self {
            Transport::InMemory(bus) => bus.clone(),
            Transport::Amqp { outbox, .. } => outbox.clone(),
        }
    }

    async fn mailbox(&self, address: &str) -> ControlResult<Mailbox> {
        match self {
            Transport::InMemory(bus) => Ok(bus.register(address)),
            Transport::Amqp { url, .. } => amqp_mailbox(url, address).await,
        }
    }
}

/// The running controller set.
pub struct Coordinator {
    handles: Vec<JoinHandle<()>>,
    surface: Arc<dyn SimulationSurface>,
    registry: Arc<ClaimRegistry>,
    reroutes: Arc<RerouteLog>,
}

impl Coordinator {
    pub async fn launch(settings: &Settings) -> ControlResult<Self> {
        let topology = match &settings.topology_path {
            Some(path) => TopologyDocument::load(path)?,
            None => demo_grid(3, 3),
        };
        let graph = Arc::new(
            NetworkGraph::from_topology(&topology)?.with_weight(settings.vehicle.route_weight),
        );
        let routes = match &settings.routes_path {
            Some(path) => RouteDatabase::from_document(&RoutesDocument::load(path)?, &graph)?,
            None => {
                let edges: Vec<String> = graph.edges().map(|e| e.id.clone()).collect();
                let pairs = edges.iter().flat_map(|from| {
                    edges
                        .iter()
                        .filter(move |to| *to != from)
                        .map(move |to| (from.clone(), to.clone()))
                });
                RouteDatabase::precompute(&graph, &StaticConditions, pairs)
            }
        };
        if routes.is_empty() {
            return Err(ControlError::Configuration(
                "the network has no routes to drive".to_string(),
            ));
        }
        let routes = Arc::new(routes);
        let router = Arc::new(Router::new(
            graph.clone(),
            Some(routes.clone()),
            settings.route_strategy(),
        )?);
        log::info!(
            "[Coordinator] {} edges, {} routes, {:?} routing",
            graph.edge_count(),
            routes.len(),
            router.strategy()
        );

        let surface: Arc<dyn SimulationSurface> = Arc::new(GridSimulation::from_topology(
            &topology,
            settings.simulation.step_length,
        )?);
        let transport = Transport::connect(&settings.transport)?;
        let outbox = transport.outbox();
        let registry = Arc::new(ClaimRegistry::new());
        let reroutes = Arc::new(RerouteLog::new());
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Registered first so the controllers' first reports have somewhere to go.
        let monitor = MonitoringSystem::new(
            transport.mailbox(MONITOR_ADDRESS).await?,
            surface.clone(),
            registry.clone(),
            reroutes.clone(),
            settings.monitoring.clone(),
        )?;
        handles.push(scheduler::spawn(monitor, Behaviour::Cyclic));

        handles.push(scheduler::spawn(
            TrafficFeeder::new(
                surface.clone(),
                routes.clone(),
                settings.simulation.spawn_probability,
                settings.simulation.seed,
            ),
            Behaviour::Periodic(secs(settings.simulation.step_period_secs)),
        ));

        for intersection in &topology.intersections {
            let mailbox = transport.mailbox(&signal_address(&intersection.id)).await?;
            let controller = SignalController::new(
                intersection.id.as_str(),
                surface.clone(),
                mailbox,
                outbox.clone(),
                settings.signal.clone(),
            )?;
            handles.push(scheduler::spawn(
                controller,
                Behaviour::Periodic(secs(settings.signal.tick_period_secs)),
            ));
        }

        for slot in 0..settings.vehicle.slots {
            handles.push(scheduler::spawn(
                VehicleController::new(
                    vehicle_controller_id(slot),
                    surface.clone(),
                    registry.clone(),
                    router.clone(),
                    reroutes.clone(),
                    settings.vehicle.clone(),
                ),
                Behaviour::Periodic(secs(settings.vehicle.tick_period_secs)),
            ));
        }

        let relay = PriorityRelay::new(
            transport.mailbox(RELAY_ADDRESS).await?,
            outbox.clone(),
            PriorityRelay::routing_table(topology.intersections.iter().map(|i| i.id.as_str())),
            Duration::from_secs(1),
        );
        handles.push(scheduler::spawn(relay, Behaviour::Cyclic));

        handles.push(scheduler::spawn(
            EmergencyController::new(
                surface.clone(),
                outbox.clone(),
                routes.clone(),
                settings.emergency.clone(),
                settings.simulation.seed.wrapping_add(1),
            ),
            Behaviour::Periodic(secs(settings.emergency.tick_period_secs)),
        ));

        if let Some(tuning) = &settings.disruption {
            let candidates = if tuning.lanes.is_empty() {
                topology.all_lanes()
            } else {
                tuning.lanes.clone()
            };
            handles.push(scheduler::spawn(
                DisruptionController::new(
                    surface.clone(),
                    candidates,
                    tuning.clone(),
                    settings.simulation.seed.wrapping_add(2),
                ),
                Behaviour::Periodic(secs(tuning.tick_period_secs)),
            ));
        }

        for closure in &settings.closures {
            handles.push(scheduler::spawn(
                LaneClosure::new(
                    surface.clone(),
                    closure.lane.as_str(),
                    secs(closure.duration_secs),
                ),
                Behaviour::OneShot(secs(closure.after_secs)),
            ));
        }

        log::info!("[Coordinator] {} controllers running", handles.len());
        Ok(Self {
            handles,
            surface,
            registry,
            reroutes,
        })
    }

    pub fn surface(&self) -> &Arc<dyn SimulationSurface> {
        &self.surface
    }

    pub fn registry(&self) -> &ClaimRegistry {
        &self.registry
    }

    pub fn reroutes(&self) -> &RerouteLog {
        &self.reroutes
    }

    pub fn controller_count(&self) -> usize {
        self.handles.len()
    }

    /// Aborts every controller task.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        log::info!(
            "[Coordinator] stopped: {} vehicles claimed, {} rerouted",
            self.registry.claimed_count(),
            self.reroutes.count()
        );
    }
}
