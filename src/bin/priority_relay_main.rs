// priority_relay_main.rs
//
// Runs the priority relay on its own against a RabbitMQ broker. The intersections
// it routes to come from the topology given as first argument, or the demo grid.
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use traffic_coordinator::communication::amqp::{amqp_mailbox, AmqpOutbox};
use traffic_coordinator::config::{AMQP_URL, RELAY_ADDRESS};
use traffic_coordinator::control_system::PriorityRelay;
use traffic_coordinator::network::{demo_grid, TopologyDocument};
use traffic_coordinator::scheduler::{self, Behaviour};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    println!("Starting priority relay...");

    let topology = match std::env::args().nth(1) {
        Some(path) => TopologyDocument::load(&path)?,
        None => demo_grid(3, 3),
    };
    let url = std::env::var("AMQP_URL").unwrap_or_else(|_| AMQP_URL.to_string());

    let outbox = Arc::new(AmqpOutbox::connect(&url)?);
    let mailbox = amqp_mailbox(&url, RELAY_ADDRESS).await?;
    let relay = PriorityRelay::new(
        mailbox,
        outbox,
        PriorityRelay::routing_table(topology.intersections.iter().map(|i| i.id.as_str())),
        Duration::from_secs(1),
    );
    let handle = scheduler::spawn(relay, Behaviour::Cyclic);

    tokio::signal::ctrl_c().await?;
    handle.abort();
    println!("Priority relay stopped.");
    Ok(())
}
