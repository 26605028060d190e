// traffic_coordinator_main.rs
use std::error::Error;
use std::time::Duration;
use traffic_coordinator::config::Settings;
use traffic_coordinator::coordinator::Coordinator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(&path)?,
        None => Settings::default(),
    };
    let coordinator = Coordinator::launch(&settings).await?;

    match settings.run_for_secs {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(limit)) => {
                    log::info!("[Coordinator] run time of {}s reached", limit);
                }
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    coordinator.shutdown();
    Ok(())
}
