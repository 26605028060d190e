// scheduler.rs
//
// Runs every controller as its own tokio task. A controller only implements one
// `tick`; how often it runs is decided by its `Behaviour`.

use crate::error::ControlResult;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Tick at a fixed period. A slow tick delays the next one instead of bursting.
    Periodic(Duration),
    /// Tick back to back. The tick is expected to wait on something itself,
    /// usually `Mailbox::receive` with a timeout.
    Cyclic,
    /// Tick once after the delay, then finish.
    OneShot(Duration),
}

pub trait Controller: Send + 'static {
    fn name(&self) -> String;
    fn tick(&mut self) -> impl Future<Output = ControlResult<()>> + Send;
}

/// Spawns the controller loop. Abort the handle to stop it.
pub fn spawn<C: Controller>(controller: C, behaviour: Behaviour) -> JoinHandle<()> {
    tokio::spawn(run(controller, behaviour))
}

/// Drives the controller on the current task.
pub async fn run<C: Controller>(mut controller: C, behaviour: Behaviour) {
    let name = controller.name();
    log::info!("[{}] starting ({:?})", name, behaviour);
    match behaviour {
        Behaviour::Periodic(period) => {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_tick(&name, &mut controller).await;
            }
        }
        Behaviour::Cyclic => loop {
            run_tick(&name, &mut controller).await;
            tokio::task::yield_now().await;
        },
        Behaviour::OneShot(delay) => {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            run_tick(&name, &mut controller).await;
            log::info!("[{}] finished", name);
        }
    }
}

/// One tick; errors never leave the controller.
async fn run_tick<C: Controller>(name: &str, controller: &mut C) {
    if let Err(e) = controller.tick().await {
        if e.is_transient() {
            log::warn!("[{}] tick abandoned: {}", name, e);
        } else {
            log::error!("[{}] tick failed: {}", name, e);
        }
    }
}

/// Seconds from settings to a `Duration`, clamping negatives and NaN to zero.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}
