use crate::shared_data::{ControllerId, VehicleId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Claims {
    by_vehicle: HashMap<VehicleId, ControllerId>,
    by_controller: HashMap<ControllerId, VehicleId>,
}

/// Exclusive vehicle ownership. A vehicle is claimed by at most one controller
/// and a controller holds at most one vehicle.
///
/// Both directions sit behind one lock so claim and release are atomic with
/// respect to each other.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    claims: Mutex<Claims>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every operation leaves both maps consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims `vehicle` for `controller`. Losing the race is not an error.
    pub fn try_claim(&self, vehicle: &str, controller: &str) -> bool {
        let mut claims = self.lock();
        if claims.by_vehicle.contains_key(vehicle) || claims.by_controller.contains_key(controller) {
            return false;
        }
        claims
            .by_vehicle
            .insert(vehicle.to_string(), controller.to_string());
        claims
            .by_controller
            .insert(controller.to_string(), vehicle.to_string());
        true
    }

    /// Idempotent.
    pub fn release(&self, vehicle: &str) {
        let mut claims = self.lock();
        if let Some(controller) = claims.by_vehicle.remove(vehicle) {
            claims.by_controller.remove(&controller);
        }
    }

    pub fn is_claimed(&self, vehicle: &str) -> bool {
        self.lock().by_vehicle.contains_key(vehicle)
    }

    pub fn owner(&self, vehicle: &str) -> Option<ControllerId> {
        self.lock().by_vehicle.get(vehicle).cloned()
    }

    pub fn claimed_count(&self) -> usize {
        self.lock().by_vehicle.len()
    }
}
