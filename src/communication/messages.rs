use crate::shared_data::{IntersectionId, VehicleId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Performative {
    Inform,
    Request,
}

/// Envelope exchanged between controllers. Over AMQP it travels as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub to: String,
    pub performative: Performative,
    pub body: String,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        to: impl Into<String>,
        performative: Performative,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            to: to.into(),
            performative,
            body: body.into(),
        }
    }

    pub fn inform(sender: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(sender, to, Performative::Inform, body)
    }

    pub fn request(sender: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(sender, to, Performative::Request, body)
    }
}

const PRIORITY_PREFIX: &str = "priority_request";

/// Urgent request to favour the vehicle's approach at the intersection.
///
/// Body format: `priority_request:<vehicle>:<intersection>[:<timestamp>]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityRequest {
    pub vehicle: VehicleId,
    pub intersection: IntersectionId,
    /// Simulation time at which the request was raised.
    pub timestamp: Option<f64>,
}

impl PriorityRequest {
    pub fn new(vehicle: impl Into<String>, intersection: impl Into<String>, timestamp: f64) -> Self {
        Self {
            vehicle: vehicle.into(),
            intersection: intersection.into(),
            timestamp: Some(timestamp),
        }
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// `None` for anything that is not a well-formed priority request.
    pub fn parse(body: &str) -> Option<Self> {
        let mut parts = body.trim().split(':');
        if parts.next()? != PRIORITY_PREFIX {
            return None;
        }
        let vehicle = parts.next().filter(|v| !v.is_empty())?;
        let intersection = parts.next().filter(|i| !i.is_empty())?;
        let timestamp = match parts.next() {
            Some(ts) => Some(ts.parse::<f64>().ok()?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            vehicle: vehicle.to_string(),
            intersection: intersection.to_string(),
            timestamp,
        })
    }
}

impl fmt::Display for PriorityRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", PRIORITY_PREFIX, self.vehicle, self.intersection)?;
        if let Some(ts) = self.timestamp {
            write!(f, ":{}", ts)?;
        }
        Ok(())
    }
}
