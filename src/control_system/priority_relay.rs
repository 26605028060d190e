use crate::communication::{Mailbox, Message, Outbox, PriorityRequest};
use crate::config::{signal_address, RELAY_ADDRESS};
use crate::error::ControlResult;
use crate::scheduler::Controller;
use crate::shared_data::IntersectionId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded { to: String },
    Unmapped,
    Malformed,
    SendFailed,
}

/// Forwards priority requests to the signal controller of the named intersection.
/// Requests are advisory: anything that cannot be delivered is logged and dropped.
pub struct PriorityRelay {
    mailbox: Mailbox,
    outbox: Arc<dyn Outbox>,
    routes: HashMap<IntersectionId, String>,
    receive_timeout: Duration,
    forwarded: u64,
    dropped: u64,
}

impl PriorityRelay {
    pub fn new(
        mailbox: Mailbox,
        outbox: Arc<dyn Outbox>,
        routes: HashMap<IntersectionId, String>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            mailbox,
            outbox,
            routes,
            receive_timeout,
            forwarded: 0,
            dropped: 0,
        }
    }

    /// Intersection to controller address map for the given intersections.
    pub fn routing_table<'a, I>(intersections: I) -> HashMap<IntersectionId, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        intersections
            .into_iter()
            .map(|id| (id.to_string(), signal_address(id)))
            .collect()
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn handle(&mut self, message: &Message) -> RelayOutcome {
        let outcome = self.route(message);
        match &outcome {
            RelayOutcome::Forwarded { .. } => self.forwarded += 1,
            _ => self.dropped += 1,
        }
        outcome
    }

    fn route(&self, message: &Message) -> RelayOutcome {
        let Some(request) = PriorityRequest::parse(&message.body) else {
            log::warn!(
                "[PriorityRelay] dropping malformed request '{}' from {}",
                message.body,
                message.sender
            );
            return RelayOutcome::Malformed;
        };
        let Some(to) = self.routes.get(&request.intersection) else {
            log::warn!(
                "[PriorityRelay] no controller for intersection {}, dropping request from {}",
                request.intersection,
                request.vehicle
            );
            return RelayOutcome::Unmapped;
        };
        match self
            .outbox
            .send(Message::request(RELAY_ADDRESS, to.clone(), request.encode()))
        {
            Ok(()) => {
                log::info!(
                    "[PriorityRelay] {} -> {} ({})",
                    request.vehicle,
                    to,
                    request.intersection
                );
                RelayOutcome::Forwarded { to: to.clone() }
            }
            Err(e) => {
                log::warn!("[PriorityRelay] forwarding to {} failed: {}", to, e);
                RelayOutcome::SendFailed
            }
        }
    }
}

impl Controller for PriorityRelay {
    fn name(&self) -> String {
        "PriorityRelay".to_string()
    }

    async fn tick(&mut self) -> ControlResult<()> {
        if let Some(message) = self.mailbox.receive(self.receive_timeout).await {
            self.handle(&message);
        }
        Ok(())
    }
}
