use crate::communication::messages::Message;
use crate::error::{ControlError, ControlResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Sending half of the transport. Delivery is at-least-once and unordered
/// across senders; `send` never waits for the recipient.
pub trait Outbox: Send + Sync {
    fn send(&self, message: Message) -> ControlResult<()>;
}

/// Receiving half: one per controller address.
#[derive(Debug)]
pub struct Mailbox {
    address: String,
    receiver: UnboundedReceiver<Message>,
}

impl Mailbox {
    pub fn new(address: impl Into<String>, receiver: UnboundedReceiver<Message>) -> Self {
        Self {
            address: address.into(),
            receiver,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Waits up to `timeout` for the next message.
    pub async fn receive(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_receive(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_receive()).collect()
    }
}

/// In-process transport: one unbounded channel per registered address.
#[derive(Debug, Default)]
pub struct MessageBus {
    routes: Mutex<HashMap<String, UnboundedSender<Message>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the mailbox for `address`, replacing any earlier registration.
    pub fn register(&self, address: impl Into<String>) -> Mailbox {
        let address = address.into();
        let (tx, rx) = unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), tx);
        Mailbox::new(address, rx)
    }
}

impl Outbox for MessageBus {
    fn send(&self, message: Message) -> ControlResult<()> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let tx = routes
            .get(&message.to)
            .ok_or_else(|| ControlError::Transport(format!("no mailbox for '{}'", message.to)))?;
        let to = message.to.clone();
        tx.send(message)
            .map_err(|_| ControlError::Transport(format!("mailbox '{}' is closed", to)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_registered_address() {
        let bus = MessageBus::new();
        let mut inbox = bus.register("monitor");
        bus.send(Message::inform("signal_J11", "monitor", "Phase: 0, Time on phase: 4.0s"))
            .unwrap();
        let message = inbox.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(message.sender, "signal_J11");
        assert_eq!(inbox.address(), "monitor");
    }

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let bus = MessageBus::new();
        let mut inbox = bus.register("monitor");
        assert!(inbox.receive(Duration::from_millis(10)).await.is_none());
        assert!(inbox.try_receive().is_none());
    }

    #[test]
    fn unknown_or_closed_address_is_a_transport_error() {
        let bus = MessageBus::new();
        let err = bus.send(Message::inform("a", "nobody", "x")).unwrap_err();
        assert!(matches!(err, ControlError::Transport(_)));

        drop(bus.register("gone"));
        assert!(bus.send(Message::inform("a", "gone", "x")).is_err());
    }

    #[test]
    fn drain_returns_queued_messages_in_order() {
        let bus = MessageBus::new();
        let mut inbox = bus.register("signal_J01");
        for i in 0..3 {
            bus.send(Message::request("relay", "signal_J01", format!("m{}", i)))
                .unwrap();
        }
        let bodies: Vec<String> = inbox.drain().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2"]);
    }
}
