// communication/mod.rs
pub mod amqp;
pub mod bus;
pub mod messages;

pub use bus::{Mailbox, MessageBus, Outbox};
pub use messages::{Message, Performative, PriorityRequest};
