// amqp.rs
//
// RabbitMQ bridge. amiquip is blocking, so the connection for publishing lives on
// a dedicated thread fed by a channel, and each mailbox runs its consumer loop
// under `spawn_blocking`. Messages are JSON envelopes published on the default
// direct exchange with the recipient address as routing key and queue name.

use crate::communication::bus::{Mailbox, Outbox};
use crate::communication::messages::Message;
use crate::error::{ControlError, ControlResult};
use amiquip::{
    Connection, ConsumerMessage, ConsumerOptions, Exchange, Publish, QueueDeclareOptions,
    Result as AmiquipResult,
};
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc::unbounded_channel, oneshot};

/// Publisher backed by one AMQP connection.
pub struct AmqpOutbox {
    sender: Mutex<mpsc::Sender<Message>>,
}

impl AmqpOutbox {
    /// Opens the connection on a publisher thread. Fails if the broker is unreachable.
    pub fn connect(url: &str) -> ControlResult<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);
        let url = url.to_string();

        thread::Builder::new()
            .name("amqp-publisher".to_string())
            .spawn(move || {
                let mut connection = match Connection::insecure_open(&url) {
                    Ok(connection) => connection,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let result = publish_loop(&mut connection, rx, &ready_tx);
                if let Err(e) = result {
                    let _ = ready_tx.send(Err(e.to_string()));
                    log::error!("[AmqpOutbox] publisher stopped: {}", e);
                }
                if let Err(e) = connection.close() {
                    log::debug!("[AmqpOutbox] close failed: {}", e);
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("[AmqpOutbox] connected");
                Ok(Self {
                    sender: Mutex::new(tx),
                })
            }
            Ok(Err(e)) => Err(ControlError::Transport(e)),
            Err(_) => Err(ControlError::Transport(
                "publisher thread exited during startup".to_string(),
            )),
        }
    }
}

fn publish_loop(
    connection: &mut Connection,
    rx: mpsc::Receiver<Message>,
    ready_tx: &mpsc::SyncSender<Result<(), String>>,
) -> AmiquipResult<()> {
    let channel = connection.open_channel(None)?;
    let exchange = Exchange::direct(&channel);
    let _ = ready_tx.send(Ok(()));

    let mut declared: HashSet<String> = HashSet::new();
    for message in rx {
        if declared.insert(message.to.clone()) {
            channel.queue_declare(message.to.as_str(), QueueDeclareOptions::default())?;
        }
        let body = match serde_json::to_vec(&message) {
            Ok(body) => body,
            Err(e) => {
                log::warn!("[AmqpOutbox] dropping unserializable message: {}", e);
                continue;
            }
        };
        exchange.publish(Publish::new(&body, message.to.as_str()))?;
        log::debug!("[AmqpOutbox] {} -> {}: {}", message.sender, message.to, message.body);
    }
    Ok(())
}

impl Outbox for AmqpOutbox {
    fn send(&self, message: Message) -> ControlResult<()> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(message)
            .map_err(|_| ControlError::Transport("AMQP publisher is not running".to_string()))
    }
}

/// Mailbox fed by a consumer on the queue named `address`.
///
/// The consumer stops once the returned mailbox is dropped.
pub async fn amqp_mailbox(url: &str, address: &str) -> ControlResult<Mailbox> {
    let (tx, rx) = unbounded_channel::<Message>();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
    let url = url.to_string();
    let queue_name = address.to_string();

    tokio::task::spawn_blocking(move || {
        let mut ready = Some(ready_tx);
        let result = (|| -> AmiquipResult<()> {
            let mut connection = Connection::insecure_open(&url)?;
            let channel = connection.open_channel(None)?;
            let queue = channel.queue_declare(queue_name.as_str(), QueueDeclareOptions::default())?;
            let consumer = queue.consume(ConsumerOptions::default())?;
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }
            log::info!("[AmqpMailbox {}] listening", queue_name);

            while !tx.is_closed() {
                let delivery = match consumer.receiver().recv_timeout(Duration::from_secs(1)) {
                    Ok(ConsumerMessage::Delivery(delivery)) => delivery,
                    Ok(other) => {
                        log::warn!("[AmqpMailbox {}] consumer ended: {:?}", queue_name, other);
                        break;
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(_) => break,
                };
                match serde_json::from_slice::<Message>(&delivery.body) {
                    Ok(message) => {
                        let _ = tx.send(message);
                    }
                    Err(e) => {
                        log::warn!("[AmqpMailbox {}] dropping malformed envelope: {}", queue_name, e)
                    }
                }
                consumer.ack(delivery)?;
            }
            connection.close()
        })();
        if let Err(e) = result {
            match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(e.to_string()));
                }
                None => log::error!("[AmqpMailbox {}] consumer failed: {}", queue_name, e),
            }
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(Mailbox::new(address, rx)),
        Ok(Err(e)) => Err(ControlError::Transport(e)),
        Err(_) => Err(ControlError::Transport(format!(
            "consumer for '{}' exited during startup",
            address
        ))),
    }
}
