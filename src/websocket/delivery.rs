//! Delivery function backed by a connection's socket writer channel.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::queue::{Deliver, DeliveryError, QueuedMessage};

use super::message::ServerMessage;

/// Hands queued messages to the socket writer task.
///
/// A message counts as delivered once the writer channel accepts it.
pub struct WsDeliverer {
    sender: mpsc::Sender<ServerMessage>,
    send_timeout: Duration,
}

impl WsDeliverer {
    pub fn new(sender: mpsc::Sender<ServerMessage>, send_timeout: Duration) -> Self {
        Self {
            sender,
            send_timeout,
        }
    }
}

#[async_trait]
impl Deliver for WsDeliverer {
    async fn deliver(&self, message: &QueuedMessage) -> Result<(), DeliveryError> {
        match timeout(self.send_timeout, self.sender.send(ServerMessage::from(message))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::ConnectionClosed),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }
}
