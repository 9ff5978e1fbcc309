//! Delivery seam between a queue and its transport.

use async_trait::async_trait;
use thiserror::Error;

use super::QueuedMessage;

/// Why a single delivery attempt failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The transport behind the connection has gone away
    #[error("Connection closed")]
    ConnectionClosed,

    /// The transport refused the message
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// The transport did not accept the message in time
    #[error("Delivery timed out")]
    Timeout,
}

/// Transmits one message over the connection.
///
/// An attempt is all-or-nothing: `Ok` means the transport took the whole
/// message, `Err` means none of it was sent. The queue imposes no timeout of
/// its own on this call.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, message: &QueuedMessage) -> Result<(), DeliveryError>;
}
