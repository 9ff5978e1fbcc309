use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::{Priority, QueuedMessage};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Client finished its handshake and can take deliveries
    #[serde(rename = "ready")]
    Ready,
    /// Client asks the server to hold deliveries
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "message")]
    Message {
        id: Uuid,
        message_type: String,
        priority: Priority,
        payload: serde_json::Value,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&QueuedMessage> for ServerMessage {
    fn from(message: &QueuedMessage) -> Self {
        Self::Message {
            id: message.id,
            message_type: message.message_type.clone(),
            priority: message.priority,
            payload: message.payload.clone(),
        }
    }
}
