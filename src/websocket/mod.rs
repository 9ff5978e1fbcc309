//! WebSocket transport: the socket writer is each queue's delivery function.

mod delivery;
mod handler;
mod message;

pub use delivery::WsDeliverer;
pub use handler::{ws_handler, WsQuery};
pub use message::{ClientMessage, ServerMessage};
