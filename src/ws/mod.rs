//! Real-time subsystem: envelope codec, hub, and connection actor

pub mod connection;
pub mod envelope;
pub mod hub;

pub use connection::ws_handler;
pub use envelope::{Envelope, Event};
pub use hub::{Hub, HubHandle, OUTBOUND_QUEUE_CAPACITY};
