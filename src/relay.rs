//! Reconnecting WebSocket pub/sub client for the signaling server

mod client;
mod messages;
mod types;

pub use client::{RelayClient, RelayHandle};
pub use messages::Frame;
pub use types::{InboundEvent, RELAY_CONNECTED, RelayError, Signaling, SubscriptionId};
