use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Synthetic event delivered to subscribers after every (re)connection
pub const RELAY_CONNECTED: &str = "connect";

/// Relay client errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not connected to signaling server")]
    NotConnected,

    #[error("connection lost before acknowledgement")]
    ConnectionLost,

    #[error("relay task stopped")]
    Closed,

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A named event received from the signaling server
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// What the session layer needs from a signaling channel.
///
/// Delivery is at-most-once per physical message; ordering holds only
/// within a single event name, and events may be replayed after a
/// reconnect.
pub trait Signaling {
    /// Fire-and-forget event.
    fn emit(&self, event: &str, payload: Value) -> Result<(), RelayError>;

    /// Event expecting an acknowledgement. Resolves with the ack payload;
    /// never times out on its own.
    fn request(
        &self,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, RelayError>> + Send;

    /// `request` that fails with `RelayError::Timeout` after `timeout`.
    fn request_within(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value, RelayError>> + Send {
        let fut = self.request(event, payload);
        async move {
            tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| RelayError::Timeout(timeout))?
        }
    }

    /// Route the named events into `sink` until unsubscribed.
    fn subscribe(
        &self,
        events: &[&str],
        sink: async_channel::Sender<InboundEvent>,
    ) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}
