use thiserror::Error;

use crate::media::{MediaError, MediaKind, ProducerId};
use crate::relay::RelayError;
use crate::session::PeerId;

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Camera, microphone or screen capture denied or absent. Non-fatal.
    #[error("{kind} unavailable: {reason}")]
    DeviceAcquisition { kind: MediaKind, reason: String },

    /// Device or transport not built yet; retried with backoff.
    #[error("transport not ready: {0}")]
    TransportNotReady(&'static str),

    /// One remote producer failed to attach; the session carries on.
    #[error("failed to consume producer {producer_id}: {reason}")]
    Consume {
        producer_id: ProducerId,
        reason: String,
    },

    #[error("'{event}' rejected by server: {reason}")]
    SignalingAck { event: &'static str, reason: String },

    /// Event or callback outlived the context it was meant for.
    #[error("stale {0}")]
    StaleEvent(String),

    #[error("malformed '{event}' payload: {source}")]
    Malformed {
        event: String,
        source: serde_json::Error,
    },

    #[error("not in a room")]
    NotJoined,

    #[error("already in a room")]
    AlreadyJoined,

    #[error("only the presenter can do that")]
    NotPresenter,

    #[error("no slides loaded")]
    NoSlides,

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("canvas for slide {0} is not ready")]
    CanvasNotReady(usize),

    #[error("session task stopped")]
    Stopped,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl SessionError {
    pub(crate) fn malformed(event: &str, source: serde_json::Error) -> Self {
        SessionError::Malformed {
            event: event.to_string(),
            source,
        }
    }
}
