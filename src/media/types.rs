use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::session::PeerId;

/// Media backend errors
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} permission denied")]
    PermissionDenied(MediaKind),

    #[error("no {0} device available")]
    DeviceUnavailable(MediaKind),

    #[error("invalid router capabilities: {0}")]
    InvalidCapabilities(String),

    #[error("media backend failure: {0}")]
    Backend(String),
}

/// Local stream category; at most one producer per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    /// RTP-level kind on the wire
    pub fn rtp_kind(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video | MediaKind::Screen => "video",
        }
    }

    /// Source tag sent as `type`
    pub fn source(self) -> &'static str {
        match self {
            MediaKind::Audio => "mic",
            MediaKind::Video => "camera",
            MediaKind::Screen => "screen",
        }
    }

    /// Recover the kind from the `kind`/`type` pair of a producer announcement
    pub fn from_wire(kind: &str, source: Option<&str>) -> Option<Self> {
        match (kind, source) {
            (_, Some("screen")) => Some(MediaKind::Screen),
            ("audio", _) => Some(MediaKind::Audio),
            ("video", _) => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "microphone",
            MediaKind::Video => "camera",
            MediaKind::Screen => "screen",
        })
    }
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(ProducerId);
string_id!(ConsumerId);
string_id!(TransportId);

/// Backend-local handle to a capture or playback track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Local negotiation capabilities after loading the router's
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub rtp_capabilities: Value,
}

/// Server-issued transport parameters (ICE, DTLS, SCTP); only `id` is
/// interpreted here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportOptions {
    pub id: TransportId,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Announcement of a remote producer (`new-producer`, join snapshot)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub producer_id: ProducerId,
    pub kind: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub peer_id: PeerId,
}

impl ProducerDescriptor {
    pub fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::from_wire(&self.kind, self.source.as_deref())
    }
}

/// `consumerData` from the `consume` ack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerData {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: String,
    #[serde(default)]
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub track: TrackId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub track: TrackId,
}
