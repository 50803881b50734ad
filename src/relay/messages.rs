use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single text frame on the signaling socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Named event; `ack` is set when the sender expects a reply
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },

    /// Reply to an event that carried an `ack` id
    #[serde(rename = "ack")]
    Ack {
        id: u64,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Frame::Event {
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn request(event: impl Into<String>, data: Value, ack: u64) -> Self {
        Frame::Event {
            event: event.into(),
            data,
            ack: Some(ack),
        }
    }
}
