use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Peer ID: "peer_" + 8 hex, or whatever the server hands out
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = String::with_capacity(13);
        id.push_str("peer_");

        let value: u32 = rand::rng().random();
        for i in 0..8 {
            let nibble = ((value >> (28 - i * 4)) & 0xF) as usize;
            id.push(HEX_CHARS[nibble] as char);
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    #[default]
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: PeerId,
    pub nickname: String,
    pub mic_on: bool,
    pub cam_on: bool,
    pub screen_on: bool,
    pub role: Role,
}

impl Participant {
    pub fn new(peer_id: PeerId, nickname: impl Into<String>) -> Self {
        Self {
            peer_id,
            nickname: nickname.into(),
            mic_on: false,
            cam_on: false,
            screen_on: false,
            role: Role::Viewer,
        }
    }
}

/// Where the controller is in its join/leave lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Joined,
    /// Joined, with a locally initiated presenter change awaiting the
    /// server's `presenter-changed`
    PresenterHandoff,
    Leaving,
}

impl SessionPhase {
    pub fn is_joined(self) -> bool {
        matches!(self, SessionPhase::Joined | SessionPhase::PresenterHandoff)
    }
}
