//! Signaling event names and payload shapes (camelCase on the wire)

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{PeerId, RoomId};
use crate::annotation::{AnnotationId, WireObject};
use crate::error::SessionError;
use crate::media::{ConsumerData, ProducerDescriptor, ProducerId, TransportId, TransportOptions};
use crate::relay::RelayError;

pub const JOIN_ROOM: &str = "join-room";
pub const LEAVE_ROOM: &str = "leave-room";
pub const CONNECT_TRANSPORT: &str = "connect-transport";
pub const PRODUCE: &str = "produce";
pub const CONSUME: &str = "consume";
pub const CLOSE_PRODUCER: &str = "close-producer";
pub const NEW_PRODUCER: &str = "new-producer";
pub const PRODUCER_CLOSED: &str = "producer-closed";
pub const PEER_JOINED: &str = "peer-joined";
pub const PEER_LEFT: &str = "peer-left";
pub const CHANGE_MEDIA_STATE: &str = "change-media-state";
pub const PEER_MEDIA_STATE: &str = "peer-media-state";
pub const PRESENTER_CHANGED: &str = "presenter-changed";
pub const FORCE_MUTE: &str = "force-mute";
pub const UPDATE_SLIDE: &str = "update-slide";
pub const SLIDES_UPDATE: &str = "slides-update";
pub const DRAW_PATH: &str = "draw-path";
pub const DRAW_TEXT: &str = "draw-text";
pub const REMOVE_PATH: &str = "remove-path";
pub const REMOVE_OBJECT: &str = "remove-object";
pub const CLEAR_SLIDE: &str = "clear-slide";
pub const CHAT_MESSAGE: &str = "chat-message";

/// Server-pushed events the controller listens to while in a room
pub const SUBSCRIBED_EVENTS: &[&str] = &[
    crate::relay::RELAY_CONNECTED,
    NEW_PRODUCER,
    PRODUCER_CLOSED,
    PEER_JOINED,
    PEER_LEFT,
    CHANGE_MEDIA_STATE,
    PEER_MEDIA_STATE,
    PRESENTER_CHANGED,
    FORCE_MUTE,
    UPDATE_SLIDE,
    SLIDES_UPDATE,
    DRAW_PATH,
    DRAW_TEXT,
    REMOVE_PATH,
    REMOVE_OBJECT,
    CLEAR_SLIDE,
    CHAT_MESSAGE,
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest<'a> {
    pub room_id: &'a RoomId,
    pub peer_id: &'a PeerId,
    pub nickname: &'a str,
    pub subject_id: &'a str,
    pub audio_channels: u8,
}

/// Room snapshot returned by `join-room`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    #[serde(default)]
    pub presenter_id: Option<PeerId>,
    pub rtp_capabilities: Value,
    pub send_transport_options: TransportOptions,
    pub recv_transport_options: TransportOptions,
    #[serde(default)]
    pub peer_ids: Vec<PeerId>,
    #[serde(default)]
    pub existing_producers: Vec<ProducerDescriptor>,
    #[serde(default)]
    pub peer_nicknames: HashMap<String, String>,
    #[serde(default)]
    pub slides: Vec<String>,
    #[serde(default)]
    pub current_slide: Option<usize>,
    #[serde(default)]
    pub annotations: Vec<BacklogAnnotation>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogAnnotation {
    pub slide_index: usize,
    pub object: WireObject,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest<'a> {
    pub transport_id: &'a TransportId,
    pub dtls_parameters: &'a Value,
    pub room_id: &'a RoomId,
    pub peer_id: &'a PeerId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest<'a> {
    pub transport_id: &'a TransportId,
    pub kind: &'static str,
    pub rtp_parameters: Value,
    pub room_id: &'a RoomId,
    pub peer_id: &'a PeerId,
    #[serde(rename = "type")]
    pub source: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAck {
    pub producer_id: ProducerId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest<'a> {
    pub transport_id: &'a TransportId,
    pub producer_id: &'a ProducerId,
    pub room_id: &'a RoomId,
    pub peer_id: &'a PeerId,
    pub rtp_capabilities: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeAck {
    pub consumer_data: ConsumerData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub peer_id: PeerId,
    #[serde(default)]
    pub mic_on: bool,
    #[serde(default)]
    pub cam_on: bool,
    #[serde(default)]
    pub screen_on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenterChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub presenter_id: PeerId,
    #[serde(default)]
    pub presenter_nickname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceMute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub target_peer_id: PeerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerJoined {
    pub peer_id: PeerId,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSlide {
    pub room_id: RoomId,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidesUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub slides: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawPath {
    pub room_id: RoomId,
    pub path: WireObject,
    pub slide_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawText {
    pub room_id: RoomId,
    pub text_obj: WireObject,
    pub slide_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveObject {
    pub room_id: RoomId,
    pub obj_id: AnnotationId,
    pub slide_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSlide {
    pub room_id: RoomId,
    pub slide_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub peer_id: PeerId,
    pub nickname: String,
    pub text: String,
    #[serde(default)]
    pub sent_at: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoom<'a> {
    pub room_id: &'a RoomId,
    pub peer_id: &'a PeerId,
}

/// The `error` field of an acknowledgement, if the server set one
pub fn ack_error(ack: &Value) -> Option<String> {
    match ack.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(msg)) => Some(msg.clone()),
        Some(other) => Some(other.to_string()),
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, RelayError> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, SessionError> {
    serde_json::from_value(payload).map_err(|e| SessionError::malformed(event, e))
}
