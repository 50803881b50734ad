//! Shared fakes for unit tests: a scripted signaling channel and an
//! in-memory media backend.

#![cfg(test)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};

use crate::media::{
    ConsumerData, ConsumerId, Device, Direction, MediaBackend, MediaError, MediaKind,
    ProducerDescriptor, ProducerId, TrackId, TransportId, TransportOptions,
};
use crate::relay::{InboundEvent, RelayError, Signaling, SubscriptionId};
use crate::session::messages::{CONSUME, JOIN_ROOM, PRODUCE};
use crate::session::{PeerId, RoomId, SessionContext};

pub const LOCAL_PEER: &str = "peer_local001";

// ============================================================================
// Scripted signaling
// ============================================================================

#[derive(Debug, Clone)]
enum Reply {
    Ack(Value),
    /// Never acknowledged
    Hang,
    Fail,
}

#[derive(Default)]
struct Script {
    emitted: Vec<(String, Value)>,
    requests: Vec<(String, Value)>,
    once: HashMap<String, VecDeque<Reply>>,
    sticky: HashMap<String, Reply>,
    next_producer: u64,
    next_subscription: u64,
    subscriptions: HashMap<SubscriptionId, (Vec<String>, async_channel::Sender<InboundEvent>)>,
}

/// In-memory `Signaling` that records traffic and answers requests from a
/// script, falling back to plausible default acks.
#[derive(Clone, Default)]
pub struct ScriptedSignaling {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSignaling {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// Answer every `event` request with `ack` from now on.
    pub fn respond(&self, event: &str, ack: Value) {
        self.lock().sticky.insert(event.to_string(), Reply::Ack(ack));
    }

    /// Answer only the next `event` request with `ack`.
    pub fn respond_once(&self, event: &str, ack: Value) {
        self.lock()
            .once
            .entry(event.to_string())
            .or_default()
            .push_back(Reply::Ack(ack));
    }

    /// Never acknowledge `event`.
    pub fn hang(&self, event: &str) {
        self.lock().sticky.insert(event.to_string(), Reply::Hang);
    }

    /// Fail `event` requests as if the connection dropped.
    pub fn fail(&self, event: &str) {
        self.lock().sticky.insert(event.to_string(), Reply::Fail);
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.lock().emitted.clone()
    }

    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.lock()
            .emitted
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn requests_named(&self, event: &str) -> Vec<Value> {
        self.lock()
            .requests
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        let mut script = self.lock();
        script.emitted.clear();
        script.requests.clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Push a server event to every subscriber of `event`.
    pub fn deliver(&self, event: &str, payload: Value) -> usize {
        let script = self.lock();
        let mut delivered = 0;
        for (events, sink) in script.subscriptions.values() {
            if events.iter().any(|e| e == event)
                && sink.try_send(InboundEvent::new(event, payload.clone())).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn reply_for(script: &mut Script, event: &str, payload: &Value) -> Reply {
        if let Some(reply) = script.once.get_mut(event).and_then(VecDeque::pop_front) {
            return reply;
        }
        if let Some(reply) = script.sticky.get(event) {
            return reply.clone();
        }
        match event {
            JOIN_ROOM => Reply::Ack(join_ack()),
            PRODUCE => {
                script.next_producer += 1;
                Reply::Ack(json!({ "producerId": format!("local-prod-{}", script.next_producer) }))
            }
            CONSUME => {
                let producer_id = payload["producerId"].clone();
                Reply::Ack(json!({
                    "consumerData": {
                        "id": format!("cons-{}", producer_id.as_str().unwrap_or_default()),
                        "producerId": producer_id,
                        "kind": "video",
                        "rtpParameters": {}
                    }
                }))
            }
            _ => Reply::Ack(json!({})),
        }
    }
}

impl Signaling for ScriptedSignaling {
    fn emit(&self, event: &str, payload: Value) -> Result<(), RelayError> {
        self.lock().emitted.push((event.to_string(), payload));
        Ok(())
    }

    fn request(
        &self,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, RelayError>> + Send {
        let reply = {
            let mut script = self.lock();
            let reply = Self::reply_for(&mut script, event, &payload);
            script.requests.push((event.to_string(), payload));
            reply
        };
        async move {
            match reply {
                Reply::Ack(ack) => Ok(ack),
                Reply::Hang => std::future::pending().await,
                Reply::Fail => Err(RelayError::ConnectionLost),
            }
        }
    }

    fn subscribe(
        &self,
        events: &[&str],
        sink: async_channel::Sender<InboundEvent>,
    ) -> SubscriptionId {
        let mut script = self.lock();
        script.next_subscription += 1;
        let id = SubscriptionId(script.next_subscription);
        let events = events.iter().map(|e| e.to_string()).collect();
        script.subscriptions.insert(id, (events, sink));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscriptions.remove(&id);
    }
}

/// Minimal successful `join-room` acknowledgement
pub fn join_ack() -> Value {
    json!({
        "presenterId": null,
        "rtpCapabilities": { "codecs": [] },
        "sendTransportOptions": { "id": "send-1" },
        "recvTransportOptions": { "id": "recv-1" },
        "peerIds": [],
        "existingProducers": [],
        "peerNicknames": {}
    })
}

// ============================================================================
// Fake media backend
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeMedia {
    next_track: u64,
    denied: HashSet<MediaKind>,
    pub live_tracks: HashSet<TrackId>,
    pub attached: Vec<ConsumerId>,
    pub resumed: Vec<ConsumerId>,
    pub closed_consumers: Vec<ConsumerId>,
    pub closed_producers: Vec<ProducerId>,
    pub closed_transports: Vec<TransportId>,
}

impl FakeMedia {
    /// Make acquiring `kind` fail as if the user refused permission.
    pub fn deny(&mut self, kind: MediaKind) {
        self.denied.insert(kind);
    }

    fn track(&mut self) -> TrackId {
        self.next_track += 1;
        TrackId(self.next_track)
    }
}

impl MediaBackend for FakeMedia {
    fn load_device(&mut self, router_capabilities: &Value) -> Result<Device, MediaError> {
        Ok(Device {
            rtp_capabilities: router_capabilities.clone(),
        })
    }

    fn create_transport(
        &mut self,
        _direction: Direction,
        _options: &TransportOptions,
    ) -> Result<Value, MediaError> {
        Ok(json!({ "role": "auto", "fingerprints": [] }))
    }

    fn close_transport(&mut self, transport: &TransportId) {
        self.closed_transports.push(transport.clone());
    }

    fn acquire_track(&mut self, kind: MediaKind) -> Result<TrackId, MediaError> {
        if self.denied.contains(&kind) {
            return Err(MediaError::PermissionDenied(kind));
        }
        let track = self.track();
        self.live_tracks.insert(track);
        Ok(track)
    }

    fn release_track(&mut self, track: TrackId) {
        self.live_tracks.remove(&track);
    }

    fn prepare_producer(
        &mut self,
        _transport: &TransportId,
        _track: TrackId,
    ) -> Result<Value, MediaError> {
        Ok(json!({ "codecs": [], "encodings": [] }))
    }

    fn close_producer(&mut self, producer: &ProducerId) {
        self.closed_producers.push(producer.clone());
    }

    fn attach_consumer(
        &mut self,
        _transport: &TransportId,
        data: &ConsumerData,
    ) -> Result<TrackId, MediaError> {
        self.attached.push(data.id.clone());
        Ok(self.track())
    }

    fn resume_consumer(&mut self, consumer: &ConsumerId) -> Result<(), MediaError> {
        self.resumed.push(consumer.clone());
        Ok(())
    }

    fn close_consumer(&mut self, consumer: &ConsumerId) {
        self.closed_consumers.push(consumer.clone());
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn descriptor(producer_id: &str, peer_id: &str, kind: &str) -> ProducerDescriptor {
    ProducerDescriptor {
        producer_id: ProducerId::from(producer_id),
        kind: kind.to_string(),
        source: None,
        peer_id: PeerId::from(peer_id),
    }
}

/// Context for the local peer inside room `R1`, on slide 0
pub fn joined_context() -> SessionContext {
    let mut ctx = SessionContext::new(PeerId::from(LOCAL_PEER));
    ctx.begin(RoomId::from("R1"), "Ana");
    ctx
}
