use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::MediaBackend;
use super::types::{
    Consumer, Device, Direction, MediaError, MediaKind, Producer, ProducerDescriptor, ProducerId,
    TrackId, TransportId, TransportOptions,
};
use crate::error::SessionError;
use crate::relay::Signaling;
use crate::session::messages::{
    self, CLOSE_PRODUCER, CONNECT_TRANSPORT, CONSUME, ConnectTransportRequest, ConsumeAck,
    ConsumeRequest, PRODUCE, ProduceAck, ProduceRequest, ProducerClosed,
};
use crate::session::{PeerId, RoomId, SessionContext};

#[derive(Debug)]
struct LocalTransport {
    id: TransportId,
    dtls_parameters: Value,
    connected: bool,
}

/// Owns the device, both transports, every producer/consumer and the local
/// capture tracks for one session.
pub struct TransportNegotiator<M> {
    backend: M,
    ack_timeout: Duration,
    device: Option<Device>,
    send_transport: Option<LocalTransport>,
    recv_transport: Option<LocalTransport>,
    tracks: HashMap<MediaKind, TrackId>,
    producers: HashMap<MediaKind, Producer>,
    consumers: HashMap<ProducerId, Consumer>,
    /// Producer ids ever handed to `safe_consume` this session
    consumed: HashSet<ProducerId>,
}

impl<M: MediaBackend> TransportNegotiator<M> {
    pub fn new(backend: M, ack_timeout: Duration) -> Self {
        Self {
            backend,
            ack_timeout,
            device: None,
            send_transport: None,
            recv_transport: None,
            tracks: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            consumed: HashSet::new(),
        }
    }

    pub fn backend(&self) -> &M {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut M {
        &mut self.backend
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn producer(&self, kind: MediaKind) -> Option<&Producer> {
        self.producers.get(&kind)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.values()
    }

    pub fn consumer_for(&self, producer_id: &ProducerId) -> Option<&Consumer> {
        self.consumers.get(producer_id)
    }

    pub fn has_track(&self, kind: MediaKind) -> bool {
        self.tracks.contains_key(&kind)
    }

    pub fn is_ready_to_consume(&self) -> bool {
        self.device.is_some() && self.recv_transport.is_some()
    }

    /// Load local capabilities. Capabilities without a `codecs` list are
    /// rejected before they reach the backend.
    pub fn create_device(&mut self, router_capabilities: &Value) -> Result<(), SessionError> {
        if !router_capabilities
            .get("codecs")
            .is_some_and(Value::is_array)
        {
            return Err(MediaError::InvalidCapabilities("missing codecs".to_string()).into());
        }
        let device = self.backend.load_device(router_capabilities)?;
        self.device = Some(device);
        debug!("Device loaded");
        Ok(())
    }

    pub fn create_send_transport(&mut self, options: &TransportOptions) -> Result<(), SessionError> {
        self.send_transport = Some(self.build_transport(Direction::Send, options)?);
        Ok(())
    }

    pub fn create_recv_transport(&mut self, options: &TransportOptions) -> Result<(), SessionError> {
        self.recv_transport = Some(self.build_transport(Direction::Recv, options)?);
        Ok(())
    }

    fn build_transport(
        &mut self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<LocalTransport, SessionError> {
        if self.device.is_none() {
            return Err(SessionError::TransportNotReady("device not loaded"));
        }
        let dtls_parameters = self.backend.create_transport(direction, options)?;
        info!("{:?} transport {} created", direction, options.id);
        Ok(LocalTransport {
            id: options.id.clone(),
            dtls_parameters,
            connected: false,
        })
    }

    /// Open capture hardware for `kind`, reusing an already open track.
    pub fn acquire(&mut self, kind: MediaKind) -> Result<TrackId, SessionError> {
        if let Some(track) = self.tracks.get(&kind) {
            return Ok(*track);
        }
        match self.backend.acquire_track(kind) {
            Ok(track) => {
                self.tracks.insert(kind, track);
                Ok(track)
            }
            Err(e) => {
                warn!("Could not acquire {}: {}", kind, e);
                Err(SessionError::DeviceAcquisition {
                    kind,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn release(&mut self, kind: MediaKind) {
        if let Some(track) = self.tracks.remove(&kind) {
            self.backend.release_track(track);
            debug!("Released {}", kind);
        }
    }

    /// Round-trip the transport's DTLS parameters once, before first use.
    async fn connect_transport<S: Signaling>(
        &mut self,
        signaling: &S,
        room_id: &RoomId,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportId, SessionError> {
        let transport = match direction {
            Direction::Send => self.send_transport.as_mut(),
            Direction::Recv => self.recv_transport.as_mut(),
        }
        .ok_or(SessionError::TransportNotReady("transport not created"))?;

        if transport.connected {
            return Ok(transport.id.clone());
        }

        let payload = messages::encode(&ConnectTransportRequest {
            transport_id: &transport.id,
            dtls_parameters: &transport.dtls_parameters,
            room_id,
            peer_id,
        })?;
        let ack = signaling
            .request_within(CONNECT_TRANSPORT, payload, self.ack_timeout)
            .await?;
        if let Some(reason) = messages::ack_error(&ack) {
            return Err(SessionError::SignalingAck {
                event: CONNECT_TRANSPORT,
                reason,
            });
        }

        transport.connected = true;
        debug!("{:?} transport {} connected", direction, transport.id);
        Ok(transport.id.clone())
    }

    /// Publish the local `kind` track, acquiring hardware if needed. Any
    /// existing producer of the same kind is closed first.
    ///
    /// On failure the track is released again.
    pub async fn produce<S: Signaling>(
        &mut self,
        signaling: &S,
        ctx: &SessionContext,
        kind: MediaKind,
    ) -> Result<ProducerId, SessionError> {
        let room_id = ctx.room_id.as_ref().ok_or(SessionError::NotJoined)?;
        if self.send_transport.is_none() {
            return Err(SessionError::TransportNotReady("send transport not created"));
        }

        self.close_producer(signaling, ctx, kind, false);
        let track = self.acquire(kind)?;

        match self.publish(signaling, room_id, &ctx.peer_id, kind, track).await {
            Ok(producer) => {
                let id = producer.id.clone();
                info!("Producing {} as {}", kind, id);
                self.producers.insert(kind, producer);
                Ok(id)
            }
            Err(e) => {
                self.release(kind);
                Err(e)
            }
        }
    }

    async fn publish<S: Signaling>(
        &mut self,
        signaling: &S,
        room_id: &RoomId,
        peer_id: &PeerId,
        kind: MediaKind,
        track: TrackId,
    ) -> Result<Producer, SessionError> {
        let transport_id = self
            .connect_transport(signaling, room_id, peer_id, Direction::Send)
            .await?;
        let rtp_parameters = self.backend.prepare_producer(&transport_id, track)?;

        let payload = messages::encode(&ProduceRequest {
            transport_id: &transport_id,
            kind: kind.rtp_kind(),
            rtp_parameters,
            room_id,
            peer_id,
            source: kind.source(),
        })?;
        let ack = signaling
            .request_within(PRODUCE, payload, self.ack_timeout)
            .await?;
        if let Some(reason) = messages::ack_error(&ack) {
            return Err(SessionError::SignalingAck {
                event: PRODUCE,
                reason,
            });
        }
        let ack: ProduceAck = messages::decode(PRODUCE, ack)?;

        Ok(Producer {
            id: ack.producer_id,
            kind,
            transport_id,
            track,
        })
    }

    /// Close the `kind` producer, tell the server, and optionally release
    /// the capture track. Returns whether a producer existed.
    pub fn close_producer<S: Signaling>(
        &mut self,
        signaling: &S,
        ctx: &SessionContext,
        kind: MediaKind,
        release_track: bool,
    ) -> bool {
        let closed = match self.producers.remove(&kind) {
            Some(producer) => {
                self.backend.close_producer(&producer.id);
                if let Some(room_id) = ctx.room_id.clone() {
                    let notice = ProducerClosed {
                        producer_id: producer.id.clone(),
                        room_id: Some(room_id),
                        peer_id: Some(ctx.peer_id.clone()),
                    };
                    match messages::encode(&notice) {
                        Ok(payload) => {
                            if let Err(e) = signaling.emit(CLOSE_PRODUCER, payload) {
                                warn!("Could not announce closed producer {}: {}", producer.id, e);
                            }
                        }
                        Err(e) => warn!("Could not encode close-producer: {}", e),
                    }
                }
                debug!("Closed {} producer {}", kind, producer.id);
                true
            }
            None => false,
        };
        if release_track {
            self.release(kind);
        }
        closed
    }

    /// Attach a remote producer. Fails with `TransportNotReady` when the
    /// device or receive transport does not exist yet.
    pub async fn consume<S: Signaling>(
        &mut self,
        signaling: &S,
        ctx: &SessionContext,
        descriptor: &ProducerDescriptor,
    ) -> Result<Consumer, SessionError> {
        let room_id = ctx.room_id.as_ref().ok_or(SessionError::NotJoined)?;
        let rtp_capabilities = match (&self.device, &self.recv_transport) {
            (Some(device), Some(_)) => device.rtp_capabilities.clone(),
            (None, _) => return Err(SessionError::TransportNotReady("device not loaded")),
            (_, None) => return Err(SessionError::TransportNotReady("recv transport not created")),
        };
        let consume_error = |reason: String| SessionError::Consume {
            producer_id: descriptor.producer_id.clone(),
            reason,
        };
        let kind = descriptor
            .media_kind()
            .ok_or_else(|| consume_error(format!("unknown kind '{}'", descriptor.kind)))?;

        let transport_id = self
            .connect_transport(signaling, room_id, &ctx.peer_id, Direction::Recv)
            .await?;

        let payload = messages::encode(&ConsumeRequest {
            transport_id: &transport_id,
            producer_id: &descriptor.producer_id,
            room_id,
            peer_id: &ctx.peer_id,
            rtp_capabilities: &rtp_capabilities,
        })?;
        let ack = signaling
            .request_within(CONSUME, payload, self.ack_timeout)
            .await
            .map_err(|e| consume_error(e.to_string()))?;
        if let Some(reason) = messages::ack_error(&ack) {
            return Err(consume_error(reason));
        }
        let ack: ConsumeAck =
            serde_json::from_value(ack).map_err(|e| consume_error(e.to_string()))?;

        let data = ack.consumer_data;
        let track = self
            .backend
            .attach_consumer(&transport_id, &data)
            .map_err(|e| consume_error(e.to_string()))?;
        if let Err(e) = self.backend.resume_consumer(&data.id) {
            self.backend.close_consumer(&data.id);
            return Err(consume_error(e.to_string()));
        }

        let consumer = Consumer {
            id: data.id,
            producer_id: descriptor.producer_id.clone(),
            peer_id: descriptor.peer_id.clone(),
            kind,
            transport_id,
            track,
        };
        info!(
            "Consuming {} from {} ({})",
            kind, consumer.peer_id, consumer.producer_id
        );
        self.consumers
            .insert(consumer.producer_id.clone(), consumer.clone());
        Ok(consumer)
    }

    /// `consume` at most once per producer id for the whole session.
    /// `Ok(None)` means the producer was already handled.
    ///
    /// The id stays claimed while a `TransportNotReady` retry is pending;
    /// any other failure releases it.
    pub async fn safe_consume<S: Signaling>(
        &mut self,
        signaling: &S,
        ctx: &SessionContext,
        descriptor: &ProducerDescriptor,
    ) -> Result<Option<Consumer>, SessionError> {
        if !self.consumed.insert(descriptor.producer_id.clone()) {
            debug!("Producer {} already consumed", descriptor.producer_id);
            return Ok(None);
        }
        match self.consume(signaling, ctx, descriptor).await {
            Ok(consumer) => Ok(Some(consumer)),
            Err(e @ SessionError::TransportNotReady(_)) => Err(e),
            Err(e) => {
                self.consumed.remove(&descriptor.producer_id);
                Err(e)
            }
        }
    }

    pub fn is_consumed(&self, producer_id: &ProducerId) -> bool {
        self.consumed.contains(producer_id)
    }

    /// Release a claimed producer id so a later announcement can retry it.
    pub fn forget_consumed(&mut self, producer_id: &ProducerId) {
        self.consumed.remove(producer_id);
    }

    pub fn close_consumer(&mut self, producer_id: &ProducerId) -> Option<Consumer> {
        let consumer = self.consumers.remove(producer_id)?;
        self.backend.close_consumer(&consumer.id);
        debug!("Closed consumer {} for {}", consumer.id, producer_id);
        Some(consumer)
    }

    pub fn close_consumers_of(&mut self, peer_id: &PeerId) -> Vec<Consumer> {
        let producer_ids: Vec<ProducerId> = self
            .consumers
            .values()
            .filter(|c| &c.peer_id == peer_id)
            .map(|c| c.producer_id.clone())
            .collect();
        producer_ids
            .iter()
            .filter_map(|id| self.close_consumer(id))
            .collect()
    }

    /// Tear everything down: producers, consumers, transports, hardware.
    /// Nothing is announced to the server; `leave-room` covers that.
    pub fn close_all(&mut self) {
        for (_, producer) in self.producers.drain() {
            self.backend.close_producer(&producer.id);
        }
        for (_, consumer) in self.consumers.drain() {
            self.backend.close_consumer(&consumer.id);
        }
        for (_, track) in self.tracks.drain() {
            self.backend.release_track(track);
        }
        for transport in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            self.backend.close_transport(&transport.id);
        }
        self.device = None;
        self.consumed.clear();
    }
}
