use serde_json::{Value, json};
use tracing::debug;

use super::types::{
    ConsumerData, ConsumerId, Device, Direction, MediaError, MediaKind, ProducerId, TrackId,
    TransportId, TransportOptions,
};

/// The WebRTC engine and capture hardware.
///
/// Calls are synchronous and local; every network round-trip is done by
/// the negotiator through the signaling channel.
pub trait MediaBackend: Send {
    /// Load local capabilities from the router's advertised ones.
    fn load_device(&mut self, router_capabilities: &Value) -> Result<Device, MediaError>;

    /// Build a transport from server options. Returns the local DTLS
    /// parameters to send with `connect-transport`.
    fn create_transport(
        &mut self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<Value, MediaError>;

    fn close_transport(&mut self, transport: &TransportId);

    /// Open the microphone, camera or screen capture.
    fn acquire_track(&mut self, kind: MediaKind) -> Result<TrackId, MediaError>;

    /// Stop a capture track and give the hardware back.
    fn release_track(&mut self, track: TrackId);

    /// Attach `track` to the send transport; returns RTP parameters for `produce`.
    fn prepare_producer(
        &mut self,
        transport: &TransportId,
        track: TrackId,
    ) -> Result<Value, MediaError>;

    fn close_producer(&mut self, producer: &ProducerId);

    /// Build a consumer from the server's `consumerData`; returns the remote track.
    fn attach_consumer(
        &mut self,
        transport: &TransportId,
        data: &ConsumerData,
    ) -> Result<TrackId, MediaError>;

    fn resume_consumer(&mut self, consumer: &ConsumerId) -> Result<(), MediaError>;

    fn close_consumer(&mut self, consumer: &ConsumerId);
}

/// Receive-only backend with no capture hardware. Remote tracks are
/// accounted for but not rendered; used by the command-line client.
#[derive(Debug, Default)]
pub struct HeadlessMedia {
    next_track: u64,
}

impl MediaBackend for HeadlessMedia {
    fn load_device(&mut self, router_capabilities: &Value) -> Result<Device, MediaError> {
        Ok(Device {
            rtp_capabilities: router_capabilities.clone(),
        })
    }

    fn create_transport(
        &mut self,
        direction: Direction,
        options: &TransportOptions,
    ) -> Result<Value, MediaError> {
        debug!("Headless {:?} transport {}", direction, options.id);
        Ok(json!({ "role": "auto", "fingerprints": [] }))
    }

    fn close_transport(&mut self, _transport: &TransportId) {}

    fn acquire_track(&mut self, kind: MediaKind) -> Result<TrackId, MediaError> {
        Err(MediaError::DeviceUnavailable(kind))
    }

    fn release_track(&mut self, _track: TrackId) {}

    fn prepare_producer(
        &mut self,
        _transport: &TransportId,
        _track: TrackId,
    ) -> Result<Value, MediaError> {
        Err(MediaError::Backend("headless backend cannot produce".to_string()))
    }

    fn close_producer(&mut self, _producer: &ProducerId) {}

    fn attach_consumer(
        &mut self,
        _transport: &TransportId,
        _data: &ConsumerData,
    ) -> Result<TrackId, MediaError> {
        self.next_track += 1;
        Ok(TrackId(self.next_track))
    }

    fn resume_consumer(&mut self, _consumer: &ConsumerId) -> Result<(), MediaError> {
        Ok(())
    }

    fn close_consumer(&mut self, _consumer: &ConsumerId) {}
}
