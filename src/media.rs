//! Media device, transports, producers and consumers

mod backend;
mod negotiator;
mod types;

pub use backend::{HeadlessMedia, MediaBackend};
pub use negotiator::TransportNegotiator;
pub use types::{
    Consumer, ConsumerData, ConsumerId, Device, Direction, MediaError, MediaKind, Producer,
    ProducerDescriptor, ProducerId, TrackId, TransportId, TransportOptions,
};
