//! Per-slide annotation objects replicated over signaling

mod store;
mod synchronizer;
mod types;

pub use store::{SlideSnapshot, Upsert};
pub use synchronizer::{
    AnnotationEvent, AnnotationOp, AnnotationSynchronizer, ApplyOutcome, CanvasState, LocalChange,
    PendingAnnotationEvent,
};
pub use types::{
    AnnotationId, AnnotationKind, AnnotationObject, PathShape, Point, Shape, TextShape, WireObject,
};
pub(crate) use types::now_millis;
