use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::{debug, warn};

use super::store::SlideSnapshot;
use super::types::{AnnotationId, AnnotationKind, AnnotationObject, WireObject, now_millis};
use crate::error::SessionError;
use crate::relay::Signaling;
use crate::session::messages::{
    self, CLEAR_SLIDE, ClearSlide, DRAW_PATH, DRAW_TEXT, DrawPath, DrawText, REMOVE_OBJECT,
    REMOVE_PATH, RemoveObject,
};
use crate::session::{RoomId, SessionContext};

const MAX_PENDING_PER_SLIDE: usize = 4096;

/// Lifecycle of the canvas for the active slide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanvasState {
    #[default]
    Uninitialized,
    Loading,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationOp {
    Upsert(WireObject),
    /// `remove-path` names a path, `remove-object` anything else
    Remove {
        id: AnnotationId,
        kind: AnnotationKind,
    },
    Clear,
}

/// A replicated annotation change, tagged with where it belongs
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationEvent {
    pub room_id: RoomId,
    pub slide_index: usize,
    pub op: AnnotationOp,
}

impl AnnotationEvent {
    /// Decode an inbound signaling event. `Ok(None)` for non-annotation events.
    pub fn parse(name: &str, payload: Value) -> Result<Option<Self>, SessionError> {
        let event = match name {
            DRAW_PATH => {
                let p: DrawPath = messages::decode(name, payload)?;
                Self {
                    room_id: p.room_id,
                    slide_index: p.slide_index,
                    op: AnnotationOp::Upsert(p.path),
                }
            }
            DRAW_TEXT => {
                let p: DrawText = messages::decode(name, payload)?;
                Self {
                    room_id: p.room_id,
                    slide_index: p.slide_index,
                    op: AnnotationOp::Upsert(p.text_obj),
                }
            }
            REMOVE_PATH | REMOVE_OBJECT => {
                let p: RemoveObject = messages::decode(name, payload)?;
                let kind = if name == REMOVE_PATH {
                    AnnotationKind::Path
                } else {
                    AnnotationKind::Text
                };
                Self {
                    room_id: p.room_id,
                    slide_index: p.slide_index,
                    op: AnnotationOp::Remove { id: p.obj_id, kind },
                }
            }
            CLEAR_SLIDE => {
                let p: ClearSlide = messages::decode(name, payload)?;
                Self {
                    room_id: p.room_id,
                    slide_index: p.slide_index,
                    op: AnnotationOp::Clear,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Remote event that arrived before its slide's canvas was ready
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAnnotationEvent {
    pub event: AnnotationEvent,
    pub slide_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { changed: bool },
    Buffered,
    Stale,
}

/// A local edit to publish
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    Upsert(WireObject),
    Remove(AnnotationId),
    Clear,
}

/// Owns every slide's annotation state for one session.
///
/// Reconciliation is last-write-wins per object id in arrival order.
/// Concurrent edits to the same object can therefore settle differently
/// on different peers.
#[derive(Debug, Default)]
pub struct AnnotationSynchronizer {
    live: SlideSnapshot,
    live_slide: Option<usize>,
    state: CanvasState,
    generation: u64,
    snapshots: HashMap<usize, SlideSnapshot>,
    pending: HashMap<usize, VecDeque<PendingAnnotationEvent>>,
}

impl AnnotationSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canvas_state(&self) -> CanvasState {
        self.state
    }

    pub fn live_slide(&self) -> Option<usize> {
        self.live_slide
    }

    pub fn live_objects(&self) -> &SlideSnapshot {
        &self.live
    }

    pub fn stored(&self, slide_index: usize) -> Option<&SlideSnapshot> {
        self.snapshots.get(&slide_index)
    }

    pub fn pending_len(&self, slide_index: usize) -> usize {
        self.pending.get(&slide_index).map_or(0, VecDeque::len)
    }

    fn is_ready_for(&self, slide_index: usize) -> bool {
        self.state == CanvasState::Ready && self.live_slide == Some(slide_index)
    }

    /// Start loading the canvas for `slide_index` and return its generation
    /// token. Events still queued for any other slide are discarded.
    pub fn begin_loading(&mut self, slide_index: usize) -> u64 {
        self.pending.retain(|slide, queue| {
            if *slide != slide_index && !queue.is_empty() {
                debug!("Dropping {} queued events for slide {}", queue.len(), slide);
            }
            *slide == slide_index
        });
        self.generation += 1;
        self.live_slide = Some(slide_index);
        self.state = CanvasState::Loading;
        self.live = SlideSnapshot::default();
        self.generation
    }

    /// The canvas for `slide_index` finished loading. Restores the stored
    /// snapshot, then drains that slide's queue in arrival order, applying
    /// only events that still match `ctx`. Returns how many were applied.
    pub fn mark_ready(
        &mut self,
        ctx: &SessionContext,
        slide_index: usize,
        generation: u64,
    ) -> Result<usize, SessionError> {
        if generation != self.generation
            || self.live_slide != Some(slide_index)
            || self.state != CanvasState::Loading
            || slide_index != ctx.current_slide
        {
            return Err(SessionError::StaleEvent(format!(
                "canvas load for slide {slide_index} (generation {generation})"
            )));
        }

        self.restore_slide(slide_index);
        self.state = CanvasState::Ready;

        let queued = self.pending.remove(&slide_index).unwrap_or_default();
        let mut applied = 0;
        for pending in queued {
            if let ApplyOutcome::Applied { .. } = self.handle_remote(ctx, pending.event) {
                applied += 1;
            }
        }
        debug!("Canvas {} ready, {} queued events applied", slide_index, applied);
        Ok(applied)
    }

    /// Route one remote event: drop it if it no longer matches the room or
    /// the active slide, queue it if the canvas is not ready, else apply.
    pub fn handle_remote(&mut self, ctx: &SessionContext, event: AnnotationEvent) -> ApplyOutcome {
        if !ctx.in_room(&event.room_id) {
            debug!("Dropping annotation for room {}", event.room_id);
            return ApplyOutcome::Stale;
        }
        if event.slide_index != ctx.current_slide
            || (!ctx.slides.is_empty() && !ctx.is_valid_slide(event.slide_index))
        {
            debug!(
                "Dropping annotation for slide {} (active {})",
                event.slide_index, ctx.current_slide
            );
            return ApplyOutcome::Stale;
        }

        let slide_index = event.slide_index;
        if !self.is_ready_for(slide_index) {
            let queue = self.pending.entry(slide_index).or_default();
            if queue.len() >= MAX_PENDING_PER_SLIDE {
                warn!("Pending queue for slide {} full, dropping oldest", slide_index);
                queue.pop_front();
            }
            queue.push_back(PendingAnnotationEvent { event, slide_index });
            return ApplyOutcome::Buffered;
        }

        ApplyOutcome::Applied {
            changed: self.apply(slide_index, event.op),
        }
    }

    fn apply(&mut self, slide_index: usize, op: AnnotationOp) -> bool {
        match op {
            AnnotationOp::Upsert(object) => self
                .live
                .upsert(AnnotationObject::from_wire(object, slide_index))
                .changed(),
            AnnotationOp::Remove { id, kind } => self.live.remove(&id, kind).is_some(),
            AnnotationOp::Clear => {
                let had_objects = !self.live.is_empty();
                self.live.clear();
                had_objects
            }
        }
    }

    /// Apply a local edit to the live canvas and publish it, tagged with the
    /// current room and slide. Returns the id of the touched object.
    pub fn emit_local_change<S: Signaling>(
        &mut self,
        signaling: &S,
        ctx: &SessionContext,
        change: LocalChange,
    ) -> Result<Option<AnnotationId>, SessionError> {
        let room_id = ctx.room_id.clone().ok_or(SessionError::NotJoined)?;
        let slide_index = ctx.current_slide;
        if !self.is_ready_for(slide_index) {
            return Err(SessionError::CanvasNotReady(slide_index));
        }

        match change {
            LocalChange::Upsert(mut object) => {
                if object.id.is_none() {
                    object.id = Some(AnnotationId::generate_unique(|id| self.live.contains(id)));
                }
                object.version = Some(now_millis());
                let outcome = self
                    .live
                    .upsert(AnnotationObject::from_wire(object.clone(), slide_index));
                let id = outcome.id().clone();
                object.id = Some(id.clone());

                let (event, payload) = match object.shape.kind() {
                    AnnotationKind::Path => (
                        DRAW_PATH,
                        messages::encode(&DrawPath {
                            room_id,
                            path: object,
                            slide_index,
                        })?,
                    ),
                    AnnotationKind::Text => (
                        DRAW_TEXT,
                        messages::encode(&DrawText {
                            room_id,
                            text_obj: object,
                            slide_index,
                        })?,
                    ),
                };
                signaling.emit(event, payload)?;
                Ok(Some(id))
            }
            LocalChange::Remove(id) => {
                let kind = self.live.get(&id).map(AnnotationObject::kind);
                if let Some(kind) = kind {
                    self.live.remove(&id, kind);
                }
                let event = match kind {
                    Some(AnnotationKind::Path) => REMOVE_PATH,
                    _ => REMOVE_OBJECT,
                };
                let payload = messages::encode(&RemoveObject {
                    room_id,
                    obj_id: id.clone(),
                    slide_index,
                })?;
                signaling.emit(event, payload)?;
                Ok(Some(id))
            }
            LocalChange::Clear => {
                self.live.clear();
                let payload = messages::encode(&ClearSlide {
                    room_id,
                    slide_index,
                })?;
                signaling.emit(CLEAR_SLIDE, payload)?;
                Ok(None)
            }
        }
    }

    /// Capture the live canvas as the stored snapshot for `slide_index`.
    /// Nothing is captured unless that slide's canvas is ready.
    pub fn snapshot_slide(&mut self, slide_index: usize) -> Option<SlideSnapshot> {
        if !self.is_ready_for(slide_index) {
            return None;
        }
        self.snapshots.insert(slide_index, self.live.clone());
        Some(self.live.clone())
    }

    /// Load the stored snapshot for `slide_index` into the live canvas.
    pub fn restore_slide(&mut self, slide_index: usize) {
        self.live = self.snapshots.get(&slide_index).cloned().unwrap_or_default();
    }

    /// Merge backlog objects (e.g. from the join snapshot) into the stored
    /// snapshot for `slide_index`, minting ids where missing.
    pub fn seed(&mut self, slide_index: usize, objects: Vec<WireObject>) {
        let stored = self.snapshots.entry(slide_index).or_default();
        for object in objects {
            stored.upsert(AnnotationObject::from_wire(object, slide_index));
        }
    }

    /// Forget everything. The generation keeps counting so late
    /// `mark_ready` calls from a previous session are rejected.
    pub fn reset(&mut self) {
        *self = Self {
            generation: self.generation + 1,
            ..Self::default()
        };
    }
}
