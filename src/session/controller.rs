use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::context::SessionContext;
use super::messages::{
    self, CHANGE_MEDIA_STATE, CHAT_MESSAGE, ChatMessage, FORCE_MUTE, ForceMute, JOIN_ROOM,
    JoinAck, JoinRequest, LEAVE_ROOM, LeaveRoom, MediaState, NEW_PRODUCER, PEER_JOINED, PEER_LEFT,
    PEER_MEDIA_STATE, PRESENTER_CHANGED, PRODUCER_CLOSED, PeerJoined, PeerLeft, PresenterChanged,
    ProducerClosed, SLIDES_UPDATE, SUBSCRIBED_EVENTS, SlidesUpdate, UPDATE_SLIDE, UpdateSlide,
};
use super::types::{Participant, PeerId, RoomId, SessionPhase};
use crate::annotation::{
    self, AnnotationEvent, AnnotationId, AnnotationObject, AnnotationSynchronizer, ApplyOutcome,
    CanvasState, LocalChange, WireObject,
};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::media::{MediaBackend, MediaKind, ProducerDescriptor, ProducerId, TransportNegotiator};
use crate::relay::{InboundEvent, RELAY_CONNECTED, Signaling, SubscriptionId};

/// Notifications for whatever renders the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// Load this slide image, then report back with `slide_ready`
    LoadSlide {
        index: usize,
        url: Option<String>,
        generation: u64,
    },
    /// Drop every drawn object; a new deck or a new session starts
    CanvasReset,
    /// Repaint from `slide_objects`
    AnnotationsChanged { slide_index: usize },
    TrackAttached {
        peer_id: PeerId,
        kind: MediaKind,
        producer_id: ProducerId,
    },
    TrackDetached { producer_id: ProducerId },
    ParticipantsChanged,
    PresenterChanged { presenter_id: Option<PeerId> },
    ChatMessage(ChatMessage),
    /// Capture hardware unavailable; continuing without it
    MediaDegraded { kind: MediaKind, reason: String },
    /// The presenter muted us
    ForcedMute,
    Error(String),
}

/// Work the controller schedules for itself
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    RetryConsume {
        epoch: u64,
        descriptor: ProducerDescriptor,
        attempt: u32,
    },
}

/// Receiving ends handed out by [`SessionController::new`]
pub struct ControllerChannels {
    pub inbound: async_channel::Receiver<InboundEvent>,
    pub internal: mpsc::UnboundedReceiver<InternalEvent>,
    pub notices: mpsc::UnboundedReceiver<SessionNotice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub mic_on: bool,
    /// Existing producers attached during the join
    pub consumed: usize,
}

/// Read-only view of the session for display
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub phase: SessionPhase,
    pub room_id: Option<RoomId>,
    pub peer_id: PeerId,
    pub presenter_id: Option<PeerId>,
    pub participants: Vec<Participant>,
    pub slide_count: usize,
    pub current_slide: usize,
    pub canvas: CanvasState,
    pub consumers: usize,
}

/// Orchestrates one client's membership in a room.
///
/// Owns the session context and drives the negotiator and the annotation
/// synchronizer from commands and server events. Everything runs on the
/// caller's task; nothing here is shared.
pub struct SessionController<S, M> {
    signaling: S,
    config: SessionConfig,
    ctx: SessionContext,
    phase: SessionPhase,
    media: TransportNegotiator<M>,
    annotations: AnnotationSynchronizer,
    chat: VecDeque<ChatMessage>,
    subscription: Option<SubscriptionId>,
    inbound_tx: async_channel::Sender<InboundEvent>,
    inbound_rx: async_channel::Receiver<InboundEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl<S: Signaling, M: MediaBackend> SessionController<S, M> {
    pub fn new(signaling: S, backend: M, config: SessionConfig) -> (Self, ControllerChannels) {
        Self::with_context(signaling, backend, config, SessionContext::default())
    }

    pub fn with_context(
        signaling: S,
        backend: M,
        config: SessionConfig,
        ctx: SessionContext,
    ) -> (Self, ControllerChannels) {
        let (inbound_tx, inbound_rx) = async_channel::bounded(config.inbound_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let controller = Self {
            signaling,
            media: TransportNegotiator::new(backend, config.ack_timeout),
            config,
            ctx,
            phase: SessionPhase::Idle,
            annotations: AnnotationSynchronizer::new(),
            chat: VecDeque::new(),
            subscription: None,
            inbound_tx,
            inbound_rx: inbound_rx.clone(),
            internal_tx,
            notices: notice_tx,
        };
        let channels = ControllerChannels {
            inbound: inbound_rx,
            internal: internal_rx,
            notices: notice_rx,
        };
        (controller, channels)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn negotiator(&self) -> &TransportNegotiator<M> {
        &self.media
    }

    pub fn negotiator_mut(&mut self) -> &mut TransportNegotiator<M> {
        &mut self.media
    }

    pub fn chat_history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.chat.iter()
    }

    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Notice dropped, no listener");
        }
    }

    fn require_joined(&self) -> Result<RoomId, SessionError> {
        if !self.phase.is_joined() {
            return Err(SessionError::NotJoined);
        }
        self.ctx.room_id.clone().ok_or(SessionError::NotJoined)
    }

    fn require_presenter(&self) -> Result<RoomId, SessionError> {
        let room_id = self.require_joined()?;
        if !self.ctx.is_presenter() {
            return Err(SessionError::NotPresenter);
        }
        Ok(room_id)
    }

    // ---------------------------------------------------------------------
    // Join / leave
    // ---------------------------------------------------------------------

    /// Enter `room_id`. Any failure after the request went out unwinds
    /// the whole attempt and leaves the controller `Idle`.
    pub async fn join(
        &mut self,
        room_id: RoomId,
        nickname: &str,
        subject_id: &str,
    ) -> Result<JoinOutcome, SessionError> {
        if self.phase != SessionPhase::Idle {
            return Err(SessionError::AlreadyJoined);
        }
        info!("Joining room {} as {}", room_id, nickname);
        self.phase = SessionPhase::Joining;
        self.ctx.begin(room_id, nickname);
        self.subscription = Some(
            self.signaling
                .subscribe(SUBSCRIBED_EVENTS, self.inbound_tx.clone()),
        );

        match self.enter_room(subject_id).await {
            Ok(outcome) => {
                self.phase = SessionPhase::Joined;
                info!(
                    "Joined room {} with {} participants",
                    self.ctx.room_id.as_ref().map_or("?", RoomId::as_str),
                    self.ctx.participants.len()
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!("Join failed: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    async fn enter_room(&mut self, subject_id: &str) -> Result<JoinOutcome, SessionError> {
        let room_id = self.ctx.room_id.clone().ok_or(SessionError::NotJoined)?;

        let have_mic = match self.media.acquire(MediaKind::Audio) {
            Ok(_) => true,
            Err(e) => {
                self.notify(SessionNotice::MediaDegraded {
                    kind: MediaKind::Audio,
                    reason: e.to_string(),
                });
                false
            }
        };

        let payload = messages::encode(&JoinRequest {
            room_id: &room_id,
            peer_id: &self.ctx.peer_id,
            nickname: &self.ctx.nickname,
            subject_id,
            audio_channels: self.config.audio_channels,
        })?;
        let ack = self
            .signaling
            .request_within(JOIN_ROOM, payload, self.config.ack_timeout)
            .await?;
        if let Some(reason) = messages::ack_error(&ack) {
            return Err(SessionError::SignalingAck {
                event: JOIN_ROOM,
                reason,
            });
        }
        let ack: JoinAck = messages::decode(JOIN_ROOM, ack)?;

        self.media.create_device(&ack.rtp_capabilities)?;
        self.media.create_send_transport(&ack.send_transport_options)?;
        self.media.create_recv_transport(&ack.recv_transport_options)?;

        self.apply_room_snapshot(&ack);

        let mic_on = if have_mic {
            self.media
                .produce(&self.signaling, &self.ctx, MediaKind::Audio)
                .await?;
            true
        } else {
            false
        };
        if let Some(local) = self.ctx.local_mut() {
            local.mic_on = mic_on;
        }

        let mut consumed = 0;
        for descriptor in ack.existing_producers {
            if descriptor.peer_id == self.ctx.peer_id {
                continue;
            }
            if self.consume_producer(descriptor, 0).await {
                consumed += 1;
            }
        }

        if !self.ctx.slides.is_empty() {
            self.load_current_slide();
        }
        self.broadcast_media_state();

        Ok(JoinOutcome { mic_on, consumed })
    }

    /// Roster, presenter, deck, annotation and chat backlog from the join ack.
    fn apply_room_snapshot(&mut self, ack: &JoinAck) {
        for peer_id in &ack.peer_ids {
            let nickname = ack.peer_nicknames.get(peer_id.as_str()).map(String::as_str);
            self.ctx.upsert_participant(peer_id.clone(), nickname);
        }
        self.ctx.set_presenter(ack.presenter_id.clone(), None);

        if !ack.slides.is_empty() {
            self.ctx.set_deck(ack.slides.clone());
            if let Some(index) = ack.current_slide
                && self.ctx.is_valid_slide(index)
            {
                self.ctx.current_slide = index;
            }
        }

        for backlog in &ack.annotations {
            if !self.ctx.is_valid_slide(backlog.slide_index) {
                debug!("Skipping backlog object for slide {}", backlog.slide_index);
                continue;
            }
            self.annotations
                .seed(backlog.slide_index, vec![backlog.object.clone()]);
        }

        for message in &ack.chat_history {
            self.push_chat(message.clone());
        }

        self.notify(SessionNotice::ParticipantsChanged);
        self.notify(SessionNotice::PresenterChanged {
            presenter_id: self.ctx.presenter_id.clone(),
        });
    }

    /// Leave the room. Safe from any state; never fails.
    pub async fn leave(&mut self) {
        if self.phase == SessionPhase::Idle {
            debug!("Leave while idle");
            return;
        }
        self.phase = SessionPhase::Leaving;
        let room_id = self.ctx.room_id.clone();
        let peer_id = self.ctx.peer_id.clone();
        self.teardown();

        let Some(room_id) = room_id else {
            return;
        };
        info!("Leaving room {}", room_id);
        let payload = match messages::encode(&LeaveRoom {
            room_id: &room_id,
            peer_id: &peer_id,
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode leave-room: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .signaling
            .request_within(LEAVE_ROOM, payload, self.config.ack_timeout)
            .await
        {
            warn!("leave-room not acknowledged: {}", e);
        }
    }

    /// Drop every resource and piece of room state, back to `Idle`.
    fn teardown(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.signaling.unsubscribe(id);
        }
        self.media.close_all();
        self.annotations.reset();
        self.ctx.reset();
        self.chat.clear();
        let mut dropped = 0;
        while self.inbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Discarded {} queued events from the old room", dropped);
        }
        self.phase = SessionPhase::Idle;
        self.notify(SessionNotice::CanvasReset);
        self.notify(SessionNotice::ParticipantsChanged);
    }

    // ---------------------------------------------------------------------
    // Media
    // ---------------------------------------------------------------------

    /// Attach a remote producer, scheduling a retry while the device or
    /// receive transport is missing. Returns whether a track was attached.
    async fn consume_producer(&mut self, descriptor: ProducerDescriptor, attempt: u32) -> bool {
        let result = if attempt == 0 {
            self.media
                .safe_consume(&self.signaling, &self.ctx, &descriptor)
                .await
        } else {
            self.media
                .consume(&self.signaling, &self.ctx, &descriptor)
                .await
                .map(Some)
        };

        match result {
            Ok(Some(consumer)) => {
                self.notify(SessionNotice::TrackAttached {
                    peer_id: consumer.peer_id,
                    kind: consumer.kind,
                    producer_id: consumer.producer_id,
                });
                true
            }
            Ok(None) => false,
            Err(SessionError::TransportNotReady(reason)) => {
                self.schedule_consume_retry(descriptor, attempt + 1, reason);
                false
            }
            Err(e) => {
                warn!("Skipping producer {}: {}", descriptor.producer_id, e);
                if attempt > 0 {
                    self.media.forget_consumed(&descriptor.producer_id);
                }
                self.notify(SessionNotice::Error(e.to_string()));
                false
            }
        }
    }

    fn schedule_consume_retry(
        &mut self,
        descriptor: ProducerDescriptor,
        attempt: u32,
        reason: &'static str,
    ) {
        if attempt > self.config.consume_retry_max_attempts {
            warn!(
                "Giving up on producer {} after {} attempts",
                descriptor.producer_id, self.config.consume_retry_max_attempts
            );
            self.media.forget_consumed(&descriptor.producer_id);
            self.notify(SessionNotice::Error(
                SessionError::TransportNotReady(reason).to_string(),
            ));
            return;
        }

        let delay = self.config.consume_retry_delay(attempt);
        debug!(
            "Producer {} not consumable yet ({}), retry {} in {:?}",
            descriptor.producer_id, reason, attempt, delay
        );
        let epoch = self.ctx.epoch;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(InternalEvent::RetryConsume {
                epoch,
                descriptor,
                attempt,
            });
        });
    }

    pub async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::RetryConsume {
                epoch,
                descriptor,
                attempt,
            } => {
                if epoch != self.ctx.epoch || !self.phase.is_joined() {
                    debug!("Dropping consume retry for {} from an old session", descriptor.producer_id);
                    return;
                }
                self.consume_producer(descriptor, attempt).await;
            }
        }
    }

    fn media_flag(&self, kind: MediaKind) -> bool {
        self.ctx.local().is_some_and(|local| match kind {
            MediaKind::Audio => local.mic_on,
            MediaKind::Video => local.cam_on,
            MediaKind::Screen => local.screen_on,
        })
    }

    fn set_media_flag(&mut self, kind: MediaKind, on: bool) {
        if let Some(local) = self.ctx.local_mut() {
            match kind {
                MediaKind::Audio => local.mic_on = on,
                MediaKind::Video => local.cam_on = on,
                MediaKind::Screen => local.screen_on = on,
            }
        }
    }

    /// Flip the local `kind` stream. Turning on acquires hardware and
    /// produces; turning off closes the producer and releases hardware.
    pub async fn toggle(&mut self, kind: MediaKind) -> Result<bool, SessionError> {
        self.require_joined()?;
        let on = !self.media_flag(kind);
        if on {
            self.media.produce(&self.signaling, &self.ctx, kind).await?;
        } else {
            self.media.close_producer(&self.signaling, &self.ctx, kind, true);
        }
        self.set_media_flag(kind, on);
        info!("{} {}", kind, if on { "on" } else { "off" });
        self.broadcast_media_state();
        Ok(on)
    }

    pub async fn toggle_mic(&mut self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Audio).await
    }

    pub async fn toggle_camera(&mut self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Video).await
    }

    pub async fn toggle_screen(&mut self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Screen).await
    }

    fn mute_local(&mut self) {
        self.media
            .close_producer(&self.signaling, &self.ctx, MediaKind::Audio, true);
        self.set_media_flag(MediaKind::Audio, false);
        self.broadcast_media_state();
    }

    fn broadcast_media_state(&self) {
        let (Some(room_id), Some(local)) = (self.ctx.room_id.clone(), self.ctx.local()) else {
            return;
        };
        let state = MediaState {
            room_id: Some(room_id),
            peer_id: self.ctx.peer_id.clone(),
            mic_on: local.mic_on,
            cam_on: local.cam_on,
            screen_on: local.screen_on,
        };
        let sent = messages::encode(&state)
            .and_then(|payload| self.signaling.emit(CHANGE_MEDIA_STATE, payload));
        if let Err(e) = sent {
            warn!("Could not broadcast media state: {}", e);
        }
    }

    /// Ask `target` to mute. Targeting ourselves just mutes locally.
    pub fn force_mute(&mut self, target: PeerId) -> Result<(), SessionError> {
        let room_id = self.require_presenter()?;
        if target == self.ctx.peer_id {
            self.mute_local();
            return Ok(());
        }
        if !self.ctx.participants.contains_key(&target) {
            return Err(SessionError::UnknownPeer(target));
        }
        info!("Force-muting {}", target);
        let payload = messages::encode(&ForceMute {
            room_id: Some(room_id),
            target_peer_id: target,
        })?;
        self.signaling.emit(FORCE_MUTE, payload)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Slides and presenter
    // ---------------------------------------------------------------------

    fn load_current_slide(&mut self) {
        let index = self.ctx.current_slide;
        let generation = self.annotations.begin_loading(index);
        let url = self.ctx.slide_url(index).map(str::to_string);
        debug!("Loading slide {} (generation {})", index, generation);
        self.notify(SessionNotice::LoadSlide {
            index,
            url,
            generation,
        });
    }

    fn navigate_to(&mut self, index: usize) {
        let outgoing = self.ctx.current_slide;
        self.annotations.snapshot_slide(outgoing);
        self.ctx.current_slide = index;
        self.load_current_slide();
    }

    /// Move `delta` slides, clamped to the deck. Presenter only.
    pub fn change_slide(&mut self, delta: isize) -> Result<usize, SessionError> {
        self.require_presenter()?;
        let target = self.ctx.current_slide.saturating_add_signed(delta);
        self.go_to_slide(target)
    }

    /// Jump to `index`, clamped to the deck. Presenter only.
    pub fn go_to_slide(&mut self, index: usize) -> Result<usize, SessionError> {
        let room_id = self.require_presenter()?;
        let last = self
            .ctx
            .slides
            .len()
            .checked_sub(1)
            .ok_or(SessionError::NoSlides)?;
        let target = index.min(last);
        if target == self.ctx.current_slide {
            return Ok(target);
        }

        self.navigate_to(target);
        let payload = messages::encode(&UpdateSlide {
            room_id,
            index: target,
        })?;
        self.signaling.emit(UPDATE_SLIDE, payload)?;
        Ok(target)
    }

    /// The slide image for `index` finished loading. Restores its objects
    /// and applies anything that arrived meanwhile.
    pub fn slide_ready(&mut self, index: usize, generation: u64) -> Result<usize, SessionError> {
        self.require_joined()?;
        let applied = self.annotations.mark_ready(&self.ctx, index, generation)?;
        self.notify(SessionNotice::AnnotationsChanged { slide_index: index });
        Ok(applied)
    }

    fn apply_deck(&mut self, slides: Vec<String>) {
        info!("New deck with {} slides", slides.len());
        self.annotations.reset();
        self.ctx.set_deck(slides);
        self.notify(SessionNotice::CanvasReset);
        if !self.ctx.slides.is_empty() {
            self.load_current_slide();
        }
    }

    /// Replace the deck for everyone. Uploading from a viewer claims the
    /// presenter role.
    pub fn upload_deck(&mut self, slides: Vec<String>) -> Result<(), SessionError> {
        let room_id = self.require_joined()?;
        if slides.is_empty() {
            return Err(SessionError::NoSlides);
        }
        let claim = !self.ctx.is_presenter();

        self.apply_deck(slides.clone());
        let payload = messages::encode(&SlidesUpdate {
            room_id: Some(room_id),
            slides,
        })?;
        self.signaling.emit(SLIDES_UPDATE, payload)?;

        if claim {
            self.announce_presenter(self.ctx.peer_id.clone())?;
        }
        Ok(())
    }

    /// Hand the presenter role to `target`. Only the presenter may pass it
    /// on; anyone may take an empty seat.
    pub fn handoff_presenter(&mut self, target: PeerId) -> Result<(), SessionError> {
        self.require_joined()?;
        if self.ctx.presenter_id.is_some() && !self.ctx.is_presenter() {
            return Err(SessionError::NotPresenter);
        }
        if !self.ctx.participants.contains_key(&target) {
            return Err(SessionError::UnknownPeer(target));
        }
        self.announce_presenter(target)
    }

    /// Apply a presenter change locally and broadcast it. The server's
    /// `presenter-changed` settles the handoff.
    fn announce_presenter(&mut self, target: PeerId) -> Result<(), SessionError> {
        let room_id = self.require_joined()?;
        let nickname = self
            .ctx
            .participants
            .get(&target)
            .map(|p| p.nickname.clone());
        self.ctx.set_presenter(Some(target.clone()), None);
        self.phase = SessionPhase::PresenterHandoff;
        info!("Presenter handoff to {}", target);

        let payload = messages::encode(&PresenterChanged {
            room_id: Some(room_id),
            presenter_id: target.clone(),
            presenter_nickname: nickname,
        })?;
        self.signaling.emit(PRESENTER_CHANGED, payload)?;
        self.notify(SessionNotice::PresenterChanged {
            presenter_id: Some(target),
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Annotations and chat
    // ---------------------------------------------------------------------

    fn edit(&mut self, change: LocalChange) -> Result<Option<AnnotationId>, SessionError> {
        self.require_joined()?;
        let id = self
            .annotations
            .emit_local_change(&self.signaling, &self.ctx, change)?;
        self.notify(SessionNotice::AnnotationsChanged {
            slide_index: self.ctx.current_slide,
        });
        Ok(id)
    }

    /// Create or update an object on the current slide.
    pub fn draw(&mut self, object: WireObject) -> Result<Option<AnnotationId>, SessionError> {
        self.edit(LocalChange::Upsert(object))
    }

    pub fn erase(&mut self, id: AnnotationId) -> Result<(), SessionError> {
        self.edit(LocalChange::Remove(id)).map(|_| ())
    }

    pub fn clear_slide(&mut self) -> Result<(), SessionError> {
        self.edit(LocalChange::Clear).map(|_| ())
    }

    /// Objects of `slide_index`: live if its canvas is up, else the stored
    /// snapshot.
    pub fn slide_objects(&self, slide_index: usize) -> Vec<AnnotationObject> {
        let live = self.annotations.live_slide() == Some(slide_index)
            && self.annotations.canvas_state() == CanvasState::Ready;
        if live {
            return self.annotations.live_objects().iter().cloned().collect();
        }
        self.annotations
            .stored(slide_index)
            .map(|snapshot| snapshot.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn send_chat(&mut self, text: &str) -> Result<ChatMessage, SessionError> {
        let room_id = self.require_joined()?;
        let message = ChatMessage {
            room_id: Some(room_id),
            peer_id: self.ctx.peer_id.clone(),
            nickname: self.ctx.nickname.clone(),
            text: text.to_string(),
            sent_at: annotation::now_millis(),
        };
        self.signaling
            .emit(CHAT_MESSAGE, messages::encode(&message)?)?;
        self.push_chat(message.clone());
        Ok(message)
    }

    fn push_chat(&mut self, message: ChatMessage) {
        self.chat.push_back(message);
        while self.chat.len() > self.config.chat_history_limit {
            self.chat.pop_front();
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            phase: self.phase,
            room_id: self.ctx.room_id.clone(),
            peer_id: self.ctx.peer_id.clone(),
            presenter_id: self.ctx.presenter_id.clone(),
            participants: self.ctx.participants.values().cloned().collect(),
            slide_count: self.ctx.slides.len(),
            current_slide: self.ctx.current_slide,
            canvas: self.annotations.canvas_state(),
            consumers: self.media.consumers().count(),
        }
    }

    // ---------------------------------------------------------------------
    // Server events
    // ---------------------------------------------------------------------

    /// Handle one server event. Events for another room or slide are
    /// dropped quietly; malformed ones are logged.
    pub async fn handle_inbound(&mut self, event: InboundEvent) {
        if !self.phase.is_joined() {
            debug!("Ignoring '{}' outside a room", event.name);
            return;
        }
        let name = event.name.clone();
        match self.dispatch(event).await {
            Ok(()) => {}
            Err(SessionError::StaleEvent(what)) => debug!("Dropped stale {}", what),
            Err(e) => warn!("Could not handle '{}': {}", name, e),
        }
    }

    fn check_room(&self, room_id: Option<&RoomId>) -> Result<(), SessionError> {
        match room_id {
            Some(room_id) if !self.ctx.in_room(room_id) => Err(SessionError::StaleEvent(format!(
                "event for room {room_id}"
            ))),
            _ => Ok(()),
        }
    }

    async fn dispatch(&mut self, event: InboundEvent) -> Result<(), SessionError> {
        let InboundEvent { name, payload } = event;
        match name.as_str() {
            RELAY_CONNECTED => {
                info!("Signaling reconnected, re-announcing media state");
                self.broadcast_media_state();
            }
            NEW_PRODUCER => {
                let descriptor: ProducerDescriptor = messages::decode(&name, payload)?;
                if self.ctx.has_departed(&descriptor.peer_id) {
                    return Err(SessionError::StaleEvent(format!(
                        "producer {} of departed peer {}",
                        descriptor.producer_id, descriptor.peer_id
                    )));
                }
                if descriptor.peer_id != self.ctx.peer_id {
                    self.consume_producer(descriptor, 0).await;
                }
            }
            PRODUCER_CLOSED => {
                let closed: ProducerClosed = messages::decode(&name, payload)?;
                self.check_room(closed.room_id.as_ref())?;
                if self.media.close_consumer(&closed.producer_id).is_some() {
                    self.notify(SessionNotice::TrackDetached {
                        producer_id: closed.producer_id,
                    });
                }
            }
            PEER_JOINED => {
                let joined: PeerJoined = messages::decode(&name, payload)?;
                if joined.peer_id != self.ctx.peer_id {
                    info!("Peer {} joined", joined.peer_id);
                    self.ctx.departed.remove(&joined.peer_id);
                    self.ctx
                        .upsert_participant(joined.peer_id, joined.nickname.as_deref());
                    self.notify(SessionNotice::ParticipantsChanged);
                }
            }
            PEER_LEFT => {
                let left: PeerLeft = messages::decode(&name, payload)?;
                self.on_peer_left(left.peer_id);
            }
            CHANGE_MEDIA_STATE | PEER_MEDIA_STATE => {
                let state: MediaState = messages::decode(&name, payload)?;
                self.check_room(state.room_id.as_ref())?;
                if state.peer_id == self.ctx.peer_id {
                    return Ok(());
                }
                let Some(participant) = self.ctx.participants.get_mut(&state.peer_id) else {
                    return Err(SessionError::StaleEvent(format!(
                        "media state of absent peer {}",
                        state.peer_id
                    )));
                };
                participant.mic_on = state.mic_on;
                participant.cam_on = state.cam_on;
                participant.screen_on = state.screen_on;
                self.notify(SessionNotice::ParticipantsChanged);
            }
            PRESENTER_CHANGED => {
                let changed: PresenterChanged = messages::decode(&name, payload)?;
                self.check_room(changed.room_id.as_ref())?;
                self.on_presenter_changed(changed);
            }
            FORCE_MUTE => {
                let mute: ForceMute = messages::decode(&name, payload)?;
                self.check_room(mute.room_id.as_ref())?;
                if mute.target_peer_id == self.ctx.peer_id {
                    info!("Muted by the presenter");
                    self.mute_local();
                    self.notify(SessionNotice::ForcedMute);
                }
            }
            UPDATE_SLIDE => {
                let update: UpdateSlide = messages::decode(&name, payload)?;
                self.check_room(Some(&update.room_id))?;
                if !self.ctx.is_valid_slide(update.index) {
                    return Err(SessionError::StaleEvent(format!(
                        "slide index {}",
                        update.index
                    )));
                }
                if update.index != self.ctx.current_slide {
                    self.navigate_to(update.index);
                }
            }
            SLIDES_UPDATE => {
                let update: SlidesUpdate = messages::decode(&name, payload)?;
                self.check_room(update.room_id.as_ref())?;
                self.apply_deck(update.slides);
            }
            CHAT_MESSAGE => {
                let message: ChatMessage = messages::decode(&name, payload)?;
                self.check_room(message.room_id.as_ref())?;
                self.push_chat(message.clone());
                self.notify(SessionNotice::ChatMessage(message));
            }
            _ => self.on_annotation_event(&name, payload)?,
        }
        Ok(())
    }

    fn on_peer_left(&mut self, peer_id: PeerId) {
        for consumer in self.media.close_consumers_of(&peer_id) {
            self.notify(SessionNotice::TrackDetached {
                producer_id: consumer.producer_id,
            });
        }
        let was_presenter = self.ctx.presenter_id.as_ref() == Some(&peer_id);
        if self.ctx.remove_participant(&peer_id).is_some() {
            info!("Peer {} left", peer_id);
            self.notify(SessionNotice::ParticipantsChanged);
        }
        if was_presenter {
            self.notify(SessionNotice::PresenterChanged { presenter_id: None });
        }
    }

    fn on_presenter_changed(&mut self, changed: PresenterChanged) {
        self.ctx.set_presenter(
            Some(changed.presenter_id.clone()),
            changed.presenter_nickname.as_deref(),
        );
        if self.phase == SessionPhase::PresenterHandoff {
            self.phase = SessionPhase::Joined;
        }
        info!("Presenter is now {}", changed.presenter_id);
        self.notify(SessionNotice::PresenterChanged {
            presenter_id: Some(changed.presenter_id),
        });
    }

    fn on_annotation_event(&mut self, name: &str, payload: Value) -> Result<(), SessionError> {
        let Some(event) = AnnotationEvent::parse(name, payload)? else {
            debug!("Unhandled event '{}'", name);
            return Ok(());
        };
        let slide_index = event.slide_index;
        match self.annotations.handle_remote(&self.ctx, event) {
            ApplyOutcome::Applied { changed: true } => {
                self.notify(SessionNotice::AnnotationsChanged { slide_index });
            }
            ApplyOutcome::Applied { changed: false } | ApplyOutcome::Buffered => {}
            ApplyOutcome::Stale => {
                return Err(SessionError::StaleEvent(format!(
                    "'{name}' for slide {slide_index}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{PathShape, Point, Shape};
    use crate::session::messages::{
        CONSUME, DRAW_PATH, PRODUCE, REMOVE_PATH,
    };
    use crate::session::Role;
    use crate::test_utils::{FakeMedia, LOCAL_PEER, ScriptedSignaling, join_ack};
    use serde_json::json;
    use std::time::Duration;

    type Controller = SessionController<ScriptedSignaling, FakeMedia>;

    fn config() -> SessionConfig {
        SessionConfig {
            ack_timeout: Duration::from_millis(200),
            consume_retry_base: Duration::from_millis(5),
            consume_retry_max_attempts: 3,
            ..SessionConfig::default()
        }
    }

    fn controller(signaling: &ScriptedSignaling) -> (Controller, ControllerChannels) {
        SessionController::with_context(
            signaling.clone(),
            FakeMedia::default(),
            config(),
            SessionContext::new(PeerId::from(LOCAL_PEER)),
        )
    }

    fn room_ack(extra: Value) -> Value {
        let mut ack = join_ack();
        if let (Some(ack), Some(extra)) = (ack.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                ack.insert(k.clone(), v.clone());
            }
        }
        ack
    }

    fn drain(channels: &mut ControllerChannels) -> Vec<SessionNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = channels.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn load_generation(notices: &[SessionNotice], slide: usize) -> u64 {
        notices
            .iter()
            .rev()
            .find_map(|n| match n {
                SessionNotice::LoadSlide {
                    index, generation, ..
                } if *index == slide => Some(*generation),
                _ => None,
            })
            .expect("no LoadSlide notice")
    }

    fn path(id: &str) -> WireObject {
        WireObject {
            id: Some(AnnotationId::from(id)),
            shape: Shape::Path(PathShape {
                points: vec![Point { x: 1.0, y: 2.0 }],
                stroke: "#000".into(),
                stroke_width: 2.0,
            }),
            version: None,
        }
    }

    fn event(name: &str, payload: Value) -> InboundEvent {
        InboundEvent::new(name, payload)
    }

    async fn joined_as_presenter(
        signaling: &ScriptedSignaling,
    ) -> (Controller, ControllerChannels) {
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({
                "presenterId": LOCAL_PEER,
                "peerIds": ["peer_remote01"],
                "peerNicknames": {"peer_remote01": "Bo"},
                "slides": ["s0.png", "s1.png", "s2.png"]
            })),
        );
        let (mut controller, mut channels) = controller(signaling);
        controller
            .join(RoomId::from("R1"), "Ana", "token")
            .await
            .unwrap();
        let generation = load_generation(&drain(&mut channels), 0);
        controller.slide_ready(0, generation).unwrap();
        signaling.clear_log();
        (controller, channels)
    }

    #[tokio::test]
    async fn join_builds_transports_and_consumes_existing() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({
                "presenterId": "peer_remote01",
                "peerIds": ["peer_remote01"],
                "peerNicknames": {"peer_remote01": "Bo"},
                "existingProducers": [
                    {"producerId": "p1", "kind": "video", "type": "camera", "peerId": "peer_remote01"},
                    {"producerId": "p2", "kind": "audio", "type": "mic", "peerId": "peer_remote01"}
                ]
            })),
        );
        let (mut controller, mut channels) = controller(&signaling);

        let outcome = controller
            .join(RoomId::from("R1"), "Ana", "secret")
            .await
            .unwrap();

        assert_eq!(outcome, JoinOutcome { mic_on: true, consumed: 2 });
        assert_eq!(controller.phase(), SessionPhase::Joined);
        assert_eq!(signaling.subscription_count(), 1);

        let join = &signaling.requests_named(JOIN_ROOM)[0];
        assert_eq!(join["audioChannels"], 1);
        assert_eq!(join["subjectId"], "secret");

        let ctx = controller.context();
        assert_eq!(ctx.presenter_id, Some(PeerId::from("peer_remote01")));
        assert_eq!(ctx.participants[&PeerId::from("peer_remote01")].nickname, "Bo");
        assert_eq!(ctx.participants[&PeerId::from("peer_remote01")].role, Role::Presenter);
        assert!(ctx.local().unwrap().mic_on);

        let state = signaling.emitted_named(CHANGE_MEDIA_STATE);
        assert_eq!(state.len(), 1);
        assert_eq!(state[0]["micOn"], true);

        let attached = drain(&mut channels)
            .into_iter()
            .filter(|n| matches!(n, SessionNotice::TrackAttached { .. }))
            .count();
        assert_eq!(attached, 2);
    }

    #[tokio::test]
    async fn join_without_microphone_degrades_to_listen_only() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = controller(&signaling);
        controller.negotiator_mut().backend_mut().deny(MediaKind::Audio);

        let outcome = controller
            .join(RoomId::from("R1"), "Ana", "")
            .await
            .unwrap();

        assert!(!outcome.mic_on);
        assert!(signaling.requests_named(PRODUCE).is_empty());
        assert!(drain(&mut channels).iter().any(|n| matches!(
            n,
            SessionNotice::MediaDegraded {
                kind: MediaKind::Audio,
                ..
            }
        )));
        assert_eq!(signaling.emitted_named(CHANGE_MEDIA_STATE)[0]["micOn"], false);
    }

    #[tokio::test]
    async fn join_ack_error_unwinds_to_idle() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(JOIN_ROOM, json!({"error": "room closed"}));
        let (mut controller, _channels) = controller(&signaling);

        let err = controller
            .join(RoomId::from("R1"), "Ana", "")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::SignalingAck { event: JOIN_ROOM, .. }));
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(controller.context().room_id.is_none());
        assert!(controller.negotiator().backend().live_tracks.is_empty());
        assert_eq!(signaling.subscription_count(), 0);
    }

    #[tokio::test]
    async fn join_times_out_without_ack() {
        let signaling = ScriptedSignaling::default();
        signaling.hang(JOIN_ROOM);
        let (mut controller, _channels) = controller(&signaling);

        let err = controller
            .join(RoomId::from("R1"), "Ana", "")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Relay(crate::relay::RelayError::Timeout(_))));
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(controller.negotiator().backend().live_tracks.is_empty());
    }

    #[tokio::test]
    async fn malformed_capabilities_fail_join() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(JOIN_ROOM, room_ack(json!({"rtpCapabilities": {}})));
        let (mut controller, _channels) = controller(&signaling);

        assert!(controller.join(RoomId::from("R1"), "Ana", "").await.is_err());
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();

        let err = controller
            .join(RoomId::from("R2"), "Ana", "")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyJoined));
        assert!(controller.context().in_room(&RoomId::from("R1")));
    }

    #[tokio::test]
    async fn join_backlog_seeds_current_slide() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({
                "slides": ["a.png", "b.png"],
                "currentSlide": 1,
                "annotations": [
                    {"slideIndex": 1, "object": {"id": "p1", "type": "path", "points": []}},
                    {"slideIndex": 7, "object": {"id": "p9", "type": "path", "points": []}}
                ],
                "chatHistory": [
                    {"peerId": "peer_remote01", "nickname": "Bo", "text": "hi", "sentAt": 1}
                ]
            })),
        );
        let (mut controller, mut channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();

        let notices = drain(&mut channels);
        let generation = load_generation(&notices, 1);
        assert!(notices.contains(&SessionNotice::LoadSlide {
            index: 1,
            url: Some("b.png".into()),
            generation,
        }));
        controller.slide_ready(1, generation).unwrap();

        let objects = controller.slide_objects(1);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id.as_str(), "p1");
        assert_eq!(controller.chat_history().count(), 1);
    }

    #[tokio::test]
    async fn leave_releases_everything_and_notifies_server() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;
        controller.toggle_camera().await.unwrap();
        controller
            .handle_inbound(event(
                NEW_PRODUCER,
                json!({"producerId": "p1", "kind": "video", "type": "camera", "peerId": "peer_remote01"}),
            ))
            .await;

        controller.leave().await;

        assert_eq!(controller.phase(), SessionPhase::Idle);
        let backend = controller.negotiator().backend();
        assert!(backend.live_tracks.is_empty());
        assert_eq!(backend.closed_transports.len(), 2);
        assert_eq!(backend.closed_consumers.len(), 1);
        assert!(controller.context().participants.is_empty());
        assert_eq!(signaling.subscription_count(), 0);

        let leave = signaling.requests_named(LEAVE_ROOM);
        assert_eq!(leave.len(), 1);
        assert_eq!(leave[0]["roomId"], "R1");
        assert_eq!(leave[0]["peerId"], LOCAL_PEER);
    }

    #[tokio::test]
    async fn leave_is_safe_from_any_state() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = controller(&signaling);
        controller.leave().await;
        controller.leave().await;
        assert_eq!(controller.phase(), SessionPhase::Idle);
        assert!(signaling.requests_named(LEAVE_ROOM).is_empty());

        signaling.hang(LEAVE_ROOM);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();
        controller.leave().await;
        assert_eq!(controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn events_after_leave_are_ignored() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;
        controller.leave().await;

        controller
            .handle_inbound(event(PEER_JOINED, json!({"peerId": "peer_late0001"})))
            .await;
        assert!(controller.context().participants.is_empty());
    }

    #[tokio::test]
    async fn presenter_changes_slide_and_broadcasts() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        controller.draw(path("p1")).unwrap();

        assert_eq!(controller.change_slide(1).unwrap(), 1);
        assert_eq!(controller.context().current_slide, 1);
        assert_eq!(signaling.emitted_named(UPDATE_SLIDE)[0]["index"], 1);
        let generation = load_generation(&drain(&mut channels), 1);
        controller.slide_ready(1, generation).unwrap();
        assert!(controller.slide_objects(1).is_empty());

        // Back to slide 0: its objects come back
        controller.change_slide(-1).unwrap();
        let generation = load_generation(&drain(&mut channels), 0);
        controller.slide_ready(0, generation).unwrap();
        assert_eq!(controller.slide_objects(0).len(), 1);
    }

    #[tokio::test]
    async fn slide_navigation_is_clamped() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        assert_eq!(controller.change_slide(10).unwrap(), 2);
        assert_eq!(controller.change_slide(-10).unwrap(), 0);
        assert_eq!(controller.go_to_slide(99).unwrap(), 2);
        // Already there: no broadcast
        assert_eq!(controller.go_to_slide(2).unwrap(), 2);
        assert_eq!(signaling.emitted_named(UPDATE_SLIDE).len(), 3);
    }

    #[tokio::test]
    async fn viewer_cannot_change_slide() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({"presenterId": "peer_remote01", "peerIds": ["peer_remote01"], "slides": ["a", "b"]})),
        );
        let (mut controller, _channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();

        assert!(matches!(controller.change_slide(1), Err(SessionError::NotPresenter)));
        assert!(matches!(controller.go_to_slide(1), Err(SessionError::NotPresenter)));
        assert_eq!(controller.context().current_slide, 0);
        assert!(signaling.emitted_named(UPDATE_SLIDE).is_empty());
    }

    #[tokio::test]
    async fn late_slide_load_does_not_repaint_new_slide() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;

        controller.go_to_slide(1).unwrap();
        let stale = load_generation(&drain(&mut channels), 1);
        controller.go_to_slide(2).unwrap();
        let current = load_generation(&drain(&mut channels), 2);

        assert!(matches!(
            controller.slide_ready(1, stale),
            Err(SessionError::StaleEvent(_))
        ));
        assert_eq!(controller.summary().canvas, CanvasState::Loading);
        controller.slide_ready(2, current).unwrap();
        assert_eq!(controller.summary().canvas, CanvasState::Ready);
    }

    #[tokio::test]
    async fn remote_update_slide_follows_presenter() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({"presenterId": "peer_remote01", "peerIds": ["peer_remote01"], "slides": ["a", "b"]})),
        );
        let (mut controller, mut channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();
        drain(&mut channels);

        controller
            .handle_inbound(event(UPDATE_SLIDE, json!({"roomId": "R1", "index": 1})))
            .await;
        assert_eq!(controller.context().current_slide, 1);
        load_generation(&drain(&mut channels), 1);

        // Out of range and other-room updates are ignored
        controller
            .handle_inbound(event(UPDATE_SLIDE, json!({"roomId": "R1", "index": 5})))
            .await;
        controller
            .handle_inbound(event(UPDATE_SLIDE, json!({"roomId": "R9", "index": 0})))
            .await;
        assert_eq!(controller.context().current_slide, 1);
    }

    #[tokio::test]
    async fn remote_annotation_buffered_until_canvas_ready() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(JOIN_ROOM, room_ack(json!({"slides": ["a.png"]})));
        let (mut controller, mut channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();
        let generation = load_generation(&drain(&mut channels), 0);

        controller
            .handle_inbound(event(
                DRAW_PATH,
                json!({"roomId": "R1", "slideIndex": 0, "path": {"id": "p1", "type": "path", "points": []}}),
            ))
            .await;
        assert!(controller.slide_objects(0).is_empty());

        assert_eq!(controller.slide_ready(0, generation).unwrap(), 1);
        let objects = controller.slide_objects(0);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id.as_str(), "p1");
    }

    #[tokio::test]
    async fn stale_annotation_is_dropped() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        controller
            .handle_inbound(event(
                DRAW_PATH,
                json!({"roomId": "R1", "slideIndex": 2, "path": {"id": "p1", "type": "path", "points": []}}),
            ))
            .await;
        assert!(controller.slide_objects(0).is_empty());
        assert!(controller.slide_objects(2).is_empty());
    }

    #[tokio::test]
    async fn local_draw_and_erase_are_broadcast() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        let id = controller.draw(path("p1")).unwrap().unwrap();
        controller.erase(id).unwrap();
        controller.clear_slide().unwrap();

        assert_eq!(signaling.emitted_named(DRAW_PATH).len(), 1);
        assert_eq!(signaling.emitted_named(REMOVE_PATH)[0]["objId"], "p1");
        assert_eq!(signaling.emitted_named(crate::session::messages::CLEAR_SLIDE).len(), 1);
        assert!(controller.slide_objects(0).is_empty());
    }

    #[tokio::test]
    async fn draw_before_join_fails() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = controller(&signaling);
        assert!(matches!(controller.draw(path("p1")), Err(SessionError::NotJoined)));
    }

    #[tokio::test]
    async fn upload_deck_from_viewer_claims_presenter() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({"presenterId": "peer_remote01", "peerIds": ["peer_remote01"]})),
        );
        let (mut controller, mut channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();
        drain(&mut channels);

        controller
            .upload_deck(vec!["x.png".into(), "y.png".into(), "z.png".into()])
            .unwrap();

        assert_eq!(controller.phase(), SessionPhase::PresenterHandoff);
        assert!(controller.context().is_presenter());
        assert_eq!(controller.context().slides.len(), 3);
        assert_eq!(signaling.emitted_named(SLIDES_UPDATE)[0]["slides"][2], "z.png");
        let announced = signaling.emitted_named(PRESENTER_CHANGED);
        assert_eq!(announced[0]["presenterId"], LOCAL_PEER);
        assert_eq!(announced[0]["presenterNickname"], "Ana");
        let notices = drain(&mut channels);
        assert!(notices.contains(&SessionNotice::CanvasReset));
        load_generation(&notices, 0);

        // Server confirms
        controller
            .handle_inbound(event(PRESENTER_CHANGED, json!({"presenterId": LOCAL_PEER})))
            .await;
        assert_eq!(controller.phase(), SessionPhase::Joined);
    }

    #[tokio::test]
    async fn remote_deck_resets_to_first_slide() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({"presenterId": "peer_remote01", "peerIds": ["peer_remote01"], "slides": ["a", "b"], "currentSlide": 1})),
        );
        let (mut controller, _channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();
        assert_eq!(controller.context().current_slide, 1);

        controller
            .handle_inbound(event(SLIDES_UPDATE, json!({"slides": ["n0", "n1", "n2"]})))
            .await;
        controller
            .handle_inbound(event(
                PRESENTER_CHANGED,
                json!({"presenterId": "peer_remote02", "presenterNickname": "Cy"}),
            ))
            .await;

        let ctx = controller.context();
        assert_eq!(ctx.current_slide, 0);
        assert_eq!(ctx.slides.len(), 3);
        assert_eq!(ctx.presenter_id, Some(PeerId::from("peer_remote02")));
        assert_eq!(ctx.participants[&PeerId::from("peer_remote02")].nickname, "Cy");
    }

    #[tokio::test]
    async fn viewer_cannot_hand_off_an_occupied_seat() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({"presenterId": "peer_remote01", "peerIds": ["peer_remote01"]})),
        );
        let (mut controller, _channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();

        assert!(matches!(
            controller.handoff_presenter(PeerId::from(LOCAL_PEER)),
            Err(SessionError::NotPresenter)
        ));
    }

    #[tokio::test]
    async fn presenter_hands_off_to_participant() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        assert!(matches!(
            controller.handoff_presenter(PeerId::from("peer_nobody01")),
            Err(SessionError::UnknownPeer(_))
        ));
        controller
            .handoff_presenter(PeerId::from("peer_remote01"))
            .unwrap();
        assert!(!controller.context().is_presenter());
        assert_eq!(
            signaling.emitted_named(PRESENTER_CHANGED)[0]["presenterId"],
            "peer_remote01"
        );
    }

    #[tokio::test]
    async fn forced_mute_releases_mic_and_rebroadcasts() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        assert!(controller.context().local().unwrap().mic_on);

        controller
            .handle_inbound(event(FORCE_MUTE, json!({"targetPeerId": LOCAL_PEER})))
            .await;

        assert!(!controller.context().local().unwrap().mic_on);
        assert!(controller.negotiator().producer(MediaKind::Audio).is_none());
        assert!(controller.negotiator().backend().live_tracks.is_empty());
        let state = signaling.emitted_named(CHANGE_MEDIA_STATE);
        assert_eq!(state.last().unwrap()["micOn"], false);
        assert!(drain(&mut channels).contains(&SessionNotice::ForcedMute));
    }

    #[tokio::test]
    async fn force_mute_for_someone_else_is_ignored() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        controller
            .handle_inbound(event(FORCE_MUTE, json!({"targetPeerId": "peer_remote01"})))
            .await;
        assert!(controller.context().local().unwrap().mic_on);
    }

    #[tokio::test]
    async fn presenter_force_mutes_peer() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        controller.force_mute(PeerId::from("peer_remote01")).unwrap();
        assert_eq!(
            signaling.emitted_named(FORCE_MUTE)[0]["targetPeerId"],
            "peer_remote01"
        );
        assert!(matches!(
            controller.force_mute(PeerId::from("peer_nobody01")),
            Err(SessionError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn camera_toggle_produces_then_releases() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        assert!(controller.toggle_camera().await.unwrap());
        let producer = controller
            .negotiator()
            .producer(MediaKind::Video)
            .unwrap()
            .id
            .clone();
        assert_eq!(controller.negotiator().backend().live_tracks.len(), 2);

        assert!(!controller.toggle_camera().await.unwrap());
        assert!(controller.negotiator().producer(MediaKind::Video).is_none());
        assert_eq!(controller.negotiator().backend().live_tracks.len(), 1);
        assert_eq!(
            signaling.emitted_named(crate::session::messages::CLOSE_PRODUCER)[0]["producerId"],
            producer.as_str()
        );
        let state = signaling.emitted_named(CHANGE_MEDIA_STATE);
        assert_eq!(state[0]["camOn"], true);
        assert_eq!(state[1]["camOn"], false);
    }

    #[tokio::test]
    async fn denied_screen_share_reports_and_keeps_state() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;
        controller.negotiator_mut().backend_mut().deny(MediaKind::Screen);

        let err = controller.toggle_screen().await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceAcquisition { .. }));
        assert!(!controller.context().local().unwrap().screen_on);
        assert!(signaling.emitted_named(CHANGE_MEDIA_STATE).is_empty());
    }

    #[tokio::test]
    async fn replayed_new_producer_attaches_once() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        let announce = event(
            NEW_PRODUCER,
            json!({"producerId": "p1", "kind": "video", "type": "camera", "peerId": "peer_remote01"}),
        );

        controller.handle_inbound(announce.clone()).await;
        controller.handle_inbound(event(RELAY_CONNECTED, Value::Null)).await;
        controller.handle_inbound(announce).await;

        assert_eq!(signaling.requests_named(CONSUME).len(), 1);
        assert_eq!(controller.negotiator().backend().attached.len(), 1);
        let attached = drain(&mut channels)
            .into_iter()
            .filter(|n| matches!(n, SessionNotice::TrackAttached { .. }))
            .count();
        assert_eq!(attached, 1);
        // Reconnect re-announced media state
        assert_eq!(signaling.emitted_named(CHANGE_MEDIA_STATE).len(), 1);
    }

    #[tokio::test]
    async fn consume_retries_until_transport_ready() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        controller.negotiator_mut().close_all();

        let descriptor = crate::test_utils::descriptor("p7", "peer_remote01", "video");
        controller
            .handle_inbound(event(NEW_PRODUCER, serde_json::to_value(&descriptor).unwrap()))
            .await;
        assert!(signaling.requests_named(CONSUME).is_empty());

        // Device and receive transport come up before the retry fires
        let negotiator = controller.negotiator_mut();
        negotiator.create_device(&json!({"codecs": []})).unwrap();
        negotiator
            .create_recv_transport(&serde_json::from_value(json!({"id": "recv-2"})).unwrap())
            .unwrap();

        let retry = channels.internal.recv().await.unwrap();
        assert!(matches!(
            &retry,
            InternalEvent::RetryConsume { attempt: 1, .. }
        ));
        controller.handle_internal(retry).await;

        assert_eq!(signaling.requests_named(CONSUME).len(), 1);
        assert_eq!(controller.negotiator().backend().attached.len(), 1);
        assert!(drain(&mut channels).iter().any(|n| matches!(
            n,
            SessionNotice::TrackAttached { producer_id, .. } if producer_id.as_str() == "p7"
        )));
    }

    #[tokio::test]
    async fn consume_retry_gives_up_and_reports_once() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        controller.negotiator_mut().close_all();
        drain(&mut channels);

        let descriptor = crate::test_utils::descriptor("p7", "peer_remote01", "video");
        controller
            .handle_inbound(event(NEW_PRODUCER, serde_json::to_value(&descriptor).unwrap()))
            .await;
        for _ in 0..3 {
            let retry = channels.internal.recv().await.unwrap();
            controller.handle_internal(retry).await;
        }

        assert!(channels.internal.try_recv().is_err());
        let errors = drain(&mut channels)
            .into_iter()
            .filter(|n| matches!(n, SessionNotice::Error(_)))
            .count();
        assert_eq!(errors, 1);
        assert!(!controller.negotiator().is_consumed(&descriptor.producer_id));
    }

    #[tokio::test]
    async fn retry_from_previous_session_is_dropped() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        controller.negotiator_mut().close_all();
        let descriptor = crate::test_utils::descriptor("p7", "peer_remote01", "video");
        controller
            .handle_inbound(event(NEW_PRODUCER, serde_json::to_value(&descriptor).unwrap()))
            .await;

        controller.leave().await;
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();

        let retry = channels.internal.recv().await.unwrap();
        controller.handle_internal(retry).await;
        assert!(signaling.requests_named(CONSUME).is_empty());
        assert_eq!(controller.negotiator().consumers().count(), 0);
    }

    #[tokio::test]
    async fn peer_left_removes_tile_and_presenter() {
        let signaling = ScriptedSignaling::default();
        signaling.respond(
            JOIN_ROOM,
            room_ack(json!({
                "presenterId": "peer_remote01",
                "peerIds": ["peer_remote01"],
                "existingProducers": [
                    {"producerId": "p1", "kind": "video", "type": "camera", "peerId": "peer_remote01"}
                ]
            })),
        );
        let (mut controller, mut channels) = controller(&signaling);
        controller.join(RoomId::from("R1"), "Ana", "").await.unwrap();
        drain(&mut channels);

        controller
            .handle_inbound(event(PEER_LEFT, json!({"peerId": "peer_remote01"})))
            .await;

        assert!(!controller.context().participants.contains_key(&PeerId::from("peer_remote01")));
        assert!(controller.context().presenter_id.is_none());
        assert_eq!(controller.negotiator().consumers().count(), 0);
        let notices = drain(&mut channels);
        assert!(notices.contains(&SessionNotice::TrackDetached {
            producer_id: ProducerId::from("p1")
        }));
        assert!(notices.contains(&SessionNotice::PresenterChanged { presenter_id: None }));
    }

    #[tokio::test]
    async fn late_events_from_departed_peer_are_ignored() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;
        let bo = PeerId::from("peer_remote01");

        controller
            .handle_inbound(event(PEER_LEFT, json!({"peerId": "peer_remote01"})))
            .await;
        drain(&mut channels);

        // Sent before the departure, delivered after it
        controller
            .handle_inbound(event(
                PEER_MEDIA_STATE,
                json!({"peerId": "peer_remote01", "micOn": true, "camOn": true, "screenOn": false}),
            ))
            .await;
        controller
            .handle_inbound(event(
                NEW_PRODUCER,
                json!({"producerId": "late-1", "kind": "video", "peerId": "peer_remote01"}),
            ))
            .await;

        assert!(!controller.context().participants.contains_key(&bo));
        assert_eq!(controller.negotiator().consumers().count(), 0);
        assert!(signaling.requests_named(CONSUME).is_empty());
        assert!(drain(&mut channels).is_empty());

        // Joining again lifts the block
        controller
            .handle_inbound(event(PEER_JOINED, json!({"peerId": "peer_remote01", "nickname": "Bo"})))
            .await;
        controller
            .handle_inbound(event(
                NEW_PRODUCER,
                json!({"producerId": "p2", "kind": "video", "peerId": "peer_remote01"}),
            ))
            .await;
        assert!(controller.context().participants.contains_key(&bo));
        assert_eq!(controller.negotiator().consumers().count(), 1);
    }

    #[tokio::test]
    async fn departed_peers_are_forgotten_on_leave() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;
        controller
            .handle_inbound(event(PEER_LEFT, json!({"peerId": "peer_remote01"})))
            .await;
        assert!(controller.context().has_departed(&PeerId::from("peer_remote01")));

        controller.leave().await;
        assert!(controller.context().departed.is_empty());
    }

    #[tokio::test]
    async fn producer_closed_detaches_but_stays_deduplicated() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;
        let announce = event(
            NEW_PRODUCER,
            json!({"producerId": "p1", "kind": "video", "peerId": "peer_remote01"}),
        );
        controller.handle_inbound(announce.clone()).await;

        controller
            .handle_inbound(event(PRODUCER_CLOSED, json!({"producerId": "p1", "peerId": "peer_remote01"})))
            .await;
        assert_eq!(controller.negotiator().consumers().count(), 0);

        controller.handle_inbound(announce).await;
        assert_eq!(signaling.requests_named(CONSUME).len(), 1);
    }

    #[tokio::test]
    async fn peer_roster_and_media_state_updates() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, _channels) = joined_as_presenter(&signaling).await;

        controller
            .handle_inbound(event(PEER_JOINED, json!({"peerId": "peer_remote02", "nickname": "Cy"})))
            .await;
        controller
            .handle_inbound(event(
                PEER_MEDIA_STATE,
                json!({"peerId": "peer_remote02", "micOn": true, "camOn": false, "screenOn": true}),
            ))
            .await;

        let cy = &controller.context().participants[&PeerId::from("peer_remote02")];
        assert_eq!(cy.nickname, "Cy");
        assert!(cy.mic_on);
        assert!(cy.screen_on);
        assert_eq!(controller.summary().participants.len(), 3);
    }

    #[tokio::test]
    async fn chat_is_bounded_and_broadcast() {
        let signaling = ScriptedSignaling::default();
        let (mut controller, mut channels) = joined_as_presenter(&signaling).await;

        let sent = controller.send_chat("hello").unwrap();
        assert_eq!(sent.nickname, "Ana");
        assert_eq!(signaling.emitted_named(CHAT_MESSAGE)[0]["text"], "hello");

        for i in 0..250 {
            controller
                .handle_inbound(event(
                    CHAT_MESSAGE,
                    json!({"peerId": "peer_remote01", "nickname": "Bo", "text": format!("m{i}")}),
                ))
                .await;
        }
        assert_eq!(controller.chat_history().count(), 200);
        assert_eq!(controller.chat_history().last().unwrap().text, "m249");
        assert!(drain(&mut channels)
            .iter()
            .any(|n| matches!(n, SessionNotice::ChatMessage(m) if m.text == "m0")));
    }
}
