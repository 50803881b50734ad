use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::controller::{InternalEvent, JoinOutcome, SessionController, SessionNotice, SessionSummary};
use super::messages::ChatMessage;
use super::types::{PeerId, RoomId};
use crate::annotation::{AnnotationId, AnnotationObject, WireObject};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::media::{MediaBackend, MediaKind};
use crate::relay::{InboundEvent, Signaling};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands sent to the session actor
pub(crate) enum SessionCommand {
    Join {
        room_id: RoomId,
        nickname: String,
        subject_id: String,
        reply: Reply<JoinOutcome>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ChangeSlide {
        delta: isize,
        reply: Reply<usize>,
    },
    GoToSlide {
        index: usize,
        reply: Reply<usize>,
    },
    SlideReady {
        index: usize,
        generation: u64,
        reply: Reply<usize>,
    },
    UploadDeck {
        slides: Vec<String>,
        reply: Reply<()>,
    },
    HandoffPresenter {
        target: PeerId,
        reply: Reply<()>,
    },
    ForceMute {
        target: PeerId,
        reply: Reply<()>,
    },
    Toggle {
        kind: MediaKind,
        reply: Reply<bool>,
    },
    Draw {
        object: WireObject,
        reply: Reply<Option<AnnotationId>>,
    },
    Erase {
        id: AnnotationId,
        reply: Reply<()>,
    },
    ClearSlide {
        reply: Reply<()>,
    },
    SendChat {
        text: String,
        reply: Reply<ChatMessage>,
    },
    Summary {
        reply: oneshot::Sender<SessionSummary>,
    },
    SlideObjects {
        index: usize,
        reply: oneshot::Sender<Vec<AnnotationObject>>,
    },
}

async fn session_actor<S, M>(
    mut controller: SessionController<S, M>,
    inbound: async_channel::Receiver<InboundEvent>,
    mut internal: mpsc::UnboundedReceiver<InternalEvent>,
    mut rx: mpsc::Receiver<SessionCommand>,
) where
    S: Signaling,
    M: MediaBackend,
{
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => handle_command(&mut controller, cmd).await,
                None => break,
            },
            Ok(event) = inbound.recv() => controller.handle_inbound(event).await,
            Some(event) = internal.recv() => controller.handle_internal(event).await,
        }
    }

    debug!("All session handles dropped");
    controller.leave().await;
    info!("Session actor stopped");
}

async fn handle_command<S, M>(controller: &mut SessionController<S, M>, cmd: SessionCommand)
where
    S: Signaling,
    M: MediaBackend,
{
    match cmd {
        SessionCommand::Join {
            room_id,
            nickname,
            subject_id,
            reply,
        } => {
            let result = controller.join(room_id, &nickname, &subject_id).await;
            let _ = reply.send(result);
        }
        SessionCommand::Leave { reply } => {
            controller.leave().await;
            let _ = reply.send(());
        }
        SessionCommand::ChangeSlide { delta, reply } => {
            let _ = reply.send(controller.change_slide(delta));
        }
        SessionCommand::GoToSlide { index, reply } => {
            let _ = reply.send(controller.go_to_slide(index));
        }
        SessionCommand::SlideReady {
            index,
            generation,
            reply,
        } => {
            let _ = reply.send(controller.slide_ready(index, generation));
        }
        SessionCommand::UploadDeck { slides, reply } => {
            let _ = reply.send(controller.upload_deck(slides));
        }
        SessionCommand::HandoffPresenter { target, reply } => {
            let _ = reply.send(controller.handoff_presenter(target));
        }
        SessionCommand::ForceMute { target, reply } => {
            let _ = reply.send(controller.force_mute(target));
        }
        SessionCommand::Toggle { kind, reply } => {
            let result = controller.toggle(kind).await;
            let _ = reply.send(result);
        }
        SessionCommand::Draw { object, reply } => {
            let _ = reply.send(controller.draw(object));
        }
        SessionCommand::Erase { id, reply } => {
            let _ = reply.send(controller.erase(id));
        }
        SessionCommand::ClearSlide { reply } => {
            let _ = reply.send(controller.clear_slide());
        }
        SessionCommand::SendChat { text, reply } => {
            let _ = reply.send(controller.send_chat(&text));
        }
        SessionCommand::Summary { reply } => {
            let _ = reply.send(controller.summary());
        }
        SessionCommand::SlideObjects { index, reply } => {
            let _ = reply.send(controller.slide_objects(index));
        }
    }
}

pub struct SessionActor;

impl SessionActor {
    /// Spawn the session task. Returns a handle for commands and the
    /// receiver for UI notices. Dropping every handle leaves the room and
    /// stops the task.
    pub fn spawn<S, M>(
        signaling: S,
        backend: M,
        config: SessionConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionNotice>)
    where
        S: Signaling + Send + Sync + 'static,
        M: MediaBackend + 'static,
    {
        let (controller, channels) = SessionController::new(signaling, backend, config);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(session_actor(
            controller,
            channels.inbound,
            channels.internal,
            rx,
        ));
        (SessionHandle { tx }, channels.notices)
    }
}

/// Handle to communicate with the session actor
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Stopped)?;
        reply_rx.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn join(
        &self,
        room_id: RoomId,
        nickname: &str,
        subject_id: &str,
    ) -> Result<JoinOutcome, SessionError> {
        self.call(|reply| SessionCommand::Join {
            room_id,
            nickname: nickname.to_string(),
            subject_id: subject_id.to_string(),
            reply,
        })
        .await?
    }

    /// Leave the room; a stopped actor has nothing left to leave.
    pub async fn leave(&self) {
        let _ = self.call(|reply| SessionCommand::Leave { reply }).await;
    }

    pub async fn change_slide(&self, delta: isize) -> Result<usize, SessionError> {
        self.call(|reply| SessionCommand::ChangeSlide { delta, reply })
            .await?
    }

    pub async fn go_to_slide(&self, index: usize) -> Result<usize, SessionError> {
        self.call(|reply| SessionCommand::GoToSlide { index, reply })
            .await?
    }

    /// Report that the slide image from a `LoadSlide` notice is on screen.
    pub async fn slide_ready(&self, index: usize, generation: u64) -> Result<usize, SessionError> {
        self.call(|reply| SessionCommand::SlideReady {
            index,
            generation,
            reply,
        })
        .await?
    }

    pub async fn upload_deck(&self, slides: Vec<String>) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::UploadDeck { slides, reply })
            .await?
    }

    pub async fn handoff_presenter(&self, target: PeerId) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::HandoffPresenter { target, reply })
            .await?
    }

    pub async fn force_mute(&self, target: PeerId) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::ForceMute { target, reply })
            .await?
    }

    pub async fn toggle_mic(&self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Audio).await
    }

    pub async fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Video).await
    }

    pub async fn toggle_screen(&self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Screen).await
    }

    async fn toggle(&self, kind: MediaKind) -> Result<bool, SessionError> {
        self.call(|reply| SessionCommand::Toggle { kind, reply })
            .await?
    }

    pub async fn draw(&self, object: WireObject) -> Result<Option<AnnotationId>, SessionError> {
        self.call(|reply| SessionCommand::Draw { object, reply })
            .await?
    }

    pub async fn erase(&self, id: AnnotationId) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::Erase { id, reply }).await?
    }

    pub async fn clear_slide(&self) -> Result<(), SessionError> {
        self.call(|reply| SessionCommand::ClearSlide { reply }).await?
    }

    pub async fn send_chat(&self, text: &str) -> Result<ChatMessage, SessionError> {
        self.call(|reply| SessionCommand::SendChat {
            text: text.to_string(),
            reply,
        })
        .await?
    }

    pub async fn summary(&self) -> Result<SessionSummary, SessionError> {
        self.call(|reply| SessionCommand::Summary { reply }).await
    }

    pub async fn slide_objects(&self, index: usize) -> Result<Vec<AnnotationObject>, SessionError> {
        self.call(|reply| SessionCommand::SlideObjects { index, reply })
            .await
    }
}
