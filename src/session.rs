//! Room membership, presenter role and slide navigation

mod actor;
mod context;
mod controller;
pub mod messages;
mod types;

pub use actor::{SessionActor, SessionHandle};
pub use context::SessionContext;
pub use controller::{
    ControllerChannels, InternalEvent, JoinOutcome, SessionController, SessionNotice,
    SessionSummary,
};
pub use types::{Participant, PeerId, Role, RoomId, SessionPhase};
