//! Client core for collaborative meetings: signaling relay, media
//! negotiation, shared slide annotations and the session that ties them
//! together.

pub mod annotation;
pub mod config;
pub mod error;
pub mod media;
pub mod relay;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use error::SessionError;
pub use relay::{RelayClient, RelayHandle, Signaling};
pub use session::{SessionActor, SessionHandle, SessionNotice};
