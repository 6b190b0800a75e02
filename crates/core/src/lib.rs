//! Realtime voice connection manager.
//!
//! A [`VoiceSession`] negotiates a short-lived descriptor, then drives either
//! the peer (WebRTC) or the duplex socket (WebSocket) protocol behind one
//! state machine. Every native resource it opens is recorded in a
//! [`ResourceRegistry`] and released through a single teardown path.

pub mod audio;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod negotiator;
pub mod registry;
pub mod session;
pub mod state;
pub mod translate;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use descriptor::{ProviderKind, SessionDescriptor};
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use events::CanonicalEvent;
pub use negotiator::{HttpNegotiator, SessionNegotiator, StaticNegotiator};
pub use registry::ResourceRegistry;
pub use session::{VoiceSession, VoiceSessionBuilder};
pub use state::ConnectionState;
pub use transport::InterruptOutcome;
