//! Transport adapters: one trait, one implementation per realtime protocol.

pub mod duplex;
pub mod peer;

pub use duplex::DuplexTransport;
pub use peer::{
    ControlChannel, ControlFrame, PeerConnector, PeerSession, PeerTransport, RtcPeerConnector,
};

use crate::audio::devices::AudioDevices;
use crate::audio::visualizer::WaveformSources;
use crate::descriptor::{ProviderKind, SessionDescriptor};
use crate::error::{VoiceError, VoiceResult};
use crate::events::EventSink;
use crate::registry::ResourceRegistry;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a transport needs for one connection attempt.
pub struct TransportLink {
    pub descriptor: SessionDescriptor,
    pub registry: ResourceRegistry,
    /// Trips when the attempt is disconnected or superseded.
    pub abort: CancellationToken,
    pub events: EventSink,
    pub devices: Arc<dyn AudioDevices>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// A cancel request was written to the provider.
    CancelSent,
    /// No response was in flight.
    NothingToCancel,
    /// The provider has no native cancel; nothing was sent.
    Unsupported,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Establishes the session. Every native resource is admitted to
    /// `link.registry` as it is created; on failure the caller's cleanup
    /// releases whatever was admitted.
    async fn connect(&self, link: TransportLink) -> VoiceResult<()>;

    /// Sends the one-shot opening instruction turn.
    fn start_conversation(&self, instruction: &str) -> VoiceResult<()>;

    /// Injects a user text turn.
    fn send_message(&self, text: &str) -> VoiceResult<()>;

    fn interrupt(&self) -> VoiceResult<InterruptOutcome>;

    /// Best-effort cancel during teardown. Never fails.
    fn cancel_current_turn(&self);

    fn waveform_sources(&self) -> Option<WaveformSources>;
}

/// Runs `fut` unless `abort` trips first.
pub async fn until_aborted<F: Future>(
    abort: &CancellationToken,
    fut: F,
) -> VoiceResult<F::Output> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => Err(VoiceError::Aborted),
        out = fut => Ok(out),
    }
}
