use crate::error::VoiceError;
use std::fmt;
use std::sync::Arc;

/// Provider-neutral event emitted by a transport after translation.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalEvent {
    /// The provider acknowledged the session configuration.
    SessionReady,
    UserSpeechStarted,
    UserSpeechStopped,
    UserTranscript { text: String, is_final: bool },
    /// The AI started (or continues) producing output.
    AiSpeaking,
    /// Decoded inbound audio, mono `f32` at the output rate.
    AiAudio(Vec<f32>),
    /// A finalized AI transcript for one turn.
    AiResponse(String),
    TurnComplete,
    /// Barge-in: in-flight AI output was discarded.
    Interrupted,
    Failed(VoiceError),
    /// The remote side closed without error.
    Closed,
}

/// Where transports deliver canonical events, in arrival order.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(CanonicalEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(deliver: impl Fn(CanonicalEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn emit(&self, event: CanonicalEvent) {
        (self.deliver)(event)
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = CanonicalEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
