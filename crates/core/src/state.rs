use crate::events::CanonicalEvent;
use std::fmt;

/// Authoritative session state reported through `on_state_change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl ConnectionState {
    /// States only reachable after a successful connect.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Listening
                | ConnectionState::Processing
                | ConnectionState::Speaking
        )
    }

    /// The state a live session moves to when `event` arrives, if any.
    ///
    /// Terminal events (`Failed`, `Closed`) are handled by the session itself.
    pub fn on_event(self, event: &CanonicalEvent) -> Option<ConnectionState> {
        if !self.is_live() {
            return None;
        }
        let next = match event {
            CanonicalEvent::UserSpeechStarted => ConnectionState::Listening,
            CanonicalEvent::UserSpeechStopped => ConnectionState::Processing,
            CanonicalEvent::AiSpeaking | CanonicalEvent::AiAudio(_) => ConnectionState::Speaking,
            CanonicalEvent::TurnComplete => ConnectionState::Connected,
            CanonicalEvent::Interrupted => ConnectionState::Listening,
            _ => return None,
        };
        (next != self).then_some(next)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Listening => "listening",
            ConnectionState::Processing => "processing",
            ConnectionState::Speaking => "speaking",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn conversation_loop() {
        let mut state = Connected;
        for (event, expected) in [
            (CanonicalEvent::UserSpeechStarted, Listening),
            (CanonicalEvent::UserSpeechStopped, Processing),
            (CanonicalEvent::AiSpeaking, Speaking),
            (CanonicalEvent::TurnComplete, Connected),
        ] {
            state = state.on_event(&event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn repeated_audio_does_not_retransition() {
        assert_eq!(Speaking.on_event(&CanonicalEvent::AiAudio(vec![0.0])), None);
        assert_eq!(Processing.on_event(&CanonicalEvent::AiAudio(vec![0.0])), Some(Speaking));
    }

    #[test]
    fn non_live_states_ignore_provider_events() {
        for state in [Idle, Connecting, Error] {
            assert_eq!(state.on_event(&CanonicalEvent::AiSpeaking), None);
            assert_eq!(state.on_event(&CanonicalEvent::TurnComplete), None);
        }
    }

    #[test]
    fn interruption_returns_to_listening() {
        assert_eq!(Speaking.on_event(&CanonicalEvent::Interrupted), Some(Listening));
    }
}
