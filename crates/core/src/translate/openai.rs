use super::{EventTranslator, TranscriptBuffer};
use crate::error::VoiceError;
use crate::events::CanonicalEvent;
use realtime_types::openai::ServerEvent;
use tracing::{debug, error};

/// Control-channel events of the peer provider.
#[derive(Debug, Default)]
pub struct PeerTranslator {
    user: TranscriptBuffer,
    ai: TranscriptBuffer,
}

impl PeerTranslator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventTranslator for PeerTranslator {
    fn translate(&mut self, frame: &str) -> Vec<CanonicalEvent> {
        let event: ServerEvent = match serde_json::from_str(frame) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Malformed control-channel event");
                return vec![CanonicalEvent::Failed(VoiceError::ProtocolError(format!(
                    "malformed control event: {e}"
                )))];
            }
        };

        match event {
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
                vec![CanonicalEvent::SessionReady]
            }
            ServerEvent::SpeechStarted => vec![CanonicalEvent::UserSpeechStarted],
            ServerEvent::SpeechStopped => vec![CanonicalEvent::UserSpeechStopped],
            ServerEvent::InputTranscriptionDelta { delta } => {
                if delta.is_empty() {
                    return Vec::new();
                }
                self.user.push(&delta);
                vec![CanonicalEvent::UserTranscript {
                    text: self.user.peek().to_owned(),
                    is_final: false,
                }]
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                self.user.clear();
                if transcript.is_empty() {
                    return Vec::new();
                }
                vec![CanonicalEvent::UserTranscript {
                    text: transcript,
                    is_final: true,
                }]
            }
            ServerEvent::AudioTranscriptDelta { delta } => {
                self.ai.push(&delta);
                vec![CanonicalEvent::AiSpeaking]
            }
            ServerEvent::AudioTranscriptDone { transcript } => {
                let text = if transcript.is_empty() {
                    self.ai.take()
                } else {
                    self.ai.clear();
                    Some(transcript)
                };
                text.map(CanonicalEvent::AiResponse).into_iter().collect()
            }
            ServerEvent::AudioDelta { .. } => vec![CanonicalEvent::AiSpeaking],
            ServerEvent::ResponseDone => {
                self.ai.clear();
                vec![CanonicalEvent::TurnComplete]
            }
            ServerEvent::Error { error } => {
                error!(kind = %error.kind, code = ?error.code, "Provider reported an error: {}", error.message);
                vec![CanonicalEvent::Failed(VoiceError::ProtocolError(error.message))]
            }
            ServerEvent::Unknown => {
                debug!("Ignoring unhandled control-channel event");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn feed(translator: &mut PeerTranslator, frames: &[&str]) -> Vec<CanonicalEvent> {
        frames.iter().flat_map(|f| translator.translate(f)).collect()
    }

    #[test]
    fn user_transcript_accumulates_then_finalizes() {
        let mut translator = PeerTranslator::new();
        let events = feed(
            &mut translator,
            &[
                r#"{"type":"input_audio_buffer.speech_started"}"#,
                r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"Good "}"#,
                r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"morning"}"#,
                r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"Good morning."}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::UserSpeechStarted,
                CanonicalEvent::UserTranscript { text: "Good ".into(), is_final: false },
                CanonicalEvent::UserTranscript { text: "Good morning".into(), is_final: false },
                CanonicalEvent::UserTranscript { text: "Good morning.".into(), is_final: true },
            ]
        );
        assert!(translator.user.is_empty());
    }

    #[test]
    fn response_done_clears_ai_transcript() {
        let mut translator = PeerTranslator::new();
        let events = feed(
            &mut translator,
            &[
                r#"{"type":"response.audio_transcript.delta","delta":"How was "}"#,
                r#"{"type":"response.audio.delta","delta":"AAAA"}"#,
                r#"{"type":"response.done","response":{}}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::AiSpeaking,
                CanonicalEvent::AiSpeaking,
                CanonicalEvent::TurnComplete
            ]
        );
        assert!(translator.ai.is_empty());
    }

    #[test]
    fn transcript_done_prefers_server_text() {
        let mut translator = PeerTranslator::new();
        translator.translate(r#"{"type":"response.audio_transcript.delta","delta":"How was"}"#);
        let events =
            translator.translate(r#"{"type":"response.audio_transcript.done","transcript":"How was your day?"}"#);
        assert_eq!(events, vec![CanonicalEvent::AiResponse("How was your day?".into())]);

        translator.translate(r#"{"type":"response.audio_transcript.delta","delta":"Tell me"}"#);
        let events = translator.translate(r#"{"type":"response.audio_transcript.done"}"#);
        assert_eq!(events, vec![CanonicalEvent::AiResponse("Tell me".into())]);
    }

    #[test]
    fn error_and_malformed_frames_fail() {
        let mut translator = PeerTranslator::new();
        let events = translator
            .translate(r#"{"type":"error","error":{"type":"server_error","message":"overloaded"}}"#);
        assert_eq!(
            events,
            vec![CanonicalEvent::Failed(VoiceError::ProtocolError("overloaded".into()))]
        );

        match translator.translate("not json").as_slice() {
            [CanonicalEvent::Failed(e)] => assert_eq!(e.kind(), ErrorKind::ProtocolError),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn unknown_and_session_events() {
        let mut translator = PeerTranslator::new();
        assert!(translator.translate(r#"{"type":"rate_limits.updated"}"#).is_empty());
        assert_eq!(
            translator.translate(r#"{"type":"session.updated","session":{}}"#),
            vec![CanonicalEvent::SessionReady]
        );
    }
}
