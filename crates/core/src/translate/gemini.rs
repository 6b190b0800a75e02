use super::{EventTranslator, TranscriptBuffer};
use crate::audio::pcm::decode_f32_from_base64_i16;
use crate::error::VoiceError;
use crate::events::CanonicalEvent;
use realtime_types::gemini::{ServerContent, ServerMessage};
use tracing::{error, warn};

/// Socket frames of the duplex provider.
///
/// Transcription fragments are concatenated per speaker and released only on
/// a `finished` flag, a turn boundary or an interruption.
#[derive(Debug, Default)]
pub struct DuplexTranslator {
    user: TranscriptBuffer,
    ai: TranscriptBuffer,
    user_speaking: bool,
}

impl DuplexTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_user(&mut self, events: &mut Vec<CanonicalEvent>) {
        self.user_speaking = false;
        if let Some(text) = self.user.take() {
            events.push(CanonicalEvent::UserTranscript {
                text,
                is_final: true,
            });
        }
    }

    fn flush_ai(&mut self, events: &mut Vec<CanonicalEvent>) {
        if let Some(text) = self.ai.take() {
            events.push(CanonicalEvent::AiResponse(text));
        }
    }

    fn server_content(&mut self, content: ServerContent, events: &mut Vec<CanonicalEvent>) {
        if let Some(input) = content.input_transcription {
            if !input.text.is_empty() {
                if !self.user_speaking {
                    self.user_speaking = true;
                    events.push(CanonicalEvent::UserSpeechStarted);
                }
                self.user.push(&input.text);
            }
            if input.finished {
                self.flush_user(events);
            }
        }

        if content.interrupted {
            if let Some(output) = &content.output_transcription {
                self.ai.push(&output.text);
            }
            events.push(CanonicalEvent::Interrupted);
            self.flush_ai(events);
            self.user_speaking = false;
            return;
        }

        if content.output_transcription.is_some() || content.model_turn.is_some() {
            // The model answering closes the user's utterance.
            self.flush_user(events);
        }

        if let Some(output) = content.output_transcription {
            self.ai.push(&output.text);
            if output.finished {
                self.flush_ai(events);
            }
        }

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    self.ai.push(&text);
                }
                if let Some(blob) = part.inline_data {
                    if !blob.mime_type.is_empty() && !blob.mime_type.starts_with("audio/") {
                        continue;
                    }
                    let samples = decode_f32_from_base64_i16(&blob.data);
                    if !samples.is_empty() {
                        events.push(CanonicalEvent::AiAudio(samples));
                    }
                }
            }
        }

        if content.turn_complete {
            self.flush_user(events);
            self.flush_ai(events);
            events.push(CanonicalEvent::TurnComplete);
        }
    }
}

impl EventTranslator for DuplexTranslator {
    fn translate(&mut self, frame: &str) -> Vec<CanonicalEvent> {
        let message: ServerMessage = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Malformed socket frame");
                return vec![CanonicalEvent::Failed(VoiceError::ProtocolError(format!(
                    "malformed socket frame: {e}"
                )))];
            }
        };

        let mut events = Vec::new();
        if message.setup_complete.is_some() {
            events.push(CanonicalEvent::SessionReady);
        }
        if let Some(err) = message.error {
            error!(code = ?err.code, status = ?err.status, "Provider reported an error: {}", err.message);
            events.push(CanonicalEvent::Failed(VoiceError::ProtocolError(err.message)));
            return events;
        }
        if let Some(go_away) = message.go_away {
            warn!(time_left = ?go_away.time_left, "Provider announced an imminent disconnect");
        }
        if let Some(content) = message.server_content {
            self.server_content(content, &mut events);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn feed(translator: &mut DuplexTranslator, frames: &[&str]) -> Vec<CanonicalEvent> {
        frames.iter().flat_map(|f| translator.translate(f)).collect()
    }

    fn finals(events: &[CanonicalEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                CanonicalEvent::UserTranscript { text, is_final: true } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fragments_concatenate_until_finished() {
        let mut translator = DuplexTranslator::new();
        let events = feed(
            &mut translator,
            &[
                r#"{"serverContent":{"inputTranscription":{"text":"안녕"}}}"#,
                r#"{"serverContent":{"inputTranscription":{"text":"하세요"}}}"#,
                r#"{"serverContent":{"inputTranscription":{"finished":true}}}"#,
            ],
        );
        assert_eq!(events[0], CanonicalEvent::UserSpeechStarted);
        assert_eq!(finals(&events), vec!["안녕하세요".to_string()]);

        let events = feed(
            &mut translator,
            &[
                r#"{"serverContent":{"inputTranscription":{"text":"좋은"}}}"#,
                r#"{"serverContent":{"turnComplete":true}}"#,
            ],
        );
        assert_eq!(finals(&events), vec!["좋은".to_string()]);
        assert_eq!(events.last(), Some(&CanonicalEvent::TurnComplete));
    }

    #[test]
    fn model_output_closes_user_utterance() {
        let mut translator = DuplexTranslator::new();
        let events = feed(
            &mut translator,
            &[
                r#"{"serverContent":{"inputTranscription":{"text":"I went hiking"}}}"#,
                r#"{"serverContent":{"outputTranscription":{"text":"That sounds "}}}"#,
                r#"{"serverContent":{"outputTranscription":{"text":"lovely."}}}"#,
                r#"{"serverContent":{"turnComplete":true}}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::UserSpeechStarted,
                CanonicalEvent::UserTranscript { text: "I went hiking".into(), is_final: true },
                CanonicalEvent::AiResponse("That sounds lovely.".into()),
                CanonicalEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn interruption_flushes_ai_text_exactly_once() {
        let mut translator = DuplexTranslator::new();
        let events = feed(
            &mut translator,
            &[
                r#"{"serverContent":{"outputTranscription":{"text":"Let me tell you"}}}"#,
                r#"{"serverContent":{"interrupted":true}}"#,
                r#"{"serverContent":{"turnComplete":true}}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::Interrupted,
                CanonicalEvent::AiResponse("Let me tell you".into()),
                CanonicalEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn transcription_riding_on_an_interruption_is_kept() {
        let mut translator = DuplexTranslator::new();
        let events = feed(
            &mut translator,
            &[
                r#"{"serverContent":{"outputTranscription":{"text":"Once upon "}}}"#,
                r#"{"serverContent":{"interrupted":true,"outputTranscription":{"text":"a time"}}}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::Interrupted,
                CanonicalEvent::AiResponse("Once upon a time".into()),
            ]
        );
    }

    #[test]
    fn inline_audio_is_decoded() {
        let mut translator = DuplexTranslator::new();
        let data = base64::engine::general_purpose::STANDARD.encode([0x00u8, 0x40]);
        let frame = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{data}"}}}}]}}}}}}"#
        );
        assert_eq!(translator.translate(&frame), vec![CanonicalEvent::AiAudio(vec![0.5])]);
    }

    #[test]
    fn setup_and_error_frames() {
        let mut translator = DuplexTranslator::new();
        assert_eq!(
            translator.translate(r#"{"setupComplete":{}}"#),
            vec![CanonicalEvent::SessionReady]
        );
        assert_eq!(
            translator.translate(r#"{"error":{"code":400,"message":"bad setup"}}"#),
            vec![CanonicalEvent::Failed(VoiceError::ProtocolError("bad setup".into()))]
        );
        assert!(translator.translate(r#"{"goAway":{"timeLeft":"10s"}}"#).is_empty());
    }
}
