//! Session-level tuning. Every default matches the production endpoints.

use std::time::Duration;

pub const PEER_CAPTURE_SAMPLE_RATE: u32 = 24_000;
pub const PEER_PLAYBACK_SAMPLE_RATE: u32 = 24_000;
pub const DUPLEX_INPUT_SAMPLE_RATE: u32 = 16_000;
pub const DUPLEX_OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const DUPLEX_FRAME_SAMPLES: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub peer: PeerSettings,
    pub duplex: DuplexSettings,
    pub visualization: VisualizationSettings,
    /// Instruction sent by `start_conversation`. Caller context is appended to it.
    pub opening_prompt: String,
}

#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// SDP exchange endpoint; the model is appended as `?model=`.
    pub sdp_url: String,
    pub model: String,
    pub voice: String,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub transcription_model: String,
    pub transcription_language: Option<String>,
    pub turn_detection: TurnDetection,
    pub control_channel_label: String,
    pub connect_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            sdp_url: "https://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            capture_sample_rate: PEER_CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PEER_PLAYBACK_SAMPLE_RATE,
            transcription_model: "whisper-1".to_string(),
            transcription_language: None,
            turn_detection: TurnDetection::default(),
            control_channel_label: "oai-events".to_string(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Server-side voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetection {
    pub threshold: f32,
    pub prefix_padding: Duration,
    pub silence_duration: Duration,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding: Duration::from_millis(300),
            silence_duration: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplexSettings {
    /// Socket endpoint; the credential is appended as `?key=`.
    pub socket_url: String,
    pub model: String,
    pub voice: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per outbound `realtimeInput` frame.
    pub frame_samples: usize,
    pub connect_timeout: Duration,
}

impl Default for DuplexSettings {
    fn default() -> Self {
        Self {
            socket_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: "Puck".to_string(),
            input_sample_rate: DUPLEX_INPUT_SAMPLE_RATE,
            output_sample_rate: DUPLEX_OUTPUT_SAMPLE_RATE,
            frame_samples: DUPLEX_FRAME_SAMPLES,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl DuplexSettings {
    pub fn input_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.input_sample_rate)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VisualizationSettings {
    pub points: usize,
    pub refresh_interval: Duration,
}

impl Default for VisualizationSettings {
    fn default() -> Self {
        Self {
            points: 64,
            refresh_interval: Duration::from_millis(50),
        }
    }
}
