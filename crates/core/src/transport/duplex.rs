//! Duplex socket transport: one WebSocket carrying JSON control frames and
//! base64 PCM audio in both directions.

use super::{InterruptOutcome, TransportAdapter, TransportLink, until_aborted};
use crate::audio::capture::{CaptureSource, PcmFramer};
use crate::audio::devices::{AudioOutput, CaptureConstraints, OutputHandle};
use crate::audio::pcm::{StreamResampler, encode_i16};
use crate::audio::playback::{PlaybackGraph, PlaybackQueue, SequentialPlayer};
use crate::audio::visualizer::{Analyser, AnalyserHandle, WaveformSources};
use crate::config::DuplexSettings;
use crate::descriptor::{ProviderKind, SessionDescriptor};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{CanonicalEvent, EventSink};
use crate::registry::{Release, ReleaseError, ResourceKind, Tracked};
use crate::translate::{DuplexTranslator, EventTranslator};
use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use realtime_types::gemini::{
    AudioTranscriptionConfig, Blob, ClientContent, ClientMessage, Content, GenerationConfig,
    RealtimeInput, ResponseModality, Setup, SpeechConfig,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

type SocketReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Close code the provider uses for a rejected setup frame.
const CLOSE_INVALID_PAYLOAD: u16 = 1007;

/// Owns the write half of the socket. Releasing it sends a close frame.
struct SocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
}

impl Release for SocketHandle {
    fn release(self) -> Result<(), ReleaseError> {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        }));
        // A closed channel means the writer already exited with the socket.
        let _ = self.outbound.send(close);
        Ok(())
    }
}

pub struct DuplexTransport {
    settings: DuplexSettings,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    sources: Mutex<Option<WaveformSources>>,
    queue: Mutex<Option<Arc<PlaybackQueue>>>,
}

impl DuplexTransport {
    pub fn new(settings: DuplexSettings) -> Self {
        Self {
            settings,
            outbound: Mutex::new(None),
            sources: Mutex::new(None),
            queue: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn playback_queue(&self) -> Option<Arc<PlaybackQueue>> {
        self.queue.lock().clone()
    }

    fn setup_frame(&self, descriptor: &SessionDescriptor) -> ClientMessage {
        let s = &self.settings;
        ClientMessage::Setup(Setup {
            model: descriptor.model.clone().unwrap_or_else(|| s.model.clone()),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig::prebuilt(
                    descriptor.voice.clone().unwrap_or_else(|| s.voice.clone()),
                )),
            },
            system_instruction: descriptor
                .instructions
                .as_deref()
                .map(|text| Content::text(None, text)),
            input_audio_transcription: Some(AudioTranscriptionConfig {}),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        })
    }

    fn send(&self, message: &ClientMessage) -> VoiceResult<()> {
        let payload = serde_json::to_string(message)?;
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(VoiceError::NotConnected)?;
        tx.send(Message::Text(payload.into()))
            .map_err(|_| VoiceError::TransportClosed("socket writer has stopped".to_string()))
    }

    fn send_user_turn(&self, text: &str) -> VoiceResult<()> {
        self.send(&ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::text(Some("user"), text)],
            turn_complete: true,
        }))
    }
}

#[async_trait]
impl TransportAdapter for DuplexTransport {
    fn provider(&self) -> ProviderKind {
        ProviderKind::DuplexSocket
    }

    async fn connect(&self, link: TransportLink) -> VoiceResult<()> {
        let TransportLink {
            descriptor,
            registry,
            abort,
            events,
            devices,
        } = link;
        let s = &self.settings;

        let mic = until_aborted(
            &abort,
            devices.open_microphone(CaptureConstraints::mono(s.input_sample_rate)),
        )
        .await??;
        let mut capture = CaptureSource::start(mic, &registry, &abort)?;

        let output = until_aborted(&abort, devices.open_output(s.output_sample_rate)).await??;
        registry.admit(
            &abort,
            Tracked::new(ResourceKind::OutputElement, OutputHandle(output.clone())),
        )?;

        let url = Url::parse_with_params(&s.socket_url, &[("key", descriptor.credential())])
            .map_err(|e| VoiceError::NegotiationFailed(format!("invalid socket url: {e}")))?;
        let (stream, _) = until_aborted(&abort, connect_async(url.as_str())).await??;
        info!("Connected to duplex socket");

        let (mut sink, mut reader) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "Socket writer stopped");
                    return;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        registry.admit(
            &abort,
            Tracked::new(
                ResourceKind::Socket,
                SocketHandle {
                    outbound: outbound.clone(),
                },
            ),
        )?;

        let setup = serde_json::to_string(&self.setup_frame(&descriptor))?;
        outbound
            .send(Message::Text(setup.into()))
            .map_err(|_| VoiceError::TransportClosed("socket writer has stopped".to_string()))?;

        let mut translator = DuplexTranslator::new();
        match until_aborted(
            &abort,
            tokio::time::timeout(s.connect_timeout, await_setup(&mut reader, &mut translator)),
        )
        .await?
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(VoiceError::TransportClosed(
                    "timed out waiting for setupComplete".to_string(),
                ));
            }
        }
        debug!("Duplex setup acknowledged");

        let queue = Arc::new(PlaybackQueue::new());
        let playback_tap = Arc::new(Analyser::default());
        registry.admit(
            &abort,
            Tracked::new(ResourceKind::AnalyserTap, AnalyserHandle(playback_tap.clone())),
        )?;
        let player = SequentialPlayer::spawn(queue.clone(), output.clone(), playback_tap.clone());
        registry.admit(
            &abort,
            Tracked::new(
                ResourceKind::PlaybackGraph,
                PlaybackGraph {
                    queue: queue.clone(),
                    player,
                },
            ),
        )?;

        let frames = capture.take_frames().ok_or_else(|| {
            VoiceError::UnsupportedEnvironment("capture frames already consumed".to_string())
        })?;
        let resampler = StreamResampler::new(capture.sample_rate(), s.input_sample_rate)?;
        let framer = tokio::spawn(stream_microphone(
            frames,
            resampler,
            PcmFramer::new(s.frame_samples),
            s.input_mime_type(),
            outbound.clone(),
        ));
        registry.admit(&abort, Tracked::new(ResourceKind::FrameProcessor, framer))?;

        *self.outbound.lock() = Some(outbound);
        *self.queue.lock() = Some(queue.clone());
        *self.sources.lock() = Some(WaveformSources {
            capture: capture.analyser(),
            playback: playback_tap,
        });

        let pump = tokio::spawn(read_socket(reader, translator, queue, output, events));
        registry.admit(&abort, Tracked::new(ResourceKind::EventPump, pump))?;
        Ok(())
    }

    fn start_conversation(&self, instruction: &str) -> VoiceResult<()> {
        self.send_user_turn(instruction)
    }

    fn send_message(&self, text: &str) -> VoiceResult<()> {
        self.send_user_turn(text)
    }

    fn interrupt(&self) -> VoiceResult<InterruptOutcome> {
        // The provider interrupts on detected speech only.
        debug!("Duplex socket has no cancel message");
        Ok(InterruptOutcome::Unsupported)
    }

    fn cancel_current_turn(&self) {}

    fn waveform_sources(&self) -> Option<WaveformSources> {
        self.sources.lock().clone()
    }
}

fn close_error(frame: Option<CloseFrame>) -> VoiceError {
    match frame {
        Some(frame) if u16::from(frame.code) == CLOSE_INVALID_PAYLOAD => {
            VoiceError::ProtocolError(format!("setup rejected: {}", frame.reason))
        }
        Some(frame) => VoiceError::TransportClosed(format!(
            "socket closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        )),
        None => VoiceError::TransportClosed("socket closed".to_string()),
    }
}

fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => match std::str::from_utf8(data) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(error = %e, "Dropping non-UTF-8 binary frame");
                None
            }
        },
        _ => None,
    }
}

/// Reads until `setupComplete`. A close or error frame first is a connect failure.
async fn await_setup(
    reader: &mut SocketReader,
    translator: &mut DuplexTranslator,
) -> VoiceResult<()> {
    while let Some(message) = reader.next().await {
        let message = message?;
        if let Message::Close(frame) = message {
            return Err(close_error(frame));
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        let mut ready = false;
        for event in translator.translate(text) {
            match event {
                CanonicalEvent::SessionReady => ready = true,
                CanonicalEvent::Failed(e) => return Err(e),
                _ => {}
            }
        }
        if ready {
            return Ok(());
        }
    }
    Err(VoiceError::TransportClosed(
        "socket closed during setup".to_string(),
    ))
}

fn send_audio_blocks(
    blocks: Vec<Vec<i16>>,
    mime_type: &str,
    outbound: &mpsc::UnboundedSender<Message>,
) -> bool {
    for block in blocks {
        let message = ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: mime_type.to_string(),
                data: encode_i16(&block),
            }],
        });
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode audio frame");
                continue;
            }
        };
        if outbound.send(Message::Text(payload.into())).is_err() {
            return false;
        }
    }
    true
}

async fn stream_microphone(
    mut frames: mpsc::Receiver<Vec<f32>>,
    mut resampler: StreamResampler,
    mut framer: PcmFramer,
    mime_type: String,
    outbound: mpsc::UnboundedSender<Message>,
) {
    while let Some(frame) = frames.recv().await {
        let blocks = framer.push(&resampler.process(&frame));
        if !send_audio_blocks(blocks, &mime_type, &outbound) {
            return;
        }
    }
    // Microphone ended on its own; push out what the resampler still holds.
    let tail = framer.push(&resampler.flush());
    send_audio_blocks(tail, &mime_type, &outbound);
    debug!("Microphone stream ended");
}

async fn read_socket(
    mut reader: SocketReader,
    mut translator: DuplexTranslator,
    queue: Arc<PlaybackQueue>,
    output: Arc<dyn AudioOutput>,
    events: EventSink,
) {
    while let Some(message) = reader.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                // Only a 1007 close is fatal; a dropped connection ends the session quietly.
                warn!(error = %e, "Socket dropped without a close handshake");
                events.emit(CanonicalEvent::Closed);
                return;
            }
        };
        if let Message::Close(frame) = message {
            match close_error(frame) {
                e @ VoiceError::ProtocolError(_) => {
                    error!(error = %e, "Provider closed the socket");
                    events.emit(CanonicalEvent::Failed(e));
                }
                e => {
                    info!(reason = %e, "Provider closed the socket");
                    events.emit(CanonicalEvent::Closed);
                }
            }
            return;
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        for event in translator.translate(text) {
            match event {
                CanonicalEvent::AiAudio(samples) => {
                    queue.push(samples);
                    events.emit(CanonicalEvent::AiSpeaking);
                }
                CanonicalEvent::Interrupted => {
                    let dropped = queue.clear();
                    output.stop();
                    debug!(dropped, "Playback cleared on interruption");
                    events.emit(CanonicalEvent::Interrupted);
                }
                other => events.emit(other),
            }
        }
    }
    info!("Socket stream ended");
    events.emit(CanonicalEvent::Closed);
}
