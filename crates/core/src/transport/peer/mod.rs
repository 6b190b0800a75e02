//! Peer transport: a WebRTC media session plus the `oai-events` data channel.
//!
//! The media engine sits behind [`PeerConnector`] / [`PeerSession`] so the
//! connect sequence can run against a scripted peer in tests.

mod rtc;

pub use rtc::RtcPeerConnector;

use super::{InterruptOutcome, TransportAdapter, TransportLink, until_aborted};
use crate::audio::capture::CaptureSource;
use crate::audio::devices::{AudioOutput, CaptureConstraints, OutputHandle};
use crate::audio::playback::TappedOutput;
use crate::audio::visualizer::{Analyser, AnalyserHandle, WaveformSources};
use crate::config::PeerSettings;
use crate::descriptor::{ProviderKind, SessionDescriptor};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{CanonicalEvent, EventSink};
use crate::registry::{Release, ReleaseError, ResourceKind, Tracked};
use crate::translate::{EventTranslator, PeerTranslator};
use async_trait::async_trait;
use parking_lot::Mutex;
use realtime_types::openai::{
    self, ClientEvent, ConversationItem, InputAudioTranscription, ResponseConfig,
};
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Frames surfaced by the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Text(String),
    Closed,
    Failed(String),
}

/// An opened-or-opening data channel.
pub struct ControlChannel {
    /// Resolves once the channel is open.
    pub opened: oneshot::Receiver<()>,
    pub inbound: mpsc::UnboundedReceiver<ControlFrame>,
    pub outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_session(&self) -> VoiceResult<Arc<dyn PeerSession>>;
}

/// One native peer connection.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Streams captured mono audio at `sample_rate` as the outgoing track.
    async fn add_audio_track(
        &self,
        frames: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
    ) -> VoiceResult<()>;

    /// Where decoded remote audio is written.
    fn route_remote_audio(&self, output: Arc<dyn AudioOutput>);

    async fn open_control_channel(&self, label: &str) -> VoiceResult<ControlChannel>;

    /// Local SDP offer with ICE candidates gathered.
    async fn create_offer(&self) -> VoiceResult<String>;

    async fn accept_answer(&self, sdp: String) -> VoiceResult<()>;

    fn close(&self) -> Result<(), ReleaseError>;
}

struct PeerSessionHandle(Arc<dyn PeerSession>);

impl Release for PeerSessionHandle {
    fn release(self) -> Result<(), ReleaseError> {
        self.0.close()
    }
}

pub struct PeerTransport {
    settings: PeerSettings,
    connector: Arc<dyn PeerConnector>,
    http: reqwest::Client,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sources: Mutex<Option<WaveformSources>>,
}

impl PeerTransport {
    pub fn new(settings: PeerSettings, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            settings,
            connector,
            http: reqwest::Client::new(),
            outbound: Mutex::new(None),
            sources: Mutex::new(None),
        }
    }

    fn model<'a>(&'a self, descriptor: &'a SessionDescriptor) -> &'a str {
        descriptor.model.as_deref().unwrap_or(&self.settings.model)
    }

    /// Trades the local offer for the remote answer in one HTTP round trip.
    async fn exchange_sdp(&self, descriptor: &SessionDescriptor, offer: String) -> VoiceResult<String> {
        let response = self
            .http
            .post(&self.settings.sdp_url)
            .query(&[("model", self.model(descriptor))])
            .bearer_auth(descriptor.credential())
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::NegotiationFailed(format!(
                "SDP exchange returned {status}: {body}"
            )));
        }
        Ok(response.text().await?)
    }

    fn session_update(&self, descriptor: &SessionDescriptor) -> ClientEvent {
        let s = &self.settings;
        ClientEvent::SessionUpdate {
            session: openai::SessionConfig {
                modalities: Some(vec!["audio".to_string(), "text".to_string()]),
                voice: Some(descriptor.voice.clone().unwrap_or_else(|| s.voice.clone())),
                instructions: descriptor.instructions.clone(),
                input_audio_transcription: Some(InputAudioTranscription {
                    model: s.transcription_model.clone(),
                    language: s.transcription_language.clone(),
                }),
                turn_detection: Some(openai::TurnDetection::ServerVad {
                    threshold: s.turn_detection.threshold,
                    prefix_padding_ms: s.turn_detection.prefix_padding.as_millis() as u32,
                    silence_duration_ms: s.turn_detection.silence_duration.as_millis() as u32,
                }),
            },
        }
    }

    fn send(&self, event: &ClientEvent) -> VoiceResult<()> {
        let payload = serde_json::to_string(event)?;
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(VoiceError::NotConnected)?;
        tx.send(payload)
            .map_err(|_| VoiceError::TransportClosed("control channel is closed".to_string()))
    }
}

#[async_trait]
impl TransportAdapter for PeerTransport {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Peer
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
            devices.open_microphone(CaptureConstraints::mono(s.capture_sample_rate)),
        )
        .await??;
        let mut capture = CaptureSource::start(mic, &registry, &abort)?;

        let output = until_aborted(&abort, devices.open_output(s.playback_sample_rate)).await??;
        registry.admit(
            &abort,
            Tracked::new(ResourceKind::OutputElement, OutputHandle(output.clone())),
        )?;

        let session = until_aborted(&abort, self.connector.create_session()).await??;
        registry.admit(
            &abort,
            Tracked::new(ResourceKind::PeerSession, PeerSessionHandle(session.clone())),
        )?;

        let playback_tap = Arc::new(Analyser::default());
        registry.admit(
            &abort,
            Tracked::new(ResourceKind::AnalyserTap, AnalyserHandle(playback_tap.clone())),
        )?;
        session.route_remote_audio(Arc::new(TappedOutput::new(output, playback_tap.clone())));

        let frames = capture.take_frames().ok_or_else(|| {
            VoiceError::UnsupportedEnvironment("capture frames already consumed".to_string())
        })?;
        until_aborted(&abort, session.add_audio_track(frames, capture.sample_rate())).await??;

        let channel =
            until_aborted(&abort, session.open_control_channel(&s.control_channel_label)).await??;
        let offer = until_aborted(&abort, session.create_offer()).await??;
        debug!(model = self.model(&descriptor), "Exchanging SDP offer");
        let answer = until_aborted(&abort, self.exchange_sdp(&descriptor, offer)).await??;
        until_aborted(&abort, session.accept_answer(answer)).await??;

        let ControlChannel {
            opened,
            inbound,
            outbound,
        } = channel;
        match until_aborted(&abort, tokio::time::timeout(s.connect_timeout, opened)).await? {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(VoiceError::TransportClosed(
                    "control channel closed before opening".to_string(),
                ));
            }
            Err(_) => {
                return Err(VoiceError::TransportClosed(
                    "timed out waiting for the control channel".to_string(),
                ));
            }
        }

        outbound
            .send(serde_json::to_string(&self.session_update(&descriptor))?)
            .map_err(|_| VoiceError::TransportClosed("control channel is closed".to_string()))?;
        *self.outbound.lock() = Some(outbound);
        *self.sources.lock() = Some(WaveformSources {
            capture: capture.analyser(),
            playback: playback_tap,
        });

        let pump = tokio::spawn(pump_control_channel(inbound, events));
        registry.admit(&abort, Tracked::new(ResourceKind::EventPump, pump))?;

        info!(label = %s.control_channel_label, "Peer transport connected");
        Ok(())
    }

    fn start_conversation(&self, instruction: &str) -> VoiceResult<()> {
        self.send(&ClientEvent::ResponseCreate {
            response: Some(ResponseConfig {
                modalities: Some(vec!["audio".to_string(), "text".to_string()]),
                instructions: Some(instruction.to_string()),
            }),
        })
    }

    fn send_message(&self, text: &str) -> VoiceResult<()> {
        self.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })?;
        self.send(&ClientEvent::ResponseCreate { response: None })
    }

    fn interrupt(&self) -> VoiceResult<InterruptOutcome> {
        self.send(&ClientEvent::ResponseCancel)?;
        Ok(InterruptOutcome::CancelSent)
    }

    fn cancel_current_turn(&self) {
        if let Err(e) = self.send(&ClientEvent::ResponseCancel) {
            debug!(error = %e, "Skipping turn cancel");
        }
    }

    fn waveform_sources(&self) -> Option<WaveformSources> {
        self.sources.lock().clone()
    }
}

async fn pump_control_channel(
    mut inbound: mpsc::UnboundedReceiver<ControlFrame>,
    events: EventSink,
) {
    let mut translator = PeerTranslator::new();
    while let Some(frame) = inbound.recv().await {
        match frame {
            ControlFrame::Text(text) => events.emit_all(translator.translate(&text)),
            ControlFrame::Closed => {
                warn!("Control channel closed by the remote side");
                events.emit(CanonicalEvent::Failed(VoiceError::TransportClosed(
                    "control channel closed".to_string(),
                )));
                return;
            }
            ControlFrame::Failed(reason) => {
                warn!(%reason, "Peer connection failed");
                events.emit(CanonicalEvent::Failed(VoiceError::TransportClosed(reason)));
                return;
            }
        }
    }
    debug!("Control channel pump finished");
}
