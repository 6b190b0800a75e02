//! WebRTC media engine backing the peer transport.

use super::{ControlChannel, ControlFrame, PeerConnector, PeerSession};
use crate::audio::devices::AudioOutput;
use crate::audio::g711;
use crate::audio::pcm::StreamResampler;
use crate::error::{VoiceError, VoiceResult};
use crate::registry::ReleaseError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

const PCMU_CLOCK_RATE: u32 = 8000;
const PCMU_PAYLOAD_TYPE: u8 = 0;
/// 20 ms at 8 kHz.
const PACKET_SAMPLES: usize = 160;
const PACKET_DURATION: Duration = Duration::from_millis(20);

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_CLOCK_RATE,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn negotiation(e: webrtc::Error) -> VoiceError {
    VoiceError::NegotiationFailed(e.to_string())
}

/// Creates peer connections negotiating a single PCMU audio codec.
#[derive(Debug, Clone)]
pub struct RtcPeerConnector {
    ice_servers: Vec<String>,
}

impl RtcPeerConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for RtcPeerConnector {
    fn default() -> Self {
        Self::new(vec!["stun:stun.l.google.com:19302".to_string()])
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn create_session(&self) -> VoiceResult<Arc<dyn PeerSession>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: pcmu_capability(),
                    payload_type: PCMU_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| VoiceError::UnsupportedEnvironment(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| VoiceError::UnsupportedEnvironment(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(negotiation)?);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let failures = inbound_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "Peer connection state changed");
            if state == RTCPeerConnectionState::Failed {
                let _ = failures.send(ControlFrame::Failed("peer connection failed".to_string()));
            }
            Box::pin(async {})
        }));

        let session = Arc::new(RtcPeerSession {
            pc,
            remote_output: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        });
        session.watch_remote_tracks();
        Ok(session)
    }
}

struct RtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    remote_output: Arc<Mutex<Option<Arc<dyn AudioOutput>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    inbound_tx: mpsc::UnboundedSender<ControlFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlFrame>>>,
}

impl RtcPeerSession {
    fn watch_remote_tracks(&self) {
        let remote_output = self.remote_output.clone();
        let tasks = self.tasks.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let remote_output = remote_output.clone();
            let tasks = tasks.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                let Some(output) = remote_output.lock().clone() else {
                    warn!("Remote audio arrived before an output was routed");
                    return;
                };
                info!(codec = %track.codec().capability.mime_type, "Remote audio track received");
                tasks.lock().push(tokio::spawn(play_remote_track(track, output)));
            })
        }));
    }
}

async fn play_remote_track(track: Arc<TrackRemote>, output: Arc<dyn AudioOutput>) {
    let clock_rate = track.codec().capability.clock_rate;
    let mut resampler = match StreamResampler::new(clock_rate, output.sample_rate()) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!(error = %e, "Cannot play remote audio");
            return;
        }
    };
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let samples = resampler.process(&g711::decode_to_f32(&packet.payload));
                if !samples.is_empty() {
                    output.write(&samples);
                }
            }
            Err(e) => {
                debug!(error = %e, "Remote track ended");
                break;
            }
        }
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn add_audio_track(
        &self,
        mut frames: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
    ) -> VoiceResult<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_owned(),
            "voicelink".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;
        let mut resampler = StreamResampler::new(sample_rate, PCMU_CLOCK_RATE)?;

        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        let writer = tokio::spawn(async move {
            let mut pending: Vec<f32> = Vec::new();
            while let Some(frame) = frames.recv().await {
                pending.extend(resampler.process(&frame));
                while pending.len() >= PACKET_SAMPLES {
                    let packet: Vec<f32> = pending.drain(..PACKET_SAMPLES).collect();
                    let sample = Sample {
                        data: Bytes::from(g711::encode_f32(&packet)),
                        duration: PACKET_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        warn!(error = %e, "Failed to write outgoing audio");
                        return;
                    }
                }
            }
            debug!("Outgoing audio track finished");
        });
        self.tasks.lock().extend([rtcp, writer]);
        Ok(())
    }

    fn route_remote_audio(&self, output: Arc<dyn AudioOutput>) {
        *self.remote_output.lock() = Some(output);
    }

    async fn open_control_channel(&self, label: &str) -> VoiceResult<ControlChannel> {
        let inbound = self.inbound_rx.lock().take().ok_or_else(|| {
            VoiceError::ProtocolError("control channel already opened".to_string())
        })?;
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(negotiation)?;

        let (open_tx, opened) = oneshot::channel();
        let open_tx = Arc::new(Mutex::new(Some(open_tx)));
        dc.on_open(Box::new(move || {
            if let Some(tx) = open_tx.lock().take() {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        let messages = self.inbound_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = messages.send(ControlFrame::Text(text));
                }
                Err(e) => warn!(error = %e, "Dropping non-UTF-8 control message"),
            }
            Box::pin(async {})
        }));

        let closes = self.inbound_tx.clone();
        dc.on_close(Box::new(move || {
            let _ = closes.send(ControlFrame::Closed);
            Box::pin(async {})
        }));

        let errors = self.inbound_tx.clone();
        dc.on_error(Box::new(move |e| {
            let _ = errors.send(ControlFrame::Failed(e.to_string()));
            Box::pin(async {})
        }));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let writer_dc = dc.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = writer_dc.send_text(text).await {
                    warn!(error = %e, "Failed to write control message");
                    break;
                }
            }
        });
        self.tasks.lock().push(writer);

        Ok(ControlChannel {
            opened,
            inbound,
            outbound,
        })
    }

    async fn create_offer(&self) -> VoiceResult<String> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await.map_err(negotiation)?;
        let _ = gathered.recv().await;
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| VoiceError::NegotiationFailed("no local description".to_string()))
    }

    async fn accept_answer(&self, sdp: String) -> VoiceResult<()> {
        let answer = RTCSessionDescription::answer(sdp).map_err(negotiation)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation)
    }

    fn close(&self) -> Result<(), ReleaseError> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.remote_output.lock().take();
        let pc = self.pc.clone();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ReleaseError::from("no runtime available to close the peer connection"))?;
        runtime.spawn(async move {
            if let Err(e) = pc.close().await {
                warn!(error = %e, "Peer connection did not close cleanly");
            }
        });
        Ok(())
    }
}
