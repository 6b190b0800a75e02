//! In-process fakes for audio devices, the peer media engine, the duplex
//! socket endpoint and negotiation.

use crate::audio::devices::{
    AudioDevices, AudioOutput, CaptureConstraints, DeviceStream, MicrophoneStream,
};
use crate::descriptor::SessionDescriptor;
use crate::error::{VoiceError, VoiceResult};
use crate::negotiator::SessionNegotiator;
use crate::registry::{ReleaseError, ResourceKind, ResourceRegistry};
use crate::transport::{ControlChannel, ControlFrame, PeerConnector, PeerSession};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// --- Audio devices ---

#[derive(Clone, Default)]
pub struct StopProbe(Arc<AtomicBool>);

impl StopProbe {
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FakeDeviceStream(StopProbe);

impl FakeDeviceStream {
    pub fn new() -> (Self, StopProbe) {
        let probe = StopProbe::default();
        (Self(probe.clone()), probe)
    }
}

impl DeviceStream for FakeDeviceStream {
    fn stop(self: Box<Self>) -> Result<(), ReleaseError> {
        self.0.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Output that records what it was asked to play. In manual mode a buffer
/// keeps "playing" until [`FakeOutput::finish_current`] or `stop`.
pub struct FakeOutput {
    sample_rate: u32,
    auto_finish: bool,
    started: Mutex<Vec<Vec<f32>>>,
    written: Mutex<Vec<f32>>,
    current: Mutex<Option<oneshot::Sender<()>>>,
    stops: AtomicUsize,
    closed: AtomicBool,
}

impl FakeOutput {
    fn build(sample_rate: u32, auto_finish: bool) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            auto_finish,
            started: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            stops: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn auto(sample_rate: u32) -> Arc<Self> {
        Self::build(sample_rate, true)
    }

    pub fn manual(sample_rate: u32) -> Arc<Self> {
        Self::build(sample_rate, false)
    }

    pub fn started(&self) -> Vec<Vec<f32>> {
        self.started.lock().clone()
    }

    pub fn written(&self) -> Vec<f32> {
        self.written.lock().clone()
    }

    pub fn finish_current(&self) {
        if let Some(done) = self.current.lock().take() {
            let _ = done.send(());
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AudioOutput for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&self, samples: &[f32]) {
        self.written.lock().extend_from_slice(samples);
    }

    fn play(&self, samples: Vec<f32>) -> oneshot::Receiver<()> {
        self.started.lock().push(samples);
        let (done, rx) = oneshot::channel();
        if self.auto_finish {
            let _ = done.send(());
        } else {
            *self.current.lock() = Some(done);
        }
        rx
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.current.lock().take();
    }

    fn close(&self) -> Result<(), ReleaseError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeDevices {
    deny: Option<VoiceError>,
    output: Arc<FakeOutput>,
    requests: Mutex<Vec<CaptureConstraints>>,
    microphones: Mutex<Vec<(mpsc::Sender<Vec<f32>>, StopProbe)>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Self::with_output(FakeOutput::auto(24_000))
    }

    pub fn with_output(output: Arc<FakeOutput>) -> Arc<Self> {
        Arc::new(Self {
            deny: None,
            output,
            requests: Mutex::new(Vec::new()),
            microphones: Mutex::new(Vec::new()),
        })
    }

    pub fn denying(err: VoiceError) -> Arc<Self> {
        Arc::new(Self {
            deny: Some(err),
            output: FakeOutput::auto(24_000),
            requests: Mutex::new(Vec::new()),
            microphones: Mutex::new(Vec::new()),
        })
    }

    pub fn output(&self) -> Arc<FakeOutput> {
        self.output.clone()
    }

    pub fn mic_requests(&self) -> Vec<CaptureConstraints> {
        self.requests.lock().clone()
    }

    /// Feeds a frame into the most recently opened microphone.
    pub async fn send_microphone(&self, frame: Vec<f32>) {
        let tx = self.microphones.lock().last().map(|(tx, _)| tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(frame).await;
        }
    }

    pub fn all_microphones_stopped(&self) -> bool {
        self.microphones.lock().iter().all(|(_, probe)| probe.is_stopped())
    }
}

#[async_trait]
impl AudioDevices for FakeDevices {
    async fn open_microphone(&self, constraints: CaptureConstraints) -> VoiceResult<MicrophoneStream> {
        self.requests.lock().push(constraints);
        if let Some(err) = &self.deny {
            return Err(err.clone());
        }
        let (tx, frames) = mpsc::channel(32);
        let (device, probe) = FakeDeviceStream::new();
        self.microphones.lock().push((tx, probe));
        Ok(MicrophoneStream {
            sample_rate: constraints.sample_rate,
            frames,
            device: Box::new(device),
        })
    }

    async fn open_output(&self, _sample_rate: u32) -> VoiceResult<Arc<dyn AudioOutput>> {
        Ok(self.output.clone())
    }
}

// --- Peer media engine ---

pub struct FakePeerSession {
    inbound_tx: mpsc::UnboundedSender<ControlFrame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlFrame>>>,
    sent: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    answer: Mutex<Option<String>>,
    remote_output: Mutex<Option<Arc<dyn AudioOutput>>>,
    closed: AtomicBool,
}

impl FakePeerSession {
    fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            sent: tokio::sync::Mutex::new(None),
            answer: Mutex::new(None),
            remote_output: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Injects a frame as if it arrived on the control channel.
    pub fn deliver(&self, frame: ControlFrame) {
        let _ = self.inbound_tx.send(frame);
    }

    /// Next message the client wrote to the control channel.
    pub async fn next_sent(&self) -> Option<String> {
        let mut sent = self.sent.lock().await;
        let rx = sent.as_mut()?;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn accepted_answer(&self) -> Option<String> {
        self.answer.lock().clone()
    }

    /// Writes audio as if it arrived on the remote track.
    pub fn play_remote(&self, samples: &[f32]) {
        if let Some(output) = self.remote_output.lock().clone() {
            output.write(samples);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for FakePeerSession {
    async fn add_audio_track(
        &self,
        mut frames: mpsc::Receiver<Vec<f32>>,
        _sample_rate: u32,
    ) -> VoiceResult<()> {
        tokio::spawn(async move { while frames.recv().await.is_some() {} });
        Ok(())
    }

    fn route_remote_audio(&self, output: Arc<dyn AudioOutput>) {
        *self.remote_output.lock() = Some(output);
    }

    async fn open_control_channel(&self, _label: &str) -> VoiceResult<ControlChannel> {
        let inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| VoiceError::ProtocolError("control channel already opened".into()))?;
        let (outbound, sent) = mpsc::unbounded_channel();
        *self.sent.lock().await = Some(sent);
        let (open_tx, opened) = oneshot::channel();
        let _ = open_tx.send(());
        Ok(ControlChannel {
            opened,
            inbound,
            outbound,
        })
    }

    async fn create_offer(&self) -> VoiceResult<String> {
        Ok("v=0 offer".to_string())
    }

    async fn accept_answer(&self, sdp: String) -> VoiceResult<()> {
        *self.answer.lock() = Some(sdp);
        Ok(())
    }

    fn close(&self) -> Result<(), ReleaseError> {
        self.closed.store(true, Ordering::SeqCst);
        self.remote_output.lock().take();
        Ok(())
    }
}

/// Hands out [`FakePeerSession`]s and, when given a registry, records how
/// many transports were live each time a new session was created.
#[derive(Default)]
pub struct FakePeerConnector {
    sessions: Mutex<Vec<Arc<FakePeerSession>>>,
    probe: Mutex<Option<ResourceRegistry>>,
    live_at_create: Mutex<Vec<usize>>,
}

impl FakePeerConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observe(&self, registry: &ResourceRegistry) {
        *self.probe.lock() = Some(registry.clone());
    }

    pub fn last_session(&self) -> Option<Arc<FakePeerSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<FakePeerSession>> {
        self.sessions.lock().clone()
    }

    pub fn transports_live_at_create(&self) -> Vec<usize> {
        self.live_at_create.lock().clone()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create_session(&self) -> VoiceResult<Arc<dyn PeerSession>> {
        if let Some(registry) = self.probe.lock().as_ref() {
            let live = registry.count_kind(ResourceKind::PeerSession)
                + registry.count_kind(ResourceKind::Socket);
            self.live_at_create.lock().push(live);
        }
        let session = FakePeerSession::new();
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

// --- Negotiation ---

/// Negotiator that blocks until [`GatedNegotiator::open`] is called.
pub struct GatedNegotiator {
    gate: Notify,
    entered: Notify,
    descriptor: Box<dyn Fn() -> SessionDescriptor + Send + Sync>,
}

impl GatedNegotiator {
    pub fn new(descriptor: impl Fn() -> SessionDescriptor + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            gate: Notify::new(),
            entered: Notify::new(),
            descriptor: Box::new(descriptor),
        })
    }

    /// Resolves once a `negotiate()` call is waiting at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl SessionNegotiator for GatedNegotiator {
    async fn negotiate(&self) -> VoiceResult<SessionDescriptor> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok((self.descriptor)())
    }
}

// --- Duplex socket endpoint ---

enum SetupReply {
    Frame(String),
    Reject(u16, String),
}

enum ServerAction {
    Text(String),
    Close(u16, String),
}

/// Local WebSocket endpoint accepting one client and following a script.
pub struct ScriptedSocket {
    url: String,
    setup: Arc<Mutex<Option<SetupReply>>>,
    query: Arc<Mutex<Option<String>>>,
    received: mpsc::UnboundedReceiver<String>,
    actions: mpsc::UnboundedSender<ServerAction>,
    client_closed: Arc<AtomicBool>,
}

impl ScriptedSocket {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/live", listener.local_addr().unwrap());
        let setup: Arc<Mutex<Option<SetupReply>>> = Arc::default();
        let query: Arc<Mutex<Option<String>>> = Arc::default();
        let client_closed = Arc::new(AtomicBool::new(false));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (actions, mut actions_rx) = mpsc::unbounded_channel();

        let (setup_cfg, query_slot, closed_flag) = (setup.clone(), query.clone(), client_closed.clone());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let capture_query = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *query_slot.lock() = request.uri().query().map(str::to_owned);
                Ok(response)
            };
            let ws = tokio_tungstenite::accept_hdr_async(stream, capture_query).await.unwrap();
            let (mut write, mut read) = ws.split();

            if let Some(Ok(Message::Text(first))) = read.next().await {
                let _ = received_tx.send(first.as_str().to_owned());
            }
            let reply = setup_cfg.lock().take();
            match reply.unwrap_or(SetupReply::Frame(r#"{"setupComplete":{}}"#.to_string())) {
                SetupReply::Frame(text) => {
                    let _ = write.send(Message::Text(text.into())).await;
                }
                SetupReply::Reject(code, reason) => {
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                }
            }

            loop {
                tokio::select! {
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let _ = received_tx.send(text.as_str().to_owned());
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            closed_flag.store(true, Ordering::SeqCst);
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                    action = actions_rx.recv() => match action {
                        Some(ServerAction::Text(text)) => {
                            let _ = write.send(Message::Text(text.into())).await;
                        }
                        Some(ServerAction::Close(code, reason)) => {
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: reason.into(),
                                })))
                                .await;
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            url,
            setup,
            query,
            received,
            actions,
            client_closed,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn query(&self) -> String {
        self.query.lock().clone().unwrap_or_default()
    }

    pub fn reply_to_setup(&self, frame: &str) {
        *self.setup.lock() = Some(SetupReply::Frame(frame.to_string()));
    }

    pub fn reject_setup(&self, code: u16, reason: &str) {
        *self.setup.lock() = Some(SetupReply::Reject(code, reason.to_string()));
    }

    pub async fn next_received(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.actions.send(ServerAction::Text(text.to_string()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.actions.send(ServerAction::Close(code, reason.to_string()));
    }

    pub async fn wait_for_client_close(&self) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if self.client_closed.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}
