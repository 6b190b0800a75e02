//! The connection manager: one state machine over whichever transport the
//! negotiated descriptor selects.

use crate::audio::devices::AudioDevices;
use crate::audio::visualizer::VisualizationSampler;
use crate::config::SessionConfig;
use crate::descriptor::ProviderKind;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{CanonicalEvent, EventSink};
use crate::negotiator::SessionNegotiator;
use crate::registry::{ResourceKind, ResourceRegistry, Tracked};
use crate::state::ConnectionState;
use crate::transport::{
    DuplexTransport, InterruptOutcome, PeerConnector, PeerTransport, RtcPeerConnector,
    TransportAdapter, TransportLink, until_aborted,
};
use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, field, info, info_span, warn};

type TranscriptFn = Box<dyn Fn(&str, bool) + Send + Sync>;
type TextFn = Box<dyn Fn(&str) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&VoiceError) + Send + Sync>;
type StateFn = Box<dyn Fn(ConnectionState) + Send + Sync>;
type WaveformFn = Box<dyn Fn(&[f32]) + Send + Sync>;

/// Caller callbacks. Each cell is read at call time, so replacing a callback
/// takes effect for the very next event.
#[derive(Default)]
struct Callbacks {
    transcript: ArcSwapOption<TranscriptFn>,
    ai_response: ArcSwapOption<TextFn>,
    error: ArcSwapOption<ErrorFn>,
    state: ArcSwapOption<StateFn>,
    waveform: ArcSwapOption<WaveformFn>,
}

struct Core {
    state: ConnectionState,
    /// Bumped by every connect and disconnect; events tagged with an older
    /// value are dropped.
    attempt: u64,
    abort: CancellationToken,
    transport: Option<Arc<dyn TransportAdapter>>,
}

struct Inner {
    negotiator: Arc<dyn SessionNegotiator>,
    devices: Arc<dyn AudioDevices>,
    connector: Arc<dyn PeerConnector>,
    config: SessionConfig,
    registry: ResourceRegistry,
    callbacks: Callbacks,
    core: Mutex<Core>,
    /// Serializes `on_state_change` delivery. Reentrant so a callback may
    /// call back into the session.
    delivery: ReentrantMutex<()>,
    tearing_down: AtomicBool,
}

/// Builds a [`VoiceSession`].
pub struct VoiceSessionBuilder {
    negotiator: Arc<dyn SessionNegotiator>,
    devices: Arc<dyn AudioDevices>,
    config: SessionConfig,
    peer_connector: Option<Arc<dyn PeerConnector>>,
    registry: Option<ResourceRegistry>,
}

impl VoiceSessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the WebRTC engine used by the peer transport.
    pub fn peer_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.peer_connector = Some(connector);
        self
    }

    /// Uses a private ledger instead of [`ResourceRegistry::global`].
    pub fn registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> VoiceSession {
        let connector = self
            .peer_connector
            .unwrap_or_else(|| Arc::new(RtcPeerConnector::default()));
        VoiceSession {
            inner: Arc::new(Inner {
                negotiator: self.negotiator,
                devices: self.devices,
                connector,
                config: self.config,
                registry: self.registry.unwrap_or_else(ResourceRegistry::global),
                callbacks: Callbacks::default(),
                core: Mutex::new(Core {
                    state: ConnectionState::Idle,
                    attempt: 0,
                    abort: CancellationToken::new(),
                    transport: None,
                }),
                delivery: ReentrantMutex::new(()),
                tearing_down: AtomicBool::new(false),
            }),
        }
    }
}

/// A realtime voice connection to whichever provider the backend negotiates.
///
/// Clones share one session. Dropping the last clone disconnects.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl VoiceSession {
    pub fn builder(
        negotiator: Arc<dyn SessionNegotiator>,
        devices: Arc<dyn AudioDevices>,
    ) -> VoiceSessionBuilder {
        VoiceSessionBuilder {
            negotiator,
            devices,
            config: SessionConfig::default(),
            peer_connector: None,
            registry: None,
        }
    }

    pub fn on_transcript(&self, f: impl Fn(&str, bool) + Send + Sync + 'static) {
        let f: TranscriptFn = Box::new(f);
        self.inner.callbacks.transcript.store(Some(Arc::new(f)));
    }

    pub fn on_ai_response(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        let f: TextFn = Box::new(f);
        self.inner.callbacks.ai_response.store(Some(Arc::new(f)));
    }

    pub fn on_error(&self, f: impl Fn(&VoiceError) + Send + Sync + 'static) {
        let f: ErrorFn = Box::new(f);
        self.inner.callbacks.error.store(Some(Arc::new(f)));
    }

    pub fn on_state_change(&self, f: impl Fn(ConnectionState) + Send + Sync + 'static) {
        let f: StateFn = Box::new(f);
        self.inner.callbacks.state.store(Some(Arc::new(f)));
    }

    /// Receives each normalized visualization frame while connected.
    pub fn on_waveform(&self, f: impl Fn(&[f32]) + Send + Sync + 'static) {
        let f: WaveformFn = Box::new(f);
        self.inner.callbacks.waveform.store(Some(Arc::new(f)));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.inner.registry
    }

    /// Negotiates a descriptor and brings up the matching transport.
    ///
    /// Returns immediately if a connect is already in flight or a teardown is
    /// running. A live session is torn down before the new attempt starts.
    /// Failures are reported through `on_error` and returned; an attempt
    /// cancelled by `disconnect()` or a newer `connect()` returns `Aborted`
    /// without reporting.
    pub async fn connect(&self) -> VoiceResult<()> {
        let inner = &self.inner;
        if inner.tearing_down.load(Ordering::SeqCst) {
            debug!("Teardown in progress; ignoring connect");
            return Ok(());
        }
        let (attempt, abort, previous) = {
            let mut core = inner.core.lock();
            if core.state == ConnectionState::Connecting {
                debug!("Connect already in progress");
                return Ok(());
            }
            core.abort.cancel();
            core.abort = CancellationToken::new();
            core.attempt += 1;
            core.state = ConnectionState::Connecting;
            (core.attempt, core.abort.clone(), core.transport.take())
        };
        if let Some(previous) = previous {
            info!("Replacing the active transport");
            previous.cancel_current_turn();
        }
        inner.registry.cleanup_all();
        inner.notify_state(ConnectionState::Connecting);

        let span = info_span!("voice_session", attempt, provider = field::Empty);
        let outcome = inner
            .establish(attempt, &abort)
            .instrument(span)
            .await;

        let transport = match outcome {
            Ok(transport) => transport,
            Err(err) => {
                if err == VoiceError::Aborted || !inner.is_current(attempt) {
                    debug!("Connect attempt was superseded");
                    return Err(VoiceError::Aborted);
                }
                inner.fail(attempt, err.clone());
                return Err(err);
            }
        };

        let committed = {
            let mut core = inner.core.lock();
            if core.attempt == attempt && !abort.is_cancelled() {
                core.transport = Some(transport.clone());
                core.state = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if !committed {
            debug!("Connect attempt was superseded after the transport came up");
            return Err(VoiceError::Aborted);
        }
        inner.notify_state(ConnectionState::Connected);
        inner.start_sampler(transport.as_ref(), attempt, &abort);
        info!(provider = %transport.provider(), "Voice session connected");
        Ok(())
    }

    /// Tears everything down and settles in `Idle`. Never fails and is safe
    /// to call from any state, any number of times.
    pub fn disconnect(&self) {
        self.inner.teardown();
    }

    /// Sends the opening instruction, with `context` appended when given.
    pub fn start_conversation(&self, context: Option<&str>) -> VoiceResult<()> {
        let (attempt, transport) = self.inner.live_transport()?;
        let instruction = self.inner.opening_instruction(context);
        transport.start_conversation(&instruction)?;
        self.inner.advance(attempt, ConnectionState::Processing);
        Ok(())
    }

    /// Injects a typed user turn and asks for a response.
    pub fn send_message(&self, text: &str) -> VoiceResult<()> {
        let (attempt, transport) = self.inner.live_transport()?;
        transport.send_message(text)?;
        self.inner.advance(attempt, ConnectionState::Processing);
        Ok(())
    }

    /// Cancels the in-flight response, if any.
    pub fn interrupt(&self) -> VoiceResult<InterruptOutcome> {
        let (transport, active) = {
            let core = self.inner.core.lock();
            if !core.state.is_live() {
                return Err(VoiceError::NotConnected);
            }
            let active = matches!(
                core.state,
                ConnectionState::Processing | ConnectionState::Speaking
            );
            (core.transport.clone().ok_or(VoiceError::NotConnected)?, active)
        };
        if !active {
            return Ok(InterruptOutcome::NothingToCancel);
        }
        let outcome = transport.interrupt()?;
        if outcome == InterruptOutcome::Unsupported {
            debug!(provider = %transport.provider(), "Provider has no native cancel");
        }
        Ok(outcome)
    }
}

impl Inner {
    async fn establish(
        self: &Arc<Self>,
        attempt: u64,
        abort: &CancellationToken,
    ) -> VoiceResult<Arc<dyn TransportAdapter>> {
        let descriptor = until_aborted(abort, self.negotiator.negotiate()).await??;
        if descriptor.is_expired_at(Utc::now()) {
            return Err(VoiceError::NegotiationFailed(
                "session descriptor has already expired".to_string(),
            ));
        }
        tracing::Span::current().record("provider", field::display(descriptor.provider));
        info!("Negotiated session descriptor");

        let transport: Arc<dyn TransportAdapter> = match descriptor.provider {
            ProviderKind::Peer => Arc::new(PeerTransport::new(
                self.config.peer.clone(),
                self.connector.clone(),
            )),
            ProviderKind::DuplexSocket => {
                Arc::new(DuplexTransport::new(self.config.duplex.clone()))
            }
        };
        let link = TransportLink {
            descriptor,
            registry: self.registry.clone(),
            abort: abort.clone(),
            events: self.event_sink(attempt),
            devices: self.devices.clone(),
        };
        transport.connect(link).await?;
        Ok(transport)
    }

    /// Events reach the session through a weak reference so transport tasks
    /// never keep it alive.
    fn event_sink(self: &Arc<Self>, attempt: u64) -> EventSink {
        let session = Arc::downgrade(self);
        EventSink::new(move |event| {
            if let Some(inner) = session.upgrade() {
                inner.handle_event(attempt, event);
            }
        })
    }

    fn start_sampler(
        self: &Arc<Self>,
        transport: &dyn TransportAdapter,
        attempt: u64,
        abort: &CancellationToken,
    ) {
        let Some(sources) = transport.waveform_sources() else {
            return;
        };
        let speaking: Weak<Inner> = Arc::downgrade(self);
        let emitting = speaking.clone();
        let sampler = VisualizationSampler::spawn(
            sources,
            self.config.visualization,
            abort.clone(),
            move || {
                speaking
                    .upgrade()
                    .is_some_and(|inner| inner.core.lock().state == ConnectionState::Speaking)
            },
            move |points| {
                let Some(inner) = emitting.upgrade() else {
                    return;
                };
                if !inner.is_current(attempt) {
                    return;
                }
                if let Some(cb) = inner.callbacks.waveform.load_full() {
                    (*cb)(&points);
                }
            },
        );
        if let Err(e) = self
            .registry
            .admit(abort, Tracked::new(ResourceKind::Sampler, sampler))
        {
            debug!(error = %e, "Visualization sampler not started");
        }
    }

    fn handle_event(&self, attempt: u64, event: CanonicalEvent) {
        if !self.is_current(attempt) {
            debug!(?event, "Dropping event from a superseded attempt");
            return;
        }
        match event {
            CanonicalEvent::UserTranscript { text, is_final } => {
                if let Some(cb) = self.callbacks.transcript.load_full() {
                    (*cb)(&text, is_final);
                }
            }
            CanonicalEvent::AiResponse(text) => {
                if let Some(cb) = self.callbacks.ai_response.load_full() {
                    (*cb)(&text);
                }
            }
            CanonicalEvent::Failed(err) => self.fail(attempt, err),
            CanonicalEvent::Closed => self.remote_closed(attempt),
            CanonicalEvent::SessionReady => debug!("Provider acknowledged the session"),
            other => {
                let next = {
                    let mut core = self.core.lock();
                    if core.attempt != attempt {
                        return;
                    }
                    let next = core.state.on_event(&other);
                    if let Some(next) = next {
                        core.state = next;
                    }
                    next
                };
                if let Some(next) = next {
                    self.notify_state(next);
                }
            }
        }
    }

    /// Moves a live session to `next` unless the attempt changed meanwhile.
    fn advance(&self, attempt: u64, next: ConnectionState) {
        let changed = {
            let mut core = self.core.lock();
            if core.attempt != attempt || !core.state.is_live() || core.state == next {
                false
            } else {
                core.state = next;
                true
            }
        };
        if changed {
            self.notify_state(next);
        }
    }

    /// Unrecoverable fault: release everything, report once, settle in `Error`.
    fn fail(&self, attempt: u64, err: VoiceError) {
        let transport = {
            let mut core = self.core.lock();
            let active = core.state == ConnectionState::Connecting || core.state.is_live();
            if core.attempt != attempt || !active {
                return;
            }
            core.abort.cancel();
            core.state = ConnectionState::Error;
            core.transport.take()
        };
        drop(transport);
        let released = self.registry.cleanup_all();
        error!(kind = %err.kind(), error = %err, released, "Voice session failed");
        if err.is_reportable() {
            if let Some(cb) = self.callbacks.error.load_full() {
                (*cb)(&err);
            }
        }
        self.notify_state(ConnectionState::Error);
    }

    fn remote_closed(&self, attempt: u64) {
        let changed = {
            let mut core = self.core.lock();
            if core.attempt != attempt {
                return;
            }
            core.abort.cancel();
            core.transport.take();
            std::mem::replace(&mut core.state, ConnectionState::Idle) != ConnectionState::Idle
        };
        let released = self.registry.cleanup_all();
        info!(released, "Remote side closed the session");
        if changed {
            self.notify_state(ConnectionState::Idle);
        }
    }

    fn teardown(&self) {
        if self.tearing_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = {
            let mut core = self.core.lock();
            core.abort.cancel();
            core.attempt += 1;
            core.transport.take()
        };
        if let Some(transport) = transport {
            transport.cancel_current_turn();
        }
        let released = self.registry.cleanup_all();
        let changed = {
            let mut core = self.core.lock();
            std::mem::replace(&mut core.state, ConnectionState::Idle) != ConnectionState::Idle
        };
        self.tearing_down.store(false, Ordering::SeqCst);
        if changed {
            info!(released, "Voice session disconnected");
            self.notify_state(ConnectionState::Idle);
        }
    }

    fn live_transport(&self) -> VoiceResult<(u64, Arc<dyn TransportAdapter>)> {
        let core = self.core.lock();
        if !core.state.is_live() {
            return Err(VoiceError::NotConnected);
        }
        let transport = core.transport.clone().ok_or(VoiceError::NotConnected)?;
        Ok((core.attempt, transport))
    }

    fn opening_instruction(&self, context: Option<&str>) -> String {
        let prompt = self.config.opening_prompt.trim();
        match context.map(str::trim).filter(|c| !c.is_empty()) {
            Some(context) if prompt.is_empty() => format!("Context: {context}"),
            Some(context) => format!("{prompt}\n\nContext: {context}"),
            None => prompt.to_string(),
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.core.lock().attempt == attempt
    }

    /// Delivers `state` only if it is still current, so the last callback a
    /// caller sees always matches [`VoiceSession::state`].
    fn notify_state(&self, state: ConnectionState) {
        let _delivery = self.delivery.lock();
        if self.core.lock().state != state {
            debug!(%state, "Skipping superseded state notification");
            return;
        }
        debug!(%state, "State changed");
        if let Some(cb) = self.callbacks.state.load_full() {
            (*cb)(state);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.core.get_mut().state != ConnectionState::Idle || !self.registry.is_empty() {
            warn!("Voice session dropped while active; tearing down");
        }
        self.teardown();
    }
}
