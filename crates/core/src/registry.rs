//! Resource Registry
//!
//! The ledger of every live native handle (peer sessions, sockets, capture
//! streams, audio graphs, output devices, background pumps) created by any
//! connection attempt. It is the only shared mutable store in the crate.
//!
//! Handles are registered the moment they are created, before any further
//! network I/O, and are released through [`ResourceRegistry::cleanup_all`] on
//! every teardown path. A released handle has its native value taken out of
//! its slot, so a second release finds nothing and does nothing.

use crate::error::{VoiceError, VoiceResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static GLOBAL: LazyLock<ResourceRegistry> = LazyLock::new(ResourceRegistry::new);

/// Unique, monotonically increasing handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// WebRTC peer connection plus its control channel.
    PeerSession,
    /// Duplex WebSocket.
    Socket,
    /// Microphone device stream.
    CaptureStream,
    /// Task fanning captured audio out to the transport and the analyser.
    CaptureGraph,
    /// Visualization tap on a capture or playback signal.
    AnalyserTap,
    /// Sequential player draining the playback queue.
    PlaybackGraph,
    /// Speaker output device.
    OutputElement,
    /// Task turning captured audio into outbound frames.
    FrameProcessor,
    /// Task reading inbound provider events.
    EventPump,
    /// Periodic visualization sampler.
    Sampler,
}

impl ResourceKind {
    pub fn is_transport(self) -> bool {
        matches!(self, ResourceKind::PeerSession | ResourceKind::Socket)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::PeerSession => "peer_session",
            ResourceKind::Socket => "socket",
            ResourceKind::CaptureStream => "capture_stream",
            ResourceKind::CaptureGraph => "capture_graph",
            ResourceKind::AnalyserTap => "analyser_tap",
            ResourceKind::PlaybackGraph => "playback_graph",
            ResourceKind::OutputElement => "output_element",
            ResourceKind::FrameProcessor => "frame_processor",
            ResourceKind::EventPump => "event_pump",
            ResourceKind::Sampler => "sampler",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ReleaseError(pub String);

impl From<String> for ReleaseError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<&str> for ReleaseError {
    fn from(reason: &str) -> Self {
        Self(reason.to_owned())
    }
}

/// A native value that must be released explicitly rather than on drop.
pub trait Release: Send + 'static {
    fn release(self) -> Result<(), ReleaseError>;
}

impl Release for JoinHandle<()> {
    fn release(self) -> Result<(), ReleaseError> {
        self.abort();
        Ok(())
    }
}

/// Object-safe view of a registered handle.
pub trait NativeHandle: Send + Sync {
    fn id(&self) -> ResourceId;
    fn kind(&self) -> ResourceKind;
    /// Releases the native value. Every call after the first is a no-op.
    fn release(&self) -> Result<(), ReleaseError>;
    fn is_released(&self) -> bool;
}

/// Slot holding a native value until it is released.
pub struct Tracked<T: Release> {
    id: ResourceId,
    kind: ResourceKind,
    slot: Mutex<Option<T>>,
}

impl<T: Release> Tracked<T> {
    pub fn new(kind: ResourceKind, value: T) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            kind,
            slot: Mutex::new(Some(value)),
        })
    }
}

impl<T: Release> NativeHandle for Tracked<T> {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn release(&self) -> Result<(), ReleaseError> {
        // Empty the slot before releasing so a re-entrant call sees nothing.
        let value = self.slot.lock().take();
        match value {
            Some(value) => value.release(),
            None => Ok(()),
        }
    }

    fn is_released(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Ledger of live native handles.
///
/// Cloning yields another view of the same ledger. [`ResourceRegistry::global`]
/// is the process-scoped instance used by default; tests and embedders may
/// hand a private instance to a session instead.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    ledger: Arc<Mutex<BTreeMap<ResourceId, Arc<dyn NativeHandle>>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> ResourceRegistry {
        GLOBAL.clone()
    }

    /// Records `handle` unless `abort` has tripped, in which case the handle
    /// is released on the spot and `Aborted` is returned. Admitting the same
    /// handle twice is a no-op.
    ///
    /// The token is checked under the ledger lock. Teardown trips the token
    /// before it drains the ledger, so nothing admitted here can outlive a
    /// concurrent cleanup.
    pub fn admit(
        &self,
        abort: &CancellationToken,
        handle: Arc<dyn NativeHandle>,
    ) -> VoiceResult<ResourceId> {
        {
            let mut ledger = self.ledger.lock();
            if !abort.is_cancelled() {
                let id = handle.id();
                if ledger.contains_key(&id) {
                    return Ok(id);
                }
                if handle.kind().is_transport()
                    && ledger.values().any(|h| h.kind().is_transport())
                {
                    warn!(resource = %id, "Registering a transport while another is still live");
                }
                debug!(resource = %id, kind = %handle.kind(), "Registered native resource");
                ledger.insert(id, handle);
                return Ok(id);
            }
        }
        debug!(resource = %handle.id(), kind = %handle.kind(), "Attempt aborted; releasing fresh resource");
        release_logged(handle.as_ref());
        Err(VoiceError::Aborted)
    }

    /// Releases every registered handle exactly once, newest first.
    ///
    /// Individual failures are logged and never stop the sweep. Safe to call
    /// repeatedly; with nothing registered it does nothing. Returns the number
    /// of handles that were drained.
    pub fn cleanup_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.ledger.lock());
        let count = drained.len();
        for handle in drained.into_values().rev() {
            release_logged(handle.as_ref());
        }
        if count > 0 {
            debug!(count, "Released native resources");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.lock().is_empty()
    }

    pub fn count_kind(&self, kind: ResourceKind) -> usize {
        self.ledger.lock().values().filter(|h| h.kind() == kind).count()
    }
}

fn release_logged(handle: &dyn NativeHandle) {
    if let Err(e) = handle.release() {
        warn!(resource = %handle.id(), kind = %handle.kind(), error = %e, "Failed to release native resource");
    }
}
