//! Platform audio seam. The library never talks to a sound card itself;
//! embedders hand it an [`AudioDevices`] implementation.

use crate::error::VoiceResult;
use crate::registry::{Release, ReleaseError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
}

impl CaptureConstraints {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            echo_cancellation: true,
        }
    }
}

/// The native side of an open microphone.
pub trait DeviceStream: Send + 'static {
    fn stop(self: Box<Self>) -> Result<(), ReleaseError>;
}

impl Release for Box<dyn DeviceStream> {
    fn release(self) -> Result<(), ReleaseError> {
        self.stop()
    }
}

/// An open microphone delivering mono f32 frames at `sample_rate`.
pub struct MicrophoneStream {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub device: Box<dyn DeviceStream>,
}

/// A speaker output at a fixed sample rate.
pub trait AudioOutput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Appends samples to the continuous output stream.
    fn write(&self, samples: &[f32]);

    /// Plays one buffer. The receiver resolves once it has been played out
    /// (or dropped by [`AudioOutput::stop`]).
    fn play(&self, samples: Vec<f32>) -> oneshot::Receiver<()>;

    /// Discards everything queued or playing.
    fn stop(&self);

    fn close(&self) -> Result<(), ReleaseError>;
}

/// Registry handle for an output device.
pub struct OutputHandle(pub Arc<dyn AudioOutput>);

impl Release for OutputHandle {
    fn release(self) -> Result<(), ReleaseError> {
        self.0.stop();
        self.0.close()
    }
}

#[async_trait]
pub trait AudioDevices: Send + Sync {
    /// Requests microphone access. A refused prompt is `PermissionDenied`;
    /// a missing device is `UnsupportedEnvironment`.
    async fn open_microphone(&self, constraints: CaptureConstraints) -> VoiceResult<MicrophoneStream>;

    async fn open_output(&self, sample_rate: u32) -> VoiceResult<Arc<dyn AudioOutput>>;
}
