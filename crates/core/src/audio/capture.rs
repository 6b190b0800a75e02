use super::devices::MicrophoneStream;
use super::pcm::convert_f32_to_i16;
use super::visualizer::{Analyser, AnalyserHandle};
use crate::error::VoiceResult;
use crate::registry::{ResourceKind, ResourceRegistry, Tracked};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CAPTURE_CHANNEL_DEPTH: usize = 64;

/// Microphone audio fanned out to a transport and an analyser tap.
///
/// Every native piece (device stream, analyser tap, fan-out task) is admitted
/// to the registry as it is created.
pub struct CaptureSource {
    sample_rate: u32,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    analyser: Arc<Analyser>,
}

impl CaptureSource {
    pub fn start(
        mic: MicrophoneStream,
        registry: &ResourceRegistry,
        abort: &CancellationToken,
    ) -> VoiceResult<Self> {
        let MicrophoneStream {
            sample_rate,
            frames: mut device_frames,
            device,
        } = mic;
        registry.admit(abort, Tracked::new(ResourceKind::CaptureStream, device))?;

        let analyser = Arc::new(Analyser::default());
        registry.admit(
            abort,
            Tracked::new(ResourceKind::AnalyserTap, AnalyserHandle(analyser.clone())),
        )?;

        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_DEPTH);
        let tap = analyser.clone();
        let graph = tokio::spawn(async move {
            while let Some(frame) = device_frames.recv().await {
                tap.push(&frame);
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("Capture graph finished");
        });
        registry.admit(abort, Tracked::new(ResourceKind::CaptureGraph, graph))?;

        Ok(Self {
            sample_rate,
            frames: Some(rx),
            analyser,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Hands the captured frames to their single consumer.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    pub fn analyser(&self) -> Arc<Analyser> {
        self.analyser.clone()
    }
}

/// Cuts a continuous signal into fixed-size PCM16 blocks.
pub struct PcmFramer {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl PcmFramer {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Returns every block completed by `samples`; the remainder is kept.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_samples * self.frame_samples;
        self.pending
            .drain(..complete)
            .collect::<Vec<_>>()
            .chunks_exact(self.frame_samples)
            .map(convert_f32_to_i16)
            .collect()
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDeviceStream;

    #[test]
    fn framer_emits_fixed_blocks_and_keeps_remainder() {
        let mut framer = PcmFramer::new(4);
        assert!(framer.push(&[0.0; 3]).is_empty());
        let blocks = framer.push(&[0.5; 6]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 4));
        assert_eq!(blocks[0][0], 0);
        assert_eq!(blocks[1][3], (0.5 * i16::MAX as f32) as i16);
        assert_eq!(framer.buffered(), 1);
    }

    #[tokio::test]
    async fn capture_registers_every_piece_and_taps_signal() {
        let registry = ResourceRegistry::new();
        let abort = CancellationToken::new();
        let (device_tx, device_rx) = mpsc::channel(4);
        let (device, stopped) = FakeDeviceStream::new();
        let mic = MicrophoneStream {
            sample_rate: 16_000,
            frames: device_rx,
            device: Box::new(device),
        };

        let mut capture = CaptureSource::start(mic, &registry, &abort).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.count_kind(ResourceKind::CaptureStream), 1);

        let mut frames = capture.take_frames().unwrap();
        device_tx.send(vec![0.25, -0.25]).await.unwrap();
        assert_eq!(frames.recv().await.unwrap(), vec![0.25, -0.25]);
        assert_eq!(capture.analyser().snapshot(2), vec![0.25, -0.25]);

        registry.cleanup_all();
        assert!(stopped.is_stopped());
        assert!(capture.analyser().is_detached());
    }

    #[tokio::test]
    async fn aborted_capture_releases_the_device() {
        let registry = ResourceRegistry::new();
        let abort = CancellationToken::new();
        abort.cancel();
        let (_device_tx, device_rx) = mpsc::channel(4);
        let (device, stopped) = FakeDeviceStream::new();
        let mic = MicrophoneStream {
            sample_rate: 24_000,
            frames: device_rx,
            device: Box::new(device),
        };

        assert!(CaptureSource::start(mic, &registry, &abort).is_err());
        assert!(registry.is_empty());
        assert!(stopped.is_stopped());
    }
}
