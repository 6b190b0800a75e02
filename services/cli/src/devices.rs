//! `cpal`-backed speakers and microphone.
//!
//! `cpal::Stream` is not `Send`, so every stream lives on its own thread and
//! is dropped there when the handle is stopped.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleFormat, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use voicelink_core::VoiceError;
use voicelink_core::audio::devices::{
    AudioDevices, AudioOutput, CaptureConstraints, DeviceStream, MicrophoneStream,
};
use voicelink_core::audio::pcm::StreamResampler;
use voicelink_core::error::VoiceResult;
use voicelink_core::registry::ReleaseError;

const CAPTURE_CHANNEL_DEPTH: usize = 64;

fn build_error(err: BuildStreamError) -> VoiceError {
    match err {
        BuildStreamError::BackendSpecific { err } => VoiceError::PermissionDenied(err.to_string()),
        other => VoiceError::UnsupportedEnvironment(other.to_string()),
    }
}

/// A stream owned by a dedicated thread.
struct StreamThread {
    stop: Option<std::sync::mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `open` on a fresh thread and keeps the resulting stream playing
    /// until [`StreamThread::stop`].
    async fn spawn<T, F>(name: &str, open: F) -> VoiceResult<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce() -> VoiceResult<(cpal::Stream, T)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let opened = open().and_then(|(stream, info)| {
                    stream
                        .play()
                        .map_err(|e| VoiceError::UnsupportedEnvironment(e.to_string()))?;
                    Ok((stream, info))
                });
                match opened {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| VoiceError::UnsupportedEnvironment(e.to_string()))?;

        let info = ready_rx.await.map_err(|_| {
            VoiceError::UnsupportedEnvironment("audio thread exited during setup".to_string())
        })??;
        Ok((
            Self {
                stop: Some(stop_tx),
                join: Some(join),
            },
            info,
        ))
    }

    fn stop(&mut self) -> Result<(), ReleaseError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| ReleaseError::from("audio thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Audio thread did not stop cleanly");
        }
    }
}

struct CpalCapture(StreamThread);

impl DeviceStream for CpalCapture {
    fn stop(mut self: Box<Self>) -> Result<(), ReleaseError> {
        self.0.stop()
    }
}

fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    data.chunks(channels.max(1))
        .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

fn open_input(tx: mpsc::Sender<Vec<f32>>) -> VoiceResult<(cpal::Stream, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::UnsupportedEnvironment("no input device".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::UnsupportedEnvironment(e.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let channels = config.channels as usize;
    let on_error = |e: cpal::StreamError| warn!(error = %e, "Input stream error");

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                let _ = tx.try_send(downmix(data, channels, |s| s));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                let _ = tx.try_send(downmix(data, channels, |s| s as f32 / 32768.0));
            },
            on_error,
            None,
        ),
        other => {
            return Err(VoiceError::UnsupportedEnvironment(format!(
                "unsupported input sample format {other:?}"
            )));
        }
    }
    .map_err(build_error)?;
    Ok((stream, config.sample_rate.0))
}

/// Samples waiting for the output callback, plus completion markers for
/// buffers handed to [`AudioOutput::play`].
#[derive(Default)]
struct Playout {
    samples: VecDeque<f32>,
    written: u64,
    played: u64,
    markers: VecDeque<(u64, oneshot::Sender<()>)>,
}

impl Playout {
    fn enqueue(&mut self, samples: &[f32]) {
        self.samples.extend(samples);
        self.written += samples.len() as u64;
    }

    fn mark(&mut self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        if self.played >= self.written {
            let _ = done.send(());
        } else {
            self.markers.push_back((self.written, done));
        }
        rx
    }

    /// Fills one interleaved output buffer, padding with silence.
    fn fill<T>(&mut self, out: &mut [T], channels: usize, from_f32: impl Fn(f32) -> T)
    where
        T: Copy,
    {
        for frame in out.chunks_mut(channels.max(1)) {
            let sample = match self.samples.pop_front() {
                Some(s) => {
                    self.played += 1;
                    s
                }
                None => 0.0,
            };
            frame.fill(from_f32(sample));
        }
        while self.markers.front().is_some_and(|(end, _)| *end <= self.played) {
            if let Some((_, done)) = self.markers.pop_front() {
                let _ = done.send(());
            }
        }
    }

    /// Drops everything queued. Pending `play` receivers resolve as dropped.
    fn clear(&mut self) {
        self.samples.clear();
        self.played = self.written;
        self.markers.clear();
    }
}

fn open_output_stream(playout: Arc<Mutex<Playout>>) -> VoiceResult<(cpal::Stream, u32)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| VoiceError::UnsupportedEnvironment("no output device".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::UnsupportedEnvironment(e.to_string()))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let channels = config.channels as usize;
    let on_error = |e: cpal::StreamError| warn!(error = %e, "Output stream error");

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |out: &mut [f32], _| playout.lock().fill(out, channels, |s| s),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |out: &mut [i16], _| {
                playout
                    .lock()
                    .fill(out, channels, |s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            },
            on_error,
            None,
        ),
        other => {
            return Err(VoiceError::UnsupportedEnvironment(format!(
                "unsupported output sample format {other:?}"
            )));
        }
    }
    .map_err(build_error)?;
    Ok((stream, config.sample_rate.0))
}

/// Default speakers, fed at `sample_rate` and resampled to the device rate.
pub struct CpalOutput {
    sample_rate: u32,
    playout: Arc<Mutex<Playout>>,
    resampler: Mutex<StreamResampler>,
    thread: Mutex<StreamThread>,
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn write(&self, samples: &[f32]) {
        let converted = self.resampler.lock().process(samples);
        self.playout.lock().enqueue(&converted);
    }

    fn play(&self, samples: Vec<f32>) -> oneshot::Receiver<()> {
        let converted = self.resampler.lock().process(&samples);
        let mut playout = self.playout.lock();
        playout.enqueue(&converted);
        playout.mark()
    }

    fn stop(&self) {
        self.playout.lock().clear();
    }

    fn close(&self) -> Result<(), ReleaseError> {
        self.thread.lock().stop()
    }
}

/// The host's default input and output devices.
#[derive(Debug, Default)]
pub struct CpalDevices;

#[async_trait]
impl AudioDevices for CpalDevices {
    async fn open_microphone(&self, constraints: CaptureConstraints) -> VoiceResult<MicrophoneStream> {
        if constraints.echo_cancellation {
            debug!("Echo cancellation requested; cpal provides none, relying on the OS");
        }
        let (tx, frames) = mpsc::channel(CAPTURE_CHANNEL_DEPTH);
        let (thread, sample_rate) =
            StreamThread::spawn("voicelink-capture", move || open_input(tx)).await?;
        info!(sample_rate, requested = constraints.sample_rate, "Microphone opened");
        Ok(MicrophoneStream {
            sample_rate,
            frames,
            device: Box::new(CpalCapture(thread)),
        })
    }

    async fn open_output(&self, sample_rate: u32) -> VoiceResult<Arc<dyn AudioOutput>> {
        let playout = Arc::new(Mutex::new(Playout::default()));
        let shared = playout.clone();
        let (thread, device_rate) =
            StreamThread::spawn("voicelink-playback", move || open_output_stream(shared)).await?;
        info!(sample_rate, device_rate, "Speakers opened");
        Ok(Arc::new(CpalOutput {
            sample_rate,
            playout,
            resampler: Mutex::new(StreamResampler::new(sample_rate, device_rate)?),
            thread: Mutex::new(thread),
        }))
    }
}
